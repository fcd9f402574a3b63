//! Folding controller events into a [`Command`] and rendering its transcript.

use time::macros::format_description;
use time::OffsetDateTime;

use crate::types::{Command, CommandEvent};

/// Applies an event to the command it belongs to.
///
/// Returns `false` and leaves `command` untouched when the event is for a
/// different `(sandboxId, cmdId)`.
pub fn apply_event(command: &mut Command, event: &CommandEvent) -> bool {
    match event {
        CommandEvent::Log(event) => {
            if event.sandbox_id != command.sandbox_id || event.cmd_id != command.cmd_id {
                return false;
            }
            command.logs.push(event.log.clone());
        }
        CommandEvent::Completed(completed) => {
            if completed.sandbox_id != command.sandbox_id || completed.cmd_id != command.cmd_id {
                return false;
            }
            command.exit_code = Some(completed.exit_code);
            command.started_at = completed.started_at;
        }
    }
    true
}

/// `HH:MM:SS` (24-hour) of an epoch-millisecond timestamp, in UTC.
///
/// Rendered in UTC rather than local time: `time` only reads the local offset
/// while the process is single-threaded, and the CLI formats from inside a
/// multi-threaded runtime where that lookup fails.
pub fn format_clock(epoch_ms: i64) -> String {
    let nanos = i128::from(epoch_ms) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|at| at.format(format_description!("[hour]:[minute]:[second]")).ok())
        .unwrap_or_else(|| "--:--:--".to_string())
}

/// Header line.
pub fn render_header(command: &Command) -> String {
    format!(
        "[{}] {} {}\n",
        format_clock(command.started_at),
        command.command,
        command.args.join(" ")
    )
}

/// Header followed by every log chunk in arrival order.
pub fn render_transcript(command: &Command) -> String {
    let mut transcript = render_header(command);
    for log in &command.logs {
        transcript.push_str(&log.data);
    }
    transcript
}
