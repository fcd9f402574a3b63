//! Wire and state types for sandbox commands and their logs.

use serde::{Deserialize, Deserializer, Serialize};

/// Which output stream a log record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of the `/logs` stream.
///
/// `data` is the raw chunk the command wrote and may itself contain newlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLog {
    pub data: String,
    pub stream: LogStream,
    /// Epoch milliseconds.
    #[serde(deserialize_with = "deserialize_epoch_ms")]
    pub timestamp: i64,
}

/// A command running (or finished) inside a sandbox, as tracked by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub sandbox_id: String,
    pub cmd_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(deserialize_with = "deserialize_epoch_ms")]
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<CommandLog>,
}

impl Command {
    pub fn key(&self) -> CommandKey {
        CommandKey::new(&self.sandbox_id, &self.cmd_id)
    }
}

/// Identity of a command: `(sandboxId, cmdId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandKey {
    pub sandbox_id: String,
    pub cmd_id: String,
}

impl CommandKey {
    pub fn new(sandbox_id: impl Into<String>, cmd_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            cmd_id: cmd_id.into(),
        }
    }
}

impl std::fmt::Display for CommandKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.sandbox_id, self.cmd_id)
    }
}

/// Body of `GET /api/sandboxes/{sandboxId}/cmds/{cmdId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatus {
    pub sandbox_id: String,
    pub cmd_id: String,
    #[serde(deserialize_with = "deserialize_epoch_ms")]
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Accepts any JSON number as epoch milliseconds.
///
/// Integers pass through. Floats (`1.7e12`, `1700000000000.5`) are truncated
/// toward zero and saturate at the `i64` bounds.
fn deserialize_epoch_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EpochMs {
        Int(i64),
        Float(f64),
    }

    Ok(match EpochMs::deserialize(deserializer)? {
        EpochMs::Int(ms) => ms,
        EpochMs::Float(ms) => ms as i64,
    })
}

/// Emitted once per decoded log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub sandbox_id: String,
    pub cmd_id: String,
    pub log: CommandLog,
}

/// Emitted once a log stream drained and the final status was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedCommand {
    pub sandbox_id: String,
    pub cmd_id: String,
    pub started_at: i64,
    pub exit_code: i32,
    pub command: String,
    pub args: Vec<String>,
}

impl CompletedCommand {
    /// Merges the authoritative status with the command line the caller knows.
    /// A missing exit code is reported as `0`.
    pub fn merge(command: &Command, status: CommandStatus) -> Self {
        Self {
            sandbox_id: status.sandbox_id,
            cmd_id: status.cmd_id,
            started_at: status.started_at,
            exit_code: status.exit_code.unwrap_or(0),
            command: command.command.clone(),
            args: command.args.clone(),
        }
    }
}

/// Channel form of the controller callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    Log(LogEvent),
    Completed(CompletedCommand),
}
