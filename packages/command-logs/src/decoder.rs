//! Incremental decoder for newline-delimited JSON command logs.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use sandbox_logs_error::LogsError;

use crate::types::CommandLog;

/// Raw response body of the logs endpoint.
pub type ByteStream = BoxStream<'static, Result<Bytes, LogsError>>;

/// Splits incoming bytes into complete lines and parses each one.
///
/// Lines are cut at the byte level. `\n` never occurs inside a multi-byte
/// UTF-8 sequence, so a character split across two reads is only decoded
/// once its line is complete.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and pushes every record it completes onto `out`.
    ///
    /// Records that precede a bad line are still pushed before the error is
    /// returned; the decoder must not be used after an error.
    pub fn push(
        &mut self,
        chunk: &[u8],
        out: &mut VecDeque<CommandLog>,
    ) -> Result<(), LogsError> {
        self.buffer.extend_from_slice(chunk);
        let Some(last_newline) = self.buffer.iter().rposition(|byte| *byte == b'\n') else {
            return Ok(());
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        for line in complete.split(|byte| *byte == b'\n') {
            if line.is_empty() {
                continue;
            }
            out.push_back(parse_line(line)?);
        }
        Ok(())
    }

    /// Bytes received after the last newline.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drops the unterminated tail and returns how many bytes were lost.
    pub fn discard_partial(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        discarded
    }
}

fn parse_line(line: &[u8]) -> Result<CommandLog, LogsError> {
    let text = String::from_utf8_lossy(line);
    serde_json::from_str::<CommandLog>(&text).map_err(|err| LogsError::InvalidLogLine {
        line: text.into_owned(),
        message: err.to_string(),
    })
}

struct DecodeState {
    body: ByteStream,
    decoder: LineDecoder,
    ready: VecDeque<CommandLog>,
    failure: Option<LogsError>,
    cancel: CancellationToken,
    done: bool,
}

/// Lazily decodes `body` into log records.
///
/// The sequence ends at end-of-data, on the first error, or as soon as
/// `cancel` fires. A read interrupted by cancellation is dropped and ends the
/// sequence quietly; any other read error is yielded once.
pub fn decode_log_stream(
    body: ByteStream,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<CommandLog, LogsError>> + Send + 'static {
    let state = DecodeState {
        body,
        decoder: LineDecoder::new(),
        ready: VecDeque::new(),
        failure: None,
        cancel,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(log) = state.ready.pop_front() {
                return Some((Ok(log), state));
            }
            if let Some(err) = state.failure.take() {
                state.done = true;
                return Some((Err(err), state));
            }
            if state.done || state.cancel.is_cancelled() {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return None,
                next = state.body.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if let Err(err) = state.decoder.push(&chunk, &mut state.ready) {
                        state.failure = Some(err);
                    }
                }
                Some(Err(err)) => {
                    if state.cancel.is_cancelled() {
                        return None;
                    }
                    state.done = true;
                    return Some((Err(err), state));
                }
                None => {
                    let discarded = state.decoder.discard_partial();
                    if discarded > 0 {
                        tracing::debug!(
                            discarded_bytes = discarded,
                            "log stream ended without trailing newline, dropping partial line"
                        );
                    }
                    return None;
                }
            }
        }
    })
}
