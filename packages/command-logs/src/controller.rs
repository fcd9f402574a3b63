//! Per-command log sessions: stream, reconcile with the final status, report.
//!
//! A session is started by [`CommandLogController::activate`] and lives until
//! it completes, fails, or is deactivated. Listener calls for one session are
//! serialized and stop for good once [`CommandLogController::deactivate`]
//! returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use sandbox_logs_error::LogsError;

use crate::client::CommandSource;
use crate::decoder::decode_log_stream;
use crate::types::{Command, CommandEvent, CommandKey, CompletedCommand, LogEvent};

/// Receives the output of a session.
///
/// Calls happen on the session task. A listener must not deactivate its own
/// session from inside a callback.
pub trait CommandLogListener: Send + Sync + 'static {
    fn on_log(&self, event: LogEvent);
    fn on_completed(&self, completed: CompletedCommand);
}

impl CommandLogListener for mpsc::UnboundedSender<CommandEvent> {
    fn on_log(&self, event: LogEvent) {
        let _ = self.send(CommandEvent::Log(event));
    }

    fn on_completed(&self, completed: CompletedCommand) {
        let _ = self.send(CommandEvent::Completed(completed));
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session for this command
    Idle,
    /// Reading the log stream or fetching the final status
    Streaming,
    /// Stream drained and completion reported
    Completed,
    /// Deactivated before completion
    Canceled,
    /// Stream or status fetch failed
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }
}

/// Serializes listener calls against deactivation.
#[derive(Debug)]
struct EmitGate {
    open: Mutex<bool>,
}

impl EmitGate {
    fn new() -> Self {
        Self {
            open: Mutex::new(true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `emit` unless the gate was closed. Returns whether it ran.
    fn emit(&self, emit: impl FnOnce()) -> bool {
        let open = self.lock();
        if !*open {
            return false;
        }
        emit();
        true
    }

    /// Waits for an in-flight emission, then refuses all later ones.
    fn close(&self) {
        *self.lock() = false;
    }
}

/// Handle to one activation of a command.
#[derive(Debug, Clone)]
pub struct Session {
    key: CommandKey,
    cancel: CancellationToken,
    gate: Arc<EmitGate>,
    state: watch::Receiver<SessionState>,
}

impl Session {
    pub fn key(&self) -> &CommandKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Resolves once the session reached a terminal state.
    pub async fn finished(&self) -> SessionState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }

    /// Idempotent. No listener call starts after this returns.
    fn cancel(&self) {
        self.cancel.cancel();
        self.gate.close();
    }
}

/// Owns the log sessions of the commands shown by one view.
pub struct CommandLogController<S: CommandSource> {
    source: Arc<S>,
    sessions: Mutex<HashMap<CommandKey, Session>>,
}

impl<S: CommandSource> CommandLogController<S> {
    pub fn new(source: S) -> Self {
        Self::with_source(Arc::new(source))
    }

    pub fn with_source(source: Arc<S>) -> Self {
        Self {
            source,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<CommandKey, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts streaming `command` into `listener`.
    ///
    /// Returns `None` without side effects while a session for the same
    /// `(sandboxId, cmdId)` is held, whatever its state. Must be called from
    /// within a Tokio runtime.
    pub fn activate<L>(&self, command: &Command, listener: Arc<L>) -> Option<Session>
    where
        L: CommandLogListener + ?Sized,
    {
        let key = command.key();
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(&key) {
            tracing::debug!(
                sandbox_id = %key.sandbox_id,
                cmd_id = %key.cmd_id,
                state = ?existing.state(),
                "command log session already held, ignoring activation"
            );
            return None;
        }

        let (state_tx, state_rx) = watch::channel(SessionState::Streaming);
        let session = Session {
            key: key.clone(),
            cancel: CancellationToken::new(),
            gate: Arc::new(EmitGate::new()),
            state: state_rx,
        };
        sessions.insert(key, session.clone());
        drop(sessions);

        tracing::debug!(
            sandbox_id = %command.sandbox_id,
            cmd_id = %command.cmd_id,
            "starting command log session"
        );
        tokio::spawn(run_session(
            self.source.clone(),
            command.clone(),
            listener,
            session.cancel.clone(),
            session.gate.clone(),
            state_tx,
        ));
        Some(session)
    }

    /// Cancels and forgets the session for a command. Returns whether one existed.
    pub fn deactivate(&self, sandbox_id: &str, cmd_id: &str) -> bool {
        let key = CommandKey::new(sandbox_id, cmd_id);
        let session = self.sessions().remove(&key);
        match session {
            Some(session) => {
                session.cancel();
                tracing::debug!(
                    sandbox_id,
                    cmd_id,
                    state = ?session.state(),
                    "command log session deactivated"
                );
                true
            }
            None => false,
        }
    }

    pub fn session(&self, sandbox_id: &str, cmd_id: &str) -> Option<Session> {
        self.sessions()
            .get(&CommandKey::new(sandbox_id, cmd_id))
            .cloned()
    }

    pub fn state(&self, sandbox_id: &str, cmd_id: &str) -> SessionState {
        self.session(sandbox_id, cmd_id)
            .map(|session| session.state())
            .unwrap_or(SessionState::Idle)
    }
}

impl<S: CommandSource> Drop for CommandLogController<S> {
    fn drop(&mut self) {
        for (_, session) in self.sessions().drain() {
            session.cancel();
        }
    }
}

async fn run_session<S, L>(
    source: Arc<S>,
    command: Command,
    listener: Arc<L>,
    cancel: CancellationToken,
    gate: Arc<EmitGate>,
    state: watch::Sender<SessionState>,
) where
    S: CommandSource,
    L: CommandLogListener + ?Sized,
{
    let outcome = stream_command(source.as_ref(), &command, listener.as_ref(), &cancel, &gate).await;
    let final_state = match outcome {
        Ok(true) => SessionState::Completed,
        Ok(false) => SessionState::Canceled,
        Err(err) if cancel.is_cancelled() => {
            tracing::debug!(
                sandbox_id = %command.sandbox_id,
                cmd_id = %command.cmd_id,
                error = %err,
                "command log session canceled mid-request"
            );
            SessionState::Canceled
        }
        Err(err) => {
            tracing::error!(
                sandbox_id = %command.sandbox_id,
                cmd_id = %command.cmd_id,
                error = %err,
                error_type = err.error_type().as_urn(),
                error_title = err.error_type().title(),
                "error streaming command logs"
            );
            SessionState::Failed
        }
    };
    state.send_replace(final_state);
}

/// Returns `Ok(true)` once completion was reported, `Ok(false)` when canceled.
async fn stream_command<S, L>(
    source: &S,
    command: &Command,
    listener: &L,
    cancel: &CancellationToken,
    gate: &EmitGate,
) -> Result<bool, LogsError>
where
    S: CommandSource,
    L: CommandLogListener + ?Sized,
{
    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(false),
        body = source.open_logs(&command.sandbox_id, &command.cmd_id) => body?,
    };

    let logs = decode_log_stream(body, cancel.clone());
    futures::pin_mut!(logs);
    let mut lines = 0usize;
    while let Some(log) = logs.next().await {
        let event = LogEvent {
            sandbox_id: command.sandbox_id.clone(),
            cmd_id: command.cmd_id.clone(),
            log: log?,
        };
        if !gate.emit(|| listener.on_log(event)) {
            return Ok(false);
        }
        lines += 1;
    }
    if cancel.is_cancelled() {
        return Ok(false);
    }

    tracing::debug!(
        sandbox_id = %command.sandbox_id,
        cmd_id = %command.cmd_id,
        lines,
        "command log stream drained, fetching status"
    );
    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(false),
        status = source.fetch_status(&command.sandbox_id, &command.cmd_id) => status?,
    };

    let completed = CompletedCommand::merge(command, status);
    Ok(gate.emit(|| listener.on_completed(completed)))
}
