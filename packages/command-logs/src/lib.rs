//! Client for following the logs of commands running in remote sandboxes.

pub mod cli;
pub mod client;
pub mod controller;
pub mod decoder;
pub mod store;
pub mod types;
pub mod view;

pub use client::{ClientConfig, CommandSource, SandboxClient};
pub use controller::{CommandLogController, CommandLogListener, Session, SessionState};
pub use decoder::{decode_log_stream, ByteStream, LineDecoder};
pub use sandbox_logs_error::{ErrorType, LogsError, ProblemDetails};
pub use store::{DebouncedStore, FileStorage, MemoryStorage, Storage};
pub use types::{
    Command, CommandEvent, CommandKey, CommandLog, CommandStatus, CompletedCommand, LogEvent,
    LogStream,
};
