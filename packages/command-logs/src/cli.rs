use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sandbox_logs_error::LogsError;

use crate::client::{ClientConfig, SandboxClient, DEFAULT_ENDPOINT};
use crate::controller::{CommandLogController, SessionState};
use crate::store::{DebouncedStore, FileStorage, Storage};
use crate::types::{Command, CommandEvent, LogStream};
use crate::view::{apply_event, render_transcript};

/// Exit code used when the stream is interrupted with Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "sandbox-command-logs", bin_name = "sandbox-command-logs")]
#[command(about = "Stream the logs of a command running in a remote sandbox", version)]
#[command(arg_required_else_help = true)]
pub struct CommandLogsCli {
    #[command(subcommand)]
    command: CliCommand,

    #[arg(long, short = 'e', global = true, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    #[arg(long, short = 't', global = true)]
    token: Option<String>,

    #[arg(long, short = 'n', global = true)]
    no_token: bool,

    /// JSON file holding cached transcripts.
    #[arg(long, global = true)]
    storage_path: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Follow a command's logs until it exits.
    Tail(TailArgs),
    /// Print a command's final status.
    Status(CommandTarget),
    /// Print the transcript saved by the last `tail`.
    Cached(CommandTarget),
}

#[derive(Args, Debug)]
pub struct CommandTarget {
    sandbox_id: String,
    cmd_id: String,
}

#[derive(Args, Debug)]
pub struct TailArgs {
    #[command(flatten)]
    target: CommandTarget,
    /// Command line shown in the transcript header.
    #[arg(long, short = 'c', default_value = "")]
    command: String,
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Logs(#[from] LogsError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("log session ended as {0:?}")]
    Session(SessionState),
}

/// Parses the command line, runs it, and returns the process exit code.
pub fn run_command_logs() -> Result<i32, CliError> {
    let cli = CommandLogsCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_command(cli))
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

async fn run_command(cli: CommandLogsCli) -> Result<i32, CliError> {
    let token = if cli.no_token { None } else { cli.token };
    let config = ClientConfig::new(&cli.endpoint)?.with_token(token);
    let storage_path = cli.storage_path.unwrap_or_else(FileStorage::default_path);

    match cli.command {
        CliCommand::Tail(args) => {
            let client = SandboxClient::new(config)?;
            let store = DebouncedStore::new(Arc::new(FileStorage::open(storage_path)));
            let TailArgs {
                target,
                command,
                args,
            } = args;
            let command = Command {
                sandbox_id: target.sandbox_id,
                cmd_id: target.cmd_id,
                command,
                args,
                started_at: now_ms(),
                exit_code: None,
                logs: Vec::new(),
            };
            let interrupt = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %err, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            };
            tail(client, &store, command, interrupt).await
        }
        CliCommand::Status(target) => {
            let client = SandboxClient::new(config)?;
            let status = client
                .fetch_status(&target.sandbox_id, &target.cmd_id)
                .await?;
            write_stdout_line(&serde_json::to_string_pretty(&status)?)?;
            Ok(0)
        }
        CliCommand::Cached(target) => {
            let store = DebouncedStore::new(Arc::new(FileStorage::open(storage_path)));
            write_stdout(&cached_transcript(&store, &target.sandbox_id, &target.cmd_id))?;
            Ok(0)
        }
    }
}

/// Streams `command` to stdout/stderr until it completes or `interrupt`
/// resolves, keeping its transcript in `store`.
///
/// Returns the command's exit code, or 130 when interrupted.
pub async fn tail<S, F>(
    client: SandboxClient,
    store: &DebouncedStore<S>,
    mut command: Command,
    interrupt: F,
) -> Result<i32, CliError>
where
    S: Storage,
    F: Future<Output = ()>,
{
    let key = transcript_key(&command.sandbox_id, &command.cmd_id);
    tracing::info!(
        endpoint = %client.endpoint(),
        sandbox_id = %command.sandbox_id,
        cmd_id = %command.cmd_id,
        "following command logs"
    );

    let controller = CommandLogController::new(client);
    let (tx, mut rx) = mpsc::unbounded_channel::<CommandEvent>();
    let Some(session) = controller.activate(&command, Arc::new(tx)) else {
        return Err(CliError::Session(SessionState::Streaming));
    };

    tokio::pin!(interrupt);
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                if let CommandEvent::Log(log) = &event {
                    match log.log.stream {
                        LogStream::Stdout => write_stdout(&log.log.data)?,
                        LogStream::Stderr => write_stderr(&log.log.data)?,
                    }
                }
                apply_event(&mut command, &event);
                store.write(&key, render_transcript(&command));
            }
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                let target = session.key();
                controller.deactivate(&target.sandbox_id, &target.cmd_id);
            }
        }
    }

    match session.finished().await {
        SessionState::Completed => {
            store.flush();
            let exit_code = command.exit_code.unwrap_or(0);
            tracing::info!(
                command = %session.key(),
                exit_code,
                lines = command.logs.len(),
                "command finished"
            );
            Ok(exit_code)
        }
        SessionState::Canceled => Ok(INTERRUPTED_EXIT_CODE),
        state => Err(CliError::Session(state)),
    }
}

/// Transcript saved by the last `tail` of this command, or `""`.
pub fn cached_transcript<S: Storage>(
    store: &DebouncedStore<S>,
    sandbox_id: &str,
    cmd_id: &str,
) -> String {
    store.read(&transcript_key(sandbox_id, cmd_id))
}

pub fn transcript_key(sandbox_id: &str, cmd_id: &str) -> String {
    format!("logs:{sandbox_id}:{cmd_id}")
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn write_stdout(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr(text: &str) -> Result<(), CliError> {
    let mut err = std::io::stderr();
    err.write_all(text.as_bytes())?;
    err.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        CommandLogsCli::command().debug_assert();
    }

    #[test]
    fn tail_collects_trailing_args() {
        let cli = CommandLogsCli::try_parse_from([
            "sandbox-command-logs",
            "tail",
            "sbx_1",
            "cmd_1",
            "--command",
            "npm",
            "--",
            "run",
            "build",
        ])
        .expect("parse");

        match cli.command {
            CliCommand::Tail(args) => {
                assert_eq!(args.target.sandbox_id, "sbx_1");
                assert_eq!(args.target.cmd_id, "cmd_1");
                assert_eq!(args.command, "npm");
                assert_eq!(args.args, vec!["run".to_string(), "build".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn transcript_keys_are_scoped_per_command() {
        assert_eq!(transcript_key("sbx_1", "cmd_1"), "logs:sbx_1:cmd_1");
    }
}
