use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use sandbox_command_logs::cli::{cached_transcript, tail, transcript_key};
use sandbox_command_logs::{
    ClientConfig, Command, CommandEvent, CommandLogController, DebouncedStore, FileStorage,
    LogsError, SandboxClient, SessionState, Storage,
};

const TOKEN: &str = "secret-token";

#[derive(Clone)]
struct FakeSandbox {
    chunks: Arc<Vec<&'static str>>,
    hang_after_chunks: bool,
    started_at: Value,
    status_calls: Arc<AtomicUsize>,
}

impl FakeSandbox {
    fn new(chunks: Vec<&'static str>) -> Self {
        Self {
            chunks: Arc::new(chunks),
            hang_after_chunks: false,
            started_at: json!(1_700_000_000_000u64),
            status_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn hanging(mut self) -> Self {
        self.hang_after_chunks = true;
        self
    }

    fn started_at(mut self, started_at: Value) -> Self {
        self.started_at = started_at;
        self
    }
}

async fn logs_handler(
    State(fake): State<FakeSandbox>,
    Path((sandbox_id, _cmd_id)): Path<(String, String)>,
) -> Response {
    if sandbox_id == "missing" {
        return problem(StatusCode::NOT_FOUND, "sandbox not found");
    }

    let chunks: Vec<&'static str> = fake.chunks.iter().copied().collect();
    let body = stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes()))
    });
    let body = if fake.hang_after_chunks {
        body.chain(stream::pending()).boxed()
    } else {
        body.boxed()
    };
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body))
        .expect("response")
}

async fn status_handler(
    State(fake): State<FakeSandbox>,
    Path((sandbox_id, cmd_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    fake.status_calls.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(format!("Bearer {TOKEN}").as_str());
    if !authorized {
        return problem(StatusCode::UNAUTHORIZED, "token required");
    }
    Json(json!({
        "sandboxId": sandbox_id,
        "cmdId": cmd_id,
        "startedAt": fake.started_at,
        "exitCode": 3
    }))
    .into_response()
}

fn problem(status: StatusCode, detail: &str) -> Response {
    (
        status,
        Json(json!({
            "type": "urn:sandbox:error:request",
            "title": status.canonical_reason().unwrap_or("Error"),
            "status": status.as_u16(),
            "detail": detail
        })),
    )
        .into_response()
}

async fn spawn_fake(fake: FakeSandbox) -> String {
    let app = Router::new()
        .route("/api/sandboxes/:sandbox_id/cmds/:cmd_id/logs", get(logs_handler))
        .route("/api/sandboxes/:sandbox_id/cmds/:cmd_id", get(status_handler))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake sandbox");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve fake sandbox");
    });
    format!("http://{addr}")
}

fn client(base_url: &str, token: Option<&str>) -> SandboxClient {
    let config = ClientConfig::new(base_url)
        .expect("config")
        .with_token(token.map(str::to_string));
    SandboxClient::new(config).expect("client")
}

fn command(sandbox_id: &str) -> Command {
    Command {
        sandbox_id: sandbox_id.to_string(),
        cmd_id: "cmd_1".to_string(),
        command: "echo".to_string(),
        args: vec!["hello".to_string()],
        started_at: 0,
        exit_code: None,
        logs: Vec::new(),
    }
}

async fn drain(mut events: mpsc::UnboundedReceiver<CommandEvent>) -> Vec<CommandEvent> {
    let mut collected = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("listener released")
    {
        collected.push(event);
    }
    collected
}

fn log_data(events: &[CommandEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            CommandEvent::Log(event) => Some(event.log.data.clone()),
            CommandEvent::Completed(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn streams_split_records_and_completes_with_status() {
    let fake = FakeSandbox::new(vec![
        "{\"data\":\"hello\\n\",\"stream\":\"stdout\",\"timestamp\":1}\n{\"data\":\"wor",
        "ld\\n\",\"stream\":\"stdout\",\"timestamp\":2}\n",
        "{\"data\":\"partial\",\"stream\":\"stdout\"",
    ]);
    let status_calls = fake.status_calls.clone();
    let base_url = spawn_fake(fake).await;

    let controller = CommandLogController::new(client(&base_url, Some(TOKEN)));
    let (tx, rx) = mpsc::unbounded_channel::<CommandEvent>();
    let session = controller
        .activate(&command("sbx_1"), Arc::new(tx))
        .expect("session");

    assert_eq!(session.finished().await, SessionState::Completed);
    let events = drain(rx).await;
    assert_eq!(log_data(&events), vec!["hello\n", "world\n"]);

    match events.last() {
        Some(CommandEvent::Completed(completed)) => {
            assert_eq!(completed.sandbox_id, "sbx_1");
            assert_eq!(completed.exit_code, 3);
            assert_eq!(completed.started_at, 1_700_000_000_000);
            assert_eq!(completed.command, "echo");
            assert_eq!(completed.args, vec!["hello".to_string()]);
        }
        other => panic!("expected completion last, got {other:?}"),
    }
    assert_eq!(status_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deactivating_mid_stream_stops_callbacks() {
    let fake = FakeSandbox::new(vec![
        "{\"data\":\"first\",\"stream\":\"stderr\",\"timestamp\":1}\n",
    ])
    .hanging();
    let status_calls = fake.status_calls.clone();
    let base_url = spawn_fake(fake).await;

    let controller = CommandLogController::new(client(&base_url, Some(TOKEN)));
    let (tx, mut rx) = mpsc::unbounded_channel::<CommandEvent>();
    let session = controller
        .activate(&command("sbx_1"), Arc::new(tx))
        .expect("session");

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first record in time")
        .expect("first record");
    assert_eq!(log_data(&[first]), vec!["first"]);

    assert!(controller.deactivate("sbx_1", "cmd_1"));
    assert_eq!(session.finished().await, SessionState::Canceled);
    assert!(drain(rx).await.is_empty());
    assert_eq!(status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_status_fetch_fails_session() {
    let fake = FakeSandbox::new(vec![
        "{\"data\":\"only\",\"stream\":\"stdout\",\"timestamp\":1}\n",
    ]);
    let base_url = spawn_fake(fake).await;

    let controller = CommandLogController::new(client(&base_url, None));
    let (tx, rx) = mpsc::unbounded_channel::<CommandEvent>();
    let session = controller
        .activate(&command("sbx_1"), Arc::new(tx))
        .expect("session");

    assert_eq!(session.finished().await, SessionState::Failed);
    let events = drain(rx).await;
    assert_eq!(log_data(&events), vec!["only"]);
    assert!(events
        .iter()
        .all(|event| matches!(event, CommandEvent::Log(_))));
}

#[tokio::test]
async fn status_errors_carry_problem_details() {
    let base_url = spawn_fake(FakeSandbox::new(vec![])).await;

    let err = client(&base_url, None)
        .fetch_status("sbx_1", "cmd_1")
        .await
        .expect_err("unauthorized");
    match err {
        LogsError::HttpStatus { status, problem } => {
            assert_eq!(status, 401);
            let problem = problem.expect("problem details");
            assert_eq!(problem.detail.as_deref(), Some("token required"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let status = client(&base_url, Some(TOKEN))
        .fetch_status("sbx_1", "cmd_1")
        .await
        .expect("status");
    assert_eq!(status.exit_code, Some(3));
}

#[tokio::test]
async fn missing_log_stream_fails_session() {
    let base_url = spawn_fake(FakeSandbox::new(vec![])).await;

    match client(&base_url, Some(TOKEN)).open_logs("missing", "cmd_1").await {
        Err(LogsError::HttpStatus { status, .. }) => assert_eq!(status, 404),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected 404"),
    }

    let controller = CommandLogController::new(client(&base_url, Some(TOKEN)));
    let (tx, rx) = mpsc::unbounded_channel::<CommandEvent>();
    let session = controller
        .activate(&command("missing"), Arc::new(tx))
        .expect("session");
    assert_eq!(session.finished().await, SessionState::Failed);
    assert!(drain(rx).await.is_empty());
}

#[tokio::test]
async fn status_accepts_float_started_at() {
    for started_at in [json!(1.7e12), json!(1_700_000_000_000.5)] {
        let base_url = spawn_fake(FakeSandbox::new(vec![]).started_at(started_at)).await;
        let status = client(&base_url, Some(TOKEN))
            .fetch_status("sbx_1", "cmd_1")
            .await
            .expect("status");
        assert_eq!(status.started_at, 1_700_000_000_000);
    }
}

#[tokio::test]
async fn tail_exits_with_command_code_and_caches_transcript() {
    let fake = FakeSandbox::new(vec![
        "{\"data\":\"hello\\n\",\"stream\":\"stdout\",\"timestamp\":1}\n",
        "{\"data\":\"oops\\n\",\"stream\":\"stderr\",\"timestamp\":2.5}\n",
    ]);
    let base_url = spawn_fake(fake).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("storage.json");

    let store = DebouncedStore::new(Arc::new(FileStorage::open(&path)));
    let exit_code = tail(
        client(&base_url, Some(TOKEN)),
        &store,
        command("sbx_1"),
        std::future::pending::<()>(),
    )
    .await
    .expect("tail");
    assert_eq!(exit_code, 3);
    drop(store);

    let expected = "[22:13:20] echo hello\nhello\noops\n";
    let persisted = FileStorage::open(&path);
    assert_eq!(
        persisted.get_item(&transcript_key("sbx_1", "cmd_1")).as_deref(),
        Some(expected)
    );
    assert_eq!(persisted.get_item("logs:sbx_1:cmd_1").as_deref(), Some(expected));

    let reopened = DebouncedStore::new(Arc::new(persisted));
    assert_eq!(cached_transcript(&reopened, "sbx_1", "cmd_1"), expected);
    assert_eq!(cached_transcript(&reopened, "sbx_1", "cmd_2"), "");
}

#[tokio::test]
async fn interrupted_tail_exits_with_130() {
    let fake = FakeSandbox::new(vec![
        "{\"data\":\"first\\n\",\"stream\":\"stdout\",\"timestamp\":1}\n",
    ])
    .hanging();
    let status_calls = fake.status_calls.clone();
    let base_url = spawn_fake(fake).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let store = DebouncedStore::new(Arc::new(FileStorage::open(dir.path().join("storage.json"))));
    let exit_code = tokio::time::timeout(
        Duration::from_secs(5),
        tail(
            client(&base_url, Some(TOKEN)),
            &store,
            command("sbx_1"),
            tokio::time::sleep(Duration::from_millis(200)),
        ),
    )
    .await
    .expect("interrupt ends tail")
    .expect("tail");

    assert_eq!(exit_code, 130);
    assert_eq!(status_calls.load(Ordering::SeqCst), 0);
}
