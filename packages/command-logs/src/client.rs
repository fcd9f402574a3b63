//! HTTP access to the sandbox command endpoints.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Response};
use url::Url;

use sandbox_logs_error::{LogsError, ProblemDetails};

use crate::decoder::ByteStream;
use crate::types::CommandStatus;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:3000";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where command logs and statuses come from.
///
/// Dropping a returned future or stream aborts the underlying request.
pub trait CommandSource: Send + Sync + 'static {
    /// Opens the raw newline-delimited log body of a command.
    fn open_logs<'a>(
        &'a self,
        sandbox_id: &'a str,
        cmd_id: &'a str,
    ) -> BoxFuture<'a, Result<ByteStream, LogsError>>;

    /// Fetches the terminal metadata of a command. Single attempt.
    fn fetch_status<'a>(
        &'a self,
        sandbox_id: &'a str,
        cmd_id: &'a str,
    ) -> BoxFuture<'a, Result<CommandStatus, LogsError>>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Url,
    pub token: Option<String>,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: &str) -> Result<Self, LogsError> {
        let endpoint = Url::parse(endpoint).map_err(|err| {
            LogsError::network(format!("invalid endpoint `{endpoint}`: {err}"))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(LogsError::network(format!(
                "endpoint `{endpoint}` cannot be used as a base url"
            )));
        }
        Ok(Self {
            endpoint,
            token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

/// Client for `/api/sandboxes/{sandboxId}/cmds/{cmdId}[/logs]`.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    config: ClientConfig,
    http: Client,
}

impl SandboxClient {
    pub fn new(config: ClientConfig) -> Result<Self, LogsError> {
        // No overall request timeout: log streams stay open as long as the command runs.
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(network_error)?;
        Ok(Self { config, http })
    }

    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }

    /// Builds `{endpoint}/api/sandboxes/{sandboxId}/cmds/{cmdId}` plus `extra` segments,
    /// percent-encoding every id.
    pub fn command_url(&self, sandbox_id: &str, cmd_id: &str, extra: &[&str]) -> Url {
        let mut url = self.config.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "sandboxes", sandbox_id, "cmds", cmd_id])
                .extend(extra);
        }
        url
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let mut builder = self.http.get(url);
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    pub async fn open_logs(&self, sandbox_id: &str, cmd_id: &str) -> Result<ByteStream, LogsError> {
        let url = self.command_url(sandbox_id, cmd_id, &["logs"]);
        tracing::debug!(sandbox_id, cmd_id, url = %url, "opening command log stream");
        let response = self
            .get(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .send()
            .await
            .map_err(network_error)?;
        let response = ensure_success(response).await?;
        Ok(response.bytes_stream().map_err(network_error).boxed())
    }

    pub async fn fetch_status(
        &self,
        sandbox_id: &str,
        cmd_id: &str,
    ) -> Result<CommandStatus, LogsError> {
        let url = self.command_url(sandbox_id, cmd_id, &[]);
        let response = self.get(url).send().await.map_err(network_error)?;
        let response = ensure_success(response).await?;
        let text = response.text().await.map_err(network_error)?;
        serde_json::from_str(&text).map_err(|err| LogsError::InvalidStatus {
            message: err.to_string(),
        })
    }
}

impl CommandSource for SandboxClient {
    fn open_logs<'a>(
        &'a self,
        sandbox_id: &'a str,
        cmd_id: &'a str,
    ) -> BoxFuture<'a, Result<ByteStream, LogsError>> {
        SandboxClient::open_logs(self, sandbox_id, cmd_id).boxed()
    }

    fn fetch_status<'a>(
        &'a self,
        sandbox_id: &'a str,
        cmd_id: &'a str,
    ) -> BoxFuture<'a, Result<CommandStatus, LogsError>> {
        SandboxClient::fetch_status(self, sandbox_id, cmd_id).boxed()
    }
}

async fn ensure_success(response: Response) -> Result<Response, LogsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LogsError::HttpStatus {
        status: status.as_u16(),
        problem: ProblemDetails::from_body(&body),
    })
}

fn network_error(err: reqwest::Error) -> LogsError {
    LogsError::network(err.to_string())
}
