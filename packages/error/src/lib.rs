use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Network,
    HttpStatus,
    InvalidLogLine,
    InvalidStatus,
    Storage,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::Network => "urn:sandbox-logs:error:network",
            Self::HttpStatus => "urn:sandbox-logs:error:http_status",
            Self::InvalidLogLine => "urn:sandbox-logs:error:invalid_log_line",
            Self::InvalidStatus => "urn:sandbox-logs:error:invalid_status",
            Self::Storage => "urn:sandbox-logs:error:storage",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Network => "Network Error",
            Self::HttpStatus => "Unexpected HTTP Status",
            Self::InvalidLogLine => "Invalid Log Line",
            Self::InvalidStatus => "Invalid Command Status",
            Self::Storage => "Storage Error",
        }
    }
}

/// Error body returned by the sandbox service (RFC 7807 shape).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    /// Parses an error body, returning `None` when it is not a problem document.
    pub fn from_body(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }
}

#[derive(Debug, Error)]
pub enum LogsError {
    #[error("network error: {message}")]
    Network { message: String },
    #[error("unexpected http status {status}{}", problem_suffix(.problem))]
    HttpStatus {
        status: u16,
        problem: Option<ProblemDetails>,
    },
    #[error("invalid log line: {message}")]
    InvalidLogLine { line: String, message: String },
    #[error("invalid command status: {message}")]
    InvalidStatus { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl LogsError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Network { .. } => ErrorType::Network,
            Self::HttpStatus { .. } => ErrorType::HttpStatus,
            Self::InvalidLogLine { .. } => ErrorType::InvalidLogLine,
            Self::InvalidStatus { .. } => ErrorType::InvalidStatus,
            Self::Storage { .. } => ErrorType::Storage,
        }
    }

    /// True for shape failures of data the service sent us.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidLogLine { .. } | Self::InvalidStatus { .. }
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }
}

fn problem_suffix(problem: &Option<ProblemDetails>) -> String {
    match problem {
        Some(problem) => match &problem.detail {
            Some(detail) => format!(": {} ({detail})", problem.title),
            None => format!(": {}", problem.title),
        },
        None => String::new(),
    }
}
