use serde::Serialize;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("timed out after {:.3}s waiting for {what}; last observed: {last_state}", elapsed.as_secs_f64())]
    Timeout {
        what: String,
        elapsed: Duration,
        last_state: String,
    },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("misuse: {0}")]
    Misuse(String),
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("disconnected: {0}")]
    Disconnected(String),
}

impl HarnessError {
    pub fn details(&self) -> Option<&ProcessErrorDetails> {
        match self {
            Self::ProcessDetailed { details, .. } => Some(details),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
