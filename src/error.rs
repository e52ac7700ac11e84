use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JupyError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("docker CLI not found; install Docker and ensure `docker` is on your PATH")]
    DockerNotFound,
    #[error("docker daemon is not running or unreachable\nHint: {hint}")]
    DaemonUnreachable { hint: String },
    #[error("environment is not configured; run `jupyagent setup` first")]
    NotConfigured,
    #[error("another jupyagent instance is using this environment (lock held on {})", .0.display())]
    Locked(PathBuf),
    #[error("build failed: {0}")]
    BuildFailed(Box<JupyError>),
    #[error("start failed: {0}")]
    StartFailed(Box<JupyError>),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

impl JupyError {
    /// Startup conditions that must end the process before any stateful flow.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(self, Self::DockerNotFound | Self::DaemonUnreachable { .. })
    }

    pub fn process_details(&self) -> Option<&ProcessErrorDetails> {
        match self {
            Self::ProcessDetailed { details, .. } => Some(details),
            Self::BuildFailed(inner) | Self::StartFailed(inner) => inner.process_details(),
            _ => None,
        }
    }
}
