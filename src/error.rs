use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        stderr_tail: String,
    },
    #[error("invalid backup: {0}")]
    InvalidBackup(String),
    #[error("archive entry escapes destination: {path}")]
    PathTraversal { path: String },
    #[error("archive error: {0}")]
    Archive(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("operation cancelled")]
    Cancelled,
}

impl WardenError {
    /// Recent gateway stderr attached to the error, if any.
    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            WardenError::ProcessDetailed { stderr_tail, .. } => Some(stderr_tail.as_str()),
            _ => None,
        }
    }
}

pub type Result<T, E = WardenError> = std::result::Result<T, E>;
