use std::path::PathBuf;

use thiserror::Error;

pub use anyhow::Context;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream rejected request with HTTP {status}")]
    HttpClient { status: u16 },
    #[error("upstream failed with HTTP {status}")]
    HttpServerOrRateLimit { status: u16 },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("storage I/O failed at {}: {source}", path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a fetch cycle is already in progress for `{0}`")]
    AlreadyInProgress(String),
    #[error("nothing stored for `{0}`")]
    NotFound(String),
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn message<T: Into<String>>(msg: T) -> Self {
        AppError::Message(msg.into())
    }

    pub fn storage<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        AppError::StorageIo {
            path: path.into(),
            source,
        }
    }

    /// Stable label used in status events and the fetch history.
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Network(_) | AppError::Reqwest(_) => "network",
            AppError::HttpClient { .. } => "http-client",
            AppError::HttpServerOrRateLimit { .. } => "http-server-or-rate-limit",
            AppError::Validation(_) => "validation",
            AppError::Parse(_) | AppError::Json(_) | AppError::Csv(_) => "parse",
            AppError::StorageIo { .. } | AppError::Io(_) => "storage-io",
            AppError::AlreadyInProgress(_) => "already-in-progress",
            AppError::NotFound(_) => "not-found",
            AppError::UnknownSource(_) => "unknown-source",
            AppError::Cancelled => "cancelled",
            AppError::Config(_) => "config",
            AppError::Join(_) | AppError::Message(_) | AppError::Other(_) => "internal",
        }
    }
}
