use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Request cancelled")]
    Cancelled,

    #[error("Component already disposed")]
    Disposed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Checksum mismatch for table '{table}': local {local}, remote {remote}")]
    ChecksumMismatch {
        table: String,
        local: String,
        remote: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ResilienceResult<T> = Result<T, ResilienceError>;

impl ResilienceError {
    /// True for intentional rejections (`cancel_all`, dispose during backoff).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResilienceError::Cancelled)
    }

    /// Failures the request queue retries. Everything that is not a
    /// cancellation or a local misuse counts as a failed attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResilienceError::Timeout(_)
                | ResilienceError::Transport(_)
                | ResilienceError::HttpStatus { .. }
        )
    }
}

impl serde::Serialize for ResilienceError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<rocksdb::Error> for ResilienceError {
    fn from(err: rocksdb::Error) -> Self {
        ResilienceError::Storage(err.into_string())
    }
}

impl From<rusqlite::Error> for ResilienceError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
                ResilienceError::QuotaExceeded(err.to_string())
            }
            _ => ResilienceError::Storage(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for ResilienceError {
    fn from(err: reqwest::Error) -> Self {
        ResilienceError::Transport(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ResilienceError {
    fn from(err: tokio::task::JoinError) -> Self {
        ResilienceError::Storage(format!("Task error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ResilienceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ResilienceError::Channel(err.to_string())
    }
}
