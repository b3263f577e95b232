//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{operation} failed with status {status}")]
    Transport { operation: &'static str, status: u16 },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("refreshing message {message_id} failed: {source}")]
    Refresh {
        message_id: u64,
        #[source]
        source: Box<StorageError>,
    },

    #[error("stream is closed")]
    Closed,

    #[error("stream is already closed")]
    AlreadyClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("offset {offset} is beyond the end of the stream ({size} bytes)")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<relaydrive_core::Error> for StorageError {
    fn from(err: relaydrive_core::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<StorageError> for std::io::Error {
    fn from(err: StorageError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            StorageError::Io(inner) => inner.kind(),
            StorageError::Timeout { .. } => ErrorKind::TimedOut,
            StorageError::Cancelled => ErrorKind::Interrupted,
            StorageError::InvalidOffset { .. } => ErrorKind::InvalidInput,
            StorageError::Closed | StorageError::AlreadyClosed => ErrorKind::BrokenPipe,
            _ => ErrorKind::Other,
        };
        match err {
            StorageError::Io(inner) => inner,
            other => std::io::Error::new(kind, other),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
