// src/error.rs
// Standardized error types for keepsafe

use std::time::Duration;
use thiserror::Error;

/// Main error type for the keepsafe library
#[derive(Error, Debug)]
pub enum KeepError {
    #[error("timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("connection broken and no replacement could be opened: {0}")]
    ConnectionBroken(String),

    #[error("connection was closed by pool shutdown")]
    ConnectionClosed,

    #[error("integrity check failed: {}", .0.join("; "))]
    Integrity(Vec<String>),

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown error: {0}")]
    Other(String),
}

/// Convenience type alias for Result using KeepError
pub type Result<T> = std::result::Result<T, KeepError>;

impl KeepError {
    /// Whether a caller can reasonably retry the operation later.
    ///
    /// Only pool exhaustion and SQLite lock contention qualify; everything else
    /// needs either a changed input or operator attention.
    pub fn is_retryable(&self) -> bool {
        match self {
            KeepError::PoolTimeout(_) => true,
            KeepError::Db(err) => is_contention(err),
            _ => false,
        }
    }

    /// Whether this error means the database file itself is damaged.
    pub fn is_corruption(&self) -> bool {
        match self {
            KeepError::Db(err) => is_corruption(err),
            KeepError::Integrity(_) => true,
            _ => false,
        }
    }
}

/// Check if a rusqlite error is SQLITE_CORRUPT or SQLITE_NOTADB.
///
/// SQLITE_NOTADB shows up when the file header is damaged, SQLITE_CORRUPT when
/// b-tree pages are malformed. Both mean the file needs restoring, not retrying.
pub fn is_corruption(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseCorrupt | ffi::ErrorCode::NotADatabase,
                ..
            },
            _,
        )
    )
}

/// Check if a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
pub fn is_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

impl From<tokio::task::JoinError> for KeepError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            KeepError::Cancelled
        } else {
            KeepError::Other(err.to_string())
        }
    }
}
