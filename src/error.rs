//! Error types for repo-updater
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can surface from the repo-updater library
#[derive(Debug, Error)]
pub enum UpdaterError {
    /// Repository (or other referenced record) is not tracked
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation collides with work already in progress (e.g. reclone while in flight)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed identifiers or invalid configuration
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Execution backend could not be invoked
    #[error("Backend error: {0}")]
    Backend(String),

    /// Repository store error
    #[error("Store error: {0}")]
    Store(String),

    /// IPC communication error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error from the durable repo store
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl UpdaterError {
    /// True for errors the caller is expected to retry later.
    pub fn is_conflict(&self) -> bool {
        matches!(self, UpdaterError::Conflict(_))
    }

    /// True when the referenced record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, UpdaterError::NotFound(_))
    }
}

/// Result type alias for repo-updater operations
pub type Result<T> = std::result::Result<T, UpdaterError>;
