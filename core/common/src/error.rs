//! Common error types for meldanya backups.

use thiserror::Error;

/// Top-level error type for backup operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Authorization or token exchange failed.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Network request failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote side refused the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Configuration file missing, unreadable or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// External tool exited unsuccessfully or could not be spawned.
    #[error("Process error: {0}")]
    Process(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
