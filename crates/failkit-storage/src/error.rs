//! Storage error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (e.g., creating directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A receipt file could not be parsed.
    #[error("Malformed receipt file {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Webhook delivery error.
    #[error("Webhook error: {0}")]
    Webhook(#[from] reqwest::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
