//! Error types for filesystem operations.

use thiserror::Error;

/// Result type for output operations.
pub type OutputResult<T> = Result<T, OutputError>;

/// Errors that can occur writing secrets to disk.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to set ownership on {path}: {source}")]
    Permission {
        path: String,
        source: std::io::Error,
    },

    #[error("unexpected filesystem type writing {0}")]
    FilesystemMismatch(String),

    #[error("no passwd entry for user {0}")]
    UnknownUser(String),

    #[error("no group entry for {0}")]
    UnknownGroup(String),
}
