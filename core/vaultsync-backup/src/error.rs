//! Backup and restore error types.

use thiserror::Error;

/// Result type for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Errors that can occur creating or restoring encrypted backups.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Output(#[from] vaultsync_output::OutputError),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Deliberately opaque: discloses nothing about which check failed.
    #[error("decryption failed")]
    Decryption,

    #[error("malformed wrapped key: {0}")]
    MalformedKey(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("non-canonical file path in archive: {0}")]
    NonCanonicalPath(String),

    #[error("unhandled entry {name} of type {type_byte:#x} in archive")]
    UnsupportedEntry { name: String, type_byte: u8 },

    #[error("refusing to restore into non-empty directory {dir}: {files:?}")]
    DestinationNotEmpty { dir: String, files: Vec<String> },
}
