//! Agent error types.

use thiserror::Error;

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while syncing secrets.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A non-retriable server response, carrying the server's message.
    #[error("server error (status={status}): {message}")]
    Server { status: u16, message: String },

    /// The server 404'd a secret between listing and fetching it.
    #[error("deleted")]
    SecretDeleted,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("secret has invalid filename, got '{0}'")]
    UnsafeFilename(String),

    #[error("duplicate filename detected: {filename} on secrets {first} and {second}")]
    DuplicateFilename {
        filename: String,
        first: String,
        second: String,
    },

    #[error("unable to find {0} in backup bundle")]
    NotFound(String),

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error(transparent)]
    Output(#[from] vaultsync_output::OutputError),

    #[error(transparent)]
    Backup(#[from] vaultsync_backup::BackupError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
