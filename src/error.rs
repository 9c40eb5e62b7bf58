use thiserror::Error;

/// Errors raised by the synchronization engine and its collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no credential presented")]
    MissingCredential,

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The credential verified but the record store has no matching user.
    #[error("no user record for {0}")]
    UnknownUser(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read seed file: {0}")]
    SeedIo(#[from] std::io::Error),

    #[error("failed to parse seed file: {0}")]
    SeedFormat(#[from] serde_json::Error),

    #[error("record store error: {0}")]
    Record(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
