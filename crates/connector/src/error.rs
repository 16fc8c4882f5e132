//! Error types for connector operations

/// Errors from upstream authentication.
///
/// The message is meant for the end user's login screen and must never
/// include connector-private data.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("connector does not support {0}")]
    Unsupported(String),

    #[error("upstream login failed: {0}")]
    Upstream(String),

    #[error("invalid connector config: {0}")]
    Config(String),

    #[error("unknown connector: {0}")]
    UnknownConnector(String),

    #[error(transparent)]
    Storage(#[from] storage::Error),
}

/// Result alias for connector operations.
pub type Result<T> = std::result::Result<T, Error>;
