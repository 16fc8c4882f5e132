//! Error types for signing and verification

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no signing key available")]
    NoSigningKey,

    /// The token names a key id that is not in the retained set.
    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("key storage error: {0}")]
    Storage(#[from] storage::Error),
}

/// Result alias for key operations.
pub type Result<T> = std::result::Result<T, Error>;
