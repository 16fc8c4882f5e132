//! Error types for storage operations

/// Errors from the credential store.
///
/// `UpdateConflict` is the only retriable outcome: it means the record changed
/// between the read and the conditional write, and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("update conflict: {0}")]
    UpdateConflict(String),

    /// Returned by an updater that refuses the transition it was handed.
    #[error("update rejected: {0}")]
    Rejected(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::UpdateConflict(_))
    }
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;
