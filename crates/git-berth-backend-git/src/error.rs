//! Error types for repository backend operations.

use thiserror::Error;

/// Errors that can occur during `GitBackend` operations.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Git repository error.
    #[error("Git repository error: {0}")]
    Git(#[from] git2::Error),

    /// A mutating operation is already in progress on this backend.
    #[error("A mutating operation is already in progress")]
    AlreadyWriting,

    /// The given string is not a commit id.
    #[error("Invalid commit id: {0}")]
    InvalidId(String),

    /// HEAD points at a branch with no commits yet.
    #[error("HEAD has no commits to branch from")]
    UnbornHead,
}

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;
