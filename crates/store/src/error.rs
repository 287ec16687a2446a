//! Error types for store operations

/// Errors from document-store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("document not found: {0}/{1}")]
    NotFound(String, String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid field path: {0}")]
    InvalidPath(String),

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
