//! Error types for credential pool operations

/// Errors from credential pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No OAuthCredentials row has a null `rate_limit_headers` right now.
    #[error("no upstream credential available")]
    NoUpstreamAvailable,

    /// Every eligible credential failed refresh with an auth error (401/403).
    #[error("all credentials invalid")]
    AllCredentialsInvalid,

    /// The selected credential's refresh kept failing transiently after
    /// exhausting retries.
    #[error("upstream OAuth issuer unavailable: {0}")]
    UpstreamIssuerUnavailable(String),

    /// The backing document store returned an error.
    #[error("store error: {0}")]
    Store(#[from] store::Error),
}

/// Result alias for credential pool operations.
pub type Result<T> = std::result::Result<T, Error>;
