//! Error types for OAuth client operations

/// Errors from OAuth token exchange and refresh.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("refresh token rejected: {0}")]
    InvalidCredentials(String),
}

/// Result alias for OAuth client operations.
pub type Result<T> = std::result::Result<T, Error>;
