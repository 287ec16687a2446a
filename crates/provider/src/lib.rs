//! Request-rewrite strategy abstraction for the relay
//!
//! The relay proxies every inbound call through one of two strategies:
//! the pooled-OAuth strategy (default) or the official-key bypass
//! (triggered by `X-Official-Key`). Both reduce to the same shape — take
//! the inbound headers, decide which upstream base URL and credential this
//! request uses, and rewrite headers accordingly — so they share a trait
//! rather than branching inline in the handler.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn Provider>` is stored once in router state and shared across
//! every request).

pub mod oauth_pool;
pub mod official_key;

pub use oauth_pool::OAuthPoolProvider;
pub use official_key::OfficialKeyProvider;

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Classification of an upstream error response, used to decide whether a
/// credential should be marked rate-limited or disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retryable without touching credential state (timeouts, 5xx).
    Transient,
    /// 429 from upstream — mark the credential's `rate_limit_headers` so the
    /// pool routes future requests elsewhere.
    RateLimited,
    /// 401/403 from upstream — the credential is no longer valid.
    Unauthorized,
}

/// Health status reported by a provider for the relay's `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: String,
    /// Provider-specific details (e.g. pool account counts for the OAuth strategy).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<serde_json::Value>,
}

/// Errors from provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no upstream credential available: {0}")]
    NoUpstreamAvailable(String),

    #[error("internal provider error: {0}")]
    Internal(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// What the caller needs to actually dispatch the rewritten request: the
/// upstream base URL to send it to, and an opaque identifier (credential
/// account UUID, or `"official"` for the bypass path) used when later
/// reporting errors via `report_error`.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub upstream_base_url: String,
    pub credential_id: String,
    /// The upstream account this request billed against, for the relay's
    /// metering tee (`X-Upstream-Account-UUID`). `None` for the
    /// official-key bypass, which has no pool account to attribute to.
    pub upstream_account_uuid: Option<String>,
}

/// Abstraction over the relay's upstream request-rewrite strategies.
///
/// The handler delegates all upstream-selection concerns to the provider:
/// `prepare_request` picks a credential and rewrites headers,
/// `classify_error` turns an upstream response into a retry/failover
/// decision, and `report_error` feeds that decision back into credential
/// state.
pub trait Provider: Send + Sync {
    /// Identifier for logging and health reporting (e.g. "oauth_pool", "official_key").
    fn id(&self) -> &str;

    /// Rewrite `headers` for the upstream call on behalf of `user_email`,
    /// selecting a credential and upstream base URL.
    ///
    /// `user_email` identifies the authenticated caller so pool-backed
    /// implementations can honor per-user sticky binding; the official-key
    /// bypass ignores it.
    fn prepare_request<'a>(
        &'a self,
        user_email: &'a str,
        headers: &'a mut reqwest::header::HeaderMap,
    ) -> Pin<Box<dyn Future<Output = Result<PreparedRequest>> + Send + 'a>>;

    /// Classify an upstream error response to determine the follow-up action.
    fn classify_error(&self, status: u16, body: &str) -> ErrorClassification;

    /// Report an error classification for the credential that was used by
    /// `prepare_request`, so the provider can update its own state.
    /// `user_email` is the same caller passed to `prepare_request`, carried
    /// through so pool-backed providers can also evict the caller's sticky
    /// binding on auth failure; the official-key bypass ignores it.
    fn report_error<'a>(
        &'a self,
        credential_id: &'a str,
        user_email: &'a str,
        classification: ErrorClassification,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Provider health for the `/health` endpoint.
    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>>;
}
