//! Shared application state for the relay's handlers.

use std::sync::Arc;

use budget::{ApiKeyResolver, BudgetReader};
use provider::Provider;

/// State shared by the proxy handler and `/health`.
#[derive(Clone)]
pub struct AppState {
    /// Default request-rewrite strategy (pool-backed OAuth).
    pub oauth_provider: Arc<dyn Provider>,
    /// Upstream base URL used for the `X-Official-Key` bypass path; a fresh
    /// `OfficialKeyProvider` is constructed per request from this plus the
    /// header's value, since the bearer changes per caller.
    pub official_base_url: String,
    pub budget: Arc<BudgetReader>,
    pub api_keys: Arc<ApiKeyResolver>,
    pub http_client: reqwest::Client,
    pub billing_enabled: bool,
    pub billing_service_url: Option<String>,
}
