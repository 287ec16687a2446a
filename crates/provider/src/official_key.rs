//! Official-key bypass provider.
//!
//! When a client supplies `X-Official-Key`, the relay routes straight to
//! `OFFICIAL_BASE_URL` using that header's value as the bearer instead of
//! selecting a pool credential. Budget gating and metering still apply —
//! this only changes which upstream request-rewrite happens, matching the
//! teacher's original passthrough provider shape (static header injection,
//! no credential pool, `Authorization` protected from double-injection).

use crate::{ErrorClassification, PreparedRequest, Provider, ProviderHealth};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

/// Routes every request to a fixed upstream using a single configured key,
/// bypassing the credential pool entirely.
pub struct OfficialKeyProvider {
    upstream_base_url: String,
    official_key: String,
}

impl OfficialKeyProvider {
    pub fn new(upstream_base_url: String, official_key: String) -> Self {
        Self {
            upstream_base_url,
            official_key,
        }
    }
}

impl Provider for OfficialKeyProvider {
    fn id(&self) -> &str {
        "official_key"
    }

    fn prepare_request<'a>(
        &'a self,
        _user_email: &'a str,
        headers: &'a mut HeaderMap,
    ) -> Pin<Box<dyn Future<Output = crate::Result<PreparedRequest>> + Send + 'a>> {
        Box::pin(async move {
            let value = match HeaderValue::from_str(&format!("Bearer {}", self.official_key)) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "official key is not a valid header value");
                    return Err(crate::ProviderError::Internal(
                        "official key contains invalid header characters".into(),
                    ));
                }
            };
            headers.insert(AUTHORIZATION, value);
            Ok(PreparedRequest {
                upstream_base_url: self.upstream_base_url.clone(),
                credential_id: "official".to_string(),
                upstream_account_uuid: None,
            })
        })
    }

    fn classify_error(&self, _status: u16, _body: &str) -> ErrorClassification {
        // No pool to fail over within — every error is transient from this
        // provider's perspective; the caller's retry logic handles timeouts.
        ErrorClassification::Transient
    }

    fn report_error<'a>(
        &'a self,
        _credential_id: &'a str,
        _user_email: &'a str,
        _classification: ErrorClassification,
    ) -> Pin<Box<dyn Future<Output = crate::Result<()>> + Send + 'a>> {
        // No credential state to update for the bypass path.
        Box::pin(async { Ok(()) })
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>> {
        Box::pin(async {
            ProviderHealth {
                status: "healthy".to_string(),
                pool: None,
            }
        })
    }
}
