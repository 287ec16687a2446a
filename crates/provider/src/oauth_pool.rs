//! Pooled-OAuth request-rewrite strategy, the relay's default path.
//!
//! Resolves the caller's sticky-bound credential via
//! [`credential_pool::UserTokenBinder`], injects it as the bearer, and adds
//! the `anthropic-beta` opt-in header every OAuth-token request needs. The
//! prepared request's `credential_id` carries the access token itself
//! (rather than the account uuid) so `report_error` can feed it straight
//! back into `CredentialPool::save_rate_limit_headers_by_access_token`
//! without a second lookup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use credential_pool::UserTokenBinder;
use oauth_client::constants::OAUTH_BETA_HEADER_VALUE;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::json;
use tracing::warn;

use crate::{ErrorClassification, PreparedRequest, Provider, ProviderError, ProviderHealth};

const ANTHROPIC_BETA_HEADER: HeaderName = HeaderName::from_static("anthropic-beta");
const X_FORWARDED_FOR_HEADER: HeaderName = HeaderName::from_static("x-forwarded-for");

pub struct OAuthPoolProvider {
    binder: Arc<UserTokenBinder>,
    upstream_base_url: String,
}

impl OAuthPoolProvider {
    pub fn new(binder: Arc<UserTokenBinder>, upstream_base_url: String) -> Self {
        Self { binder, upstream_base_url }
    }

    fn append_beta_header(headers: &mut HeaderMap) -> std::result::Result<(), ProviderError> {
        let combined = match headers.get(&ANTHROPIC_BETA_HEADER) {
            Some(existing) => {
                let existing = existing.to_str().unwrap_or_default();
                if existing.split(',').any(|v| v.trim() == OAUTH_BETA_HEADER_VALUE) {
                    existing.to_string()
                } else if existing.is_empty() {
                    OAUTH_BETA_HEADER_VALUE.to_string()
                } else {
                    format!("{existing},{OAUTH_BETA_HEADER_VALUE}")
                }
            }
            None => OAUTH_BETA_HEADER_VALUE.to_string(),
        };
        let value = HeaderValue::from_str(&combined)
            .map_err(|e| ProviderError::Internal(format!("invalid anthropic-beta header: {e}")))?;
        headers.insert(ANTHROPIC_BETA_HEADER, value);
        Ok(())
    }
}

impl Provider for OAuthPoolProvider {
    fn id(&self) -> &str {
        "oauth_pool"
    }

    fn prepare_request<'a>(
        &'a self,
        user_email: &'a str,
        headers: &'a mut HeaderMap,
    ) -> Pin<Box<dyn Future<Output = crate::Result<PreparedRequest>> + Send + 'a>> {
        Box::pin(async move {
            let token = self
                .binder
                .get_valid_token_for_user(user_email)
                .await
                .map_err(|e| ProviderError::NoUpstreamAvailable(e.to_string()))?;

            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token.access_token))
                .map_err(|e| ProviderError::Internal(format!("access token is not a valid header value: {e}")))?;
            headers.insert(AUTHORIZATION, auth_value);

            Self::append_beta_header(headers)?;
            headers.remove(&X_FORWARDED_FOR_HEADER);

            Ok(PreparedRequest {
                upstream_base_url: self.upstream_base_url.clone(),
                credential_id: token.access_token,
                upstream_account_uuid: Some(token.account_uuid),
            })
        })
    }

    fn classify_error(&self, status: u16, _body: &str) -> ErrorClassification {
        match status {
            429 => ErrorClassification::RateLimited,
            401 | 403 => ErrorClassification::Unauthorized,
            _ => ErrorClassification::Transient,
        }
    }

    fn report_error<'a>(
        &'a self,
        credential_id: &'a str,
        user_email: &'a str,
        classification: ErrorClassification,
    ) -> Pin<Box<dyn Future<Output = crate::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match classification {
                ErrorClassification::Transient => {}
                ErrorClassification::RateLimited | ErrorClassification::Unauthorized => {
                    let reason = if classification == ErrorClassification::RateLimited { "rate_limited" } else { "unauthorized" };
                    if let Err(e) = self
                        .binder
                        .pool()
                        .save_rate_limit_headers_by_access_token(credential_id, json!({"reason": reason}))
                        .await
                    {
                        warn!(user_email, error = %e, "failed to mark credential ineligible");
                    }
                    if let Err(e) = self.binder.clear_user_token_binding(user_email).await {
                        warn!(user_email, error = %e, "failed to clear user token binding");
                    }
                }
            }
            Ok(())
        })
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>> {
        Box::pin(async move {
            let pool_health = self.binder.pool().health().await;
            let status = pool_health
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("unhealthy")
                .to_string();
            ProviderHealth { status, pool: Some(pool_health) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credential_pool::CredentialPool;
    use serde_json::json;
    use store::Store;

    fn far_future_millis() -> u64 {
        4_102_444_800_000
    }

    async fn provider_with_credential() -> OAuthPoolProvider {
        let store = Arc::new(Store::new());
        let pool = Arc::new(CredentialPool::new(store, reqwest::Client::new()));
        pool.put_credential(
            "acct-1",
            json!({
                "access_token": "at_1",
                "refresh_token": "rt_1",
                "expires_at": far_future_millis(),
                "rate_limit_headers": null,
            }),
        )
        .await
        .unwrap();
        let binder = Arc::new(UserTokenBinder::new(pool));
        OAuthPoolProvider::new(binder, "https://api.example".to_string())
    }

    #[tokio::test]
    async fn injects_bearer_and_beta_header() {
        let provider = provider_with_credential().await;
        let mut headers = HeaderMap::new();
        let prepared = provider.prepare_request("a@x.io", &mut headers).await.unwrap();

        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer at_1");
        assert_eq!(headers.get(&ANTHROPIC_BETA_HEADER).unwrap(), OAUTH_BETA_HEADER_VALUE);
        assert_eq!(prepared.credential_id, "at_1");
        assert_eq!(prepared.upstream_base_url, "https://api.example");
    }

    #[tokio::test]
    async fn appends_beta_value_to_existing_header_instead_of_overwriting() {
        let provider = provider_with_credential().await;
        let mut headers = HeaderMap::new();
        headers.insert(ANTHROPIC_BETA_HEADER, HeaderValue::from_static("some-other-beta"));
        provider.prepare_request("a@x.io", &mut headers).await.unwrap();

        let value = headers.get(&ANTHROPIC_BETA_HEADER).unwrap().to_str().unwrap();
        assert!(value.contains("some-other-beta"));
        assert!(value.contains(OAUTH_BETA_HEADER_VALUE));
    }

    #[tokio::test]
    async fn strips_x_forwarded_for() {
        let provider = provider_with_credential().await;
        let mut headers = HeaderMap::new();
        headers.insert(&X_FORWARDED_FOR_HEADER, HeaderValue::from_static("1.2.3.4"));
        provider.prepare_request("a@x.io", &mut headers).await.unwrap();

        assert!(headers.get(&X_FORWARDED_FOR_HEADER).is_none());
    }

    #[tokio::test]
    async fn classify_error_maps_status_codes() {
        let provider = provider_with_credential().await;
        assert_eq!(provider.classify_error(429, ""), ErrorClassification::RateLimited);
        assert_eq!(provider.classify_error(401, ""), ErrorClassification::Unauthorized);
        assert_eq!(provider.classify_error(403, ""), ErrorClassification::Unauthorized);
        assert_eq!(provider.classify_error(500, ""), ErrorClassification::Transient);
    }

    #[tokio::test]
    async fn rate_limited_report_marks_credential_and_clears_binding() {
        let provider = provider_with_credential().await;
        let mut headers = HeaderMap::new();
        let prepared = provider.prepare_request("a@x.io", &mut headers).await.unwrap();

        provider
            .report_error(&prepared.credential_id, "a@x.io", ErrorClassification::RateLimited)
            .await
            .unwrap();

        let err = provider.binder.pool().get_valid_credentials().await.unwrap_err();
        assert!(matches!(err, credential_pool::Error::NoUpstreamAvailable));
    }

    #[tokio::test]
    async fn health_reports_pool_size() {
        let provider = provider_with_credential().await;
        let health = provider.health().await;
        assert_eq!(health.status, "healthy");
        let pool = health.pool.unwrap();
        assert_eq!(pool["accounts_total"], 1);
        assert_eq!(pool["accounts_available"], 1);
    }
}
