//! Pool-random credential selection and refresh-under-contention.
//!
//! The pool deliberately does NOT round-robin: load is spread across
//! upstream accounts by picking uniformly at random (nanosecond-modulo
//! tie-break) among credentials whose `rate_limit_headers` is null. This
//! mirrors the original deployment's selection strategy rather than the
//! teacher's own round-robin `anthropic-pool`, which this crate replaces —
//! round-robin would concentrate retries on the same account after a
//! rate-limit event instead of spreading them.
//!
//! Refresh runs inside `store::Store::transaction` on the credential's own
//! document, so the re-read of `expires_at` and the write-back are atomic
//! with respect to every other caller racing on the same `account_uuid`.
//! The transaction window spans the network call to the OAuth issuer by
//! design (see the open-question resolution in DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use store::Store;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::time::{now_millis, now_nanos_subsec};

pub const OAUTH_TOKENS_COLLECTION: &str = "oauth_tokens";

const REFRESH_RETRY_ATTEMPTS: u32 = 3;
const REFRESH_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// A credential ready to use for an upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedCredential {
    pub account_uuid: String,
    pub access_token: String,
    pub expires_at: u64,
}

/// Selects and refreshes credentials from the `oauth_tokens` collection.
pub struct CredentialPool {
    store: Arc<Store>,
    http_client: reqwest::Client,
}

impl CredentialPool {
    pub fn new(store: Arc<Store>, http_client: reqwest::Client) -> Self {
        Self { store, http_client }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Seed (or overwrite) a credential row. Used by admin bootstrap and tests.
    pub async fn put_credential(&self, account_uuid: &str, doc: Value) -> Result<()> {
        self.store.set(OAUTH_TOKENS_COLLECTION, account_uuid, doc).await?;
        Ok(())
    }

    fn eligible_pool(&self) -> Vec<(String, Value)> {
        self.store
            .query_prefix(OAUTH_TOKENS_COLLECTION, "")
            .into_iter()
            .filter(|(_, doc)| doc.get("rate_limit_headers").map(Value::is_null).unwrap_or(true))
            .collect()
    }

    /// Select a usable credential: pool-random among eligible rows, refreshed
    /// if expired. Retries against a different candidate when the selected
    /// one turns out to have invalid credentials, up to the pool's size.
    pub async fn get_valid_credentials(&self) -> Result<SelectedCredential> {
        let pool_size = self.eligible_pool().len();
        if pool_size == 0 {
            return Err(Error::NoUpstreamAvailable);
        }

        let mut attempts = 0usize;
        loop {
            let candidates = self.eligible_pool();
            if candidates.is_empty() {
                return Err(Error::AllCredentialsInvalid);
            }

            let idx = (now_nanos_subsec() as usize) % candidates.len();
            let (account_uuid, _doc) = &candidates[idx];

            match self.ensure_fresh(account_uuid).await {
                Ok(selected) => return Ok(selected),
                Err(Error::AllCredentialsInvalid) => {
                    attempts += 1;
                    if attempts >= pool_size {
                        return Err(Error::AllCredentialsInvalid);
                    }
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Ensure the named credential has a non-expired access token, refreshing
    /// it transactionally if needed. On an invalid-refresh-token response the
    /// credential is marked ineligible (via `rate_limit_headers`) so future
    /// selection skips it, and `AllCredentialsInvalid` is returned so the
    /// caller can try a different candidate.
    async fn ensure_fresh(&self, account_uuid: &str) -> Result<SelectedCredential> {
        let http_client = self.http_client.clone();
        let account_uuid_owned = account_uuid.to_string();
        let outcome: Result<SelectedCredential> = self
            .store
            .transaction(OAUTH_TOKENS_COLLECTION, account_uuid, move |current| {
                let http_client = http_client.clone();
                let account_uuid = account_uuid_owned.clone();
                async move {
                    let Some(doc) = current else {
                        return Ok((None, Err(Error::NoUpstreamAvailable)));
                    };

                    let now = now_millis();
                    let expires_at = doc.get("expires_at").and_then(Value::as_u64).unwrap_or(0);
                    if expires_at > now {
                        let access_token = doc
                            .get("access_token")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let selected = SelectedCredential {
                            account_uuid: account_uuid.clone(),
                            access_token,
                            expires_at,
                        };
                        return Ok((None, Ok(selected)));
                    }

                    let refresh_token = doc
                        .get("refresh_token")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();

                    let mut soft_locked = doc.clone();
                    if let Value::Object(ref mut map) = soft_locked {
                        map.insert("refresh_started_at".into(), json!(now));
                    }

                    match refresh_with_retry(&http_client, &refresh_token).await {
                        Ok(token) => {
                            let new_expires_at = now + token.expires_in * 1000;
                            let mut updated = soft_locked;
                            if let Value::Object(ref mut map) = updated {
                                map.insert("access_token".into(), json!(token.access_token));
                                map.insert("refresh_token".into(), json!(token.refresh_token));
                                map.insert("expires_at".into(), json!(new_expires_at));
                                map.insert("scope".into(), json!(token.scope));
                                map.insert("organization_uuid".into(), json!(token.organization_uuid));
                                map.insert("organization_name".into(), json!(token.organization_name));
                                map.insert("account_email".into(), json!(token.account_email));
                                map.insert("updated_at".into(), json!(now));
                            }
                            info!(account_uuid = %account_uuid, "credential refreshed");
                            let selected = SelectedCredential {
                                account_uuid: account_uuid.clone(),
                                access_token: token.access_token,
                                expires_at: new_expires_at,
                            };
                            Ok((Some(updated), Ok(selected)))
                        }
                        Err(RefreshOutcome::Invalid(msg)) => {
                            warn!(account_uuid = %account_uuid, error = %msg, "refresh token rejected, marking ineligible");
                            let mut disabled = soft_locked;
                            if let Value::Object(ref mut map) = disabled {
                                map.insert(
                                    "rate_limit_headers".into(),
                                    json!({"reason": "refresh_rejected", "detail": msg}),
                                );
                            }
                            Ok((Some(disabled), Err(Error::AllCredentialsInvalid)))
                        }
                        Err(RefreshOutcome::Transient(msg)) => {
                            Ok((Some(soft_locked), Err(Error::UpstreamIssuerUnavailable(msg))))
                        }
                    }
                }
            })
            .await?;

        outcome
    }

    /// All accounts regardless of eligibility, for admin introspection.
    pub fn all_accounts(&self) -> Vec<(String, Value)> {
        self.store.query_prefix(OAUTH_TOKENS_COLLECTION, "")
    }

    /// Per-account status without ever exposing token values, for the admin
    /// `GET /admin/accounts` endpoint.
    pub fn account_statuses(&self) -> Vec<Value> {
        self.all_accounts()
            .into_iter()
            .map(|(account_uuid, doc)| {
                let status = if doc.get("rate_limit_headers").map(Value::is_null).unwrap_or(true) {
                    "available"
                } else {
                    "rate_limited"
                };
                json!({"id": account_uuid, "status": status})
            })
            .collect()
    }

    /// Pool-wide health summary for the relay's `/health` endpoint and the
    /// admin `GET /admin/pool` endpoint.
    pub async fn health(&self) -> Value {
        let all = self.all_accounts();
        let total = all.len();
        let available = all
            .iter()
            .filter(|(_, doc)| doc.get("rate_limit_headers").map(Value::is_null).unwrap_or(true))
            .count();
        json!({
            "status": if available > 0 { "healthy" } else { "unhealthy" },
            "accounts_total": total,
            "accounts_available": available,
        })
    }

    /// Mark a credential ineligible for selection by access token. Also used
    /// by the relay's upstream error tap on 429/401/403.
    pub async fn save_rate_limit_headers_by_access_token(
        &self,
        access_token: &str,
        headers: Value,
    ) -> Result<()> {
        let matches = self.eligible_pool();
        for (account_uuid, doc) in matches {
            if doc.get("access_token").and_then(Value::as_str) == Some(access_token) {
                self.store
                    .merge_all(
                        OAUTH_TOKENS_COLLECTION,
                        &account_uuid,
                        json!({"rate_limit_headers": headers}),
                    )
                    .await?;
                debug!(account_uuid = %account_uuid, "credential marked rate-limited");
                return Ok(());
            }
        }
        Ok(())
    }
}

enum RefreshOutcome {
    Invalid(String),
    Transient(String),
}

async fn refresh_with_retry(
    client: &reqwest::Client,
    refresh_token: &str,
) -> std::result::Result<oauth_client::TokenResponse, RefreshOutcome> {
    let mut last_err = String::new();
    for attempt in 0..REFRESH_RETRY_ATTEMPTS {
        match oauth_client::refresh_token(client, refresh_token).await {
            Ok(token) => return Ok(token),
            Err(oauth_client::Error::InvalidCredentials(msg)) => {
                return Err(RefreshOutcome::Invalid(msg));
            }
            Err(e) => {
                last_err = e.to_string();
                if attempt + 1 < REFRESH_RETRY_ATTEMPTS {
                    tokio::time::sleep(REFRESH_RETRY_BACKOFF * (attempt + 1)).await;
                }
            }
        }
    }
    Err(RefreshOutcome::Transient(last_err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn far_future_millis() -> u64 {
        4_102_444_800_000
    }

    fn seeded_credential(access_token: &str, expires_at: u64) -> Value {
        json!({
            "access_token": access_token,
            "refresh_token": format!("rt_{access_token}"),
            "expires_at": expires_at,
            "rate_limit_headers": null,
        })
    }

    #[tokio::test]
    async fn selects_fresh_credential_without_refresh() {
        let store = Arc::new(Store::new());
        let pool = CredentialPool::new(store, reqwest::Client::new());
        pool.put_credential("acct-1", seeded_credential("at_1", far_future_millis()))
            .await
            .unwrap();

        let selected = pool.get_valid_credentials().await.unwrap();
        assert_eq!(selected.account_uuid, "acct-1");
        assert_eq!(selected.access_token, "at_1");
    }

    #[tokio::test]
    async fn empty_pool_is_no_upstream_available() {
        let store = Arc::new(Store::new());
        let pool = CredentialPool::new(store, reqwest::Client::new());
        let err = pool.get_valid_credentials().await.unwrap_err();
        assert!(matches!(err, Error::NoUpstreamAvailable));
    }

    #[tokio::test]
    async fn rate_limited_credential_is_excluded_from_selection() {
        let store = Arc::new(Store::new());
        let pool = CredentialPool::new(store, reqwest::Client::new());
        pool.put_credential("acct-1", seeded_credential("at_1", far_future_millis()))
            .await
            .unwrap();
        pool.put_credential(
            "acct-2",
            json!({
                "access_token": "at_2",
                "refresh_token": "rt_2",
                "expires_at": far_future_millis(),
                "rate_limit_headers": {"reason": "429"},
            }),
        )
        .await
        .unwrap();

        for _ in 0..10 {
            let selected = pool.get_valid_credentials().await.unwrap();
            assert_eq!(selected.account_uuid, "acct-1");
        }
    }

    #[tokio::test]
    async fn all_rate_limited_returns_all_credentials_invalid_shaped_error() {
        let store = Arc::new(Store::new());
        let pool = CredentialPool::new(store, reqwest::Client::new());
        pool.put_credential(
            "acct-1",
            json!({
                "access_token": "at_1",
                "refresh_token": "rt_1",
                "expires_at": far_future_millis(),
                "rate_limit_headers": {"reason": "429"},
            }),
        )
        .await
        .unwrap();

        let err = pool.get_valid_credentials().await.unwrap_err();
        assert!(matches!(err, Error::NoUpstreamAvailable));
    }

    #[tokio::test]
    async fn save_rate_limit_headers_marks_credential_ineligible() {
        let store = Arc::new(Store::new());
        let pool = CredentialPool::new(store, reqwest::Client::new());
        pool.put_credential("acct-1", seeded_credential("at_1", far_future_millis()))
            .await
            .unwrap();

        pool.save_rate_limit_headers_by_access_token("at_1", json!({"retry_after": 30}))
            .await
            .unwrap();

        let err = pool.get_valid_credentials().await.unwrap_err();
        assert!(matches!(err, Error::NoUpstreamAvailable));
    }

    #[tokio::test]
    async fn expired_credential_attempts_refresh_and_marks_invalid_on_rejection() {
        // No real token endpoint reachable with a bogus refresh token, so the
        // refresh is rejected and the credential gets marked ineligible.
        let store = Arc::new(Store::new());
        let pool = CredentialPool::new(store, reqwest::Client::new());
        pool.put_credential("acct-1", seeded_credential("at_1", 1_000_000))
            .await
            .unwrap();

        let err = pool.get_valid_credentials().await.unwrap_err();
        assert!(matches!(
            err,
            Error::AllCredentialsInvalid | Error::UpstreamIssuerUnavailable(_)
        ));
    }
}
