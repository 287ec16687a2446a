//! Per-user sticky credential binding.
//!
//! `GetValidTokenForUser` is the hot path: a user stays bound to one
//! upstream account until that account's token expires, so repeat calls
//! from the same user land on the same upstream account (useful for
//! provider-side prompt caching). Binding documents are mutated only
//! inside `store::Store::transaction` on the user's own key, matching the
//! same per-document locking discipline as credential refresh.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::{Value, json};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::pool::CredentialPool;
use crate::time::now_millis;

pub const USER_TOKEN_BINDINGS_COLLECTION: &str = "user_token_bindings";

const CACHE_CAPACITY: usize = 10_000;
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
struct CachedBinding {
    account_uuid: String,
    access_token: String,
    expires_at: u64,
    cached_at: Instant,
}

/// A resolved, usable token for a specific user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserToken {
    pub access_token: String,
    pub account_uuid: String,
    pub expires_at: u64,
}

/// Resolves and caches per-user sticky bindings on top of a `CredentialPool`.
pub struct UserTokenBinder {
    pool: Arc<CredentialPool>,
    cache: Mutex<LruCache<String, CachedBinding>>,
}

impl UserTokenBinder {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self {
            pool,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    /// The underlying pool, for callers that also need direct pool
    /// operations (e.g. the relay's upstream error tap marking a
    /// credential rate-limited by access token).
    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// The hot path: return a usable `(access_token, account_uuid, expires_at)`
    /// for `user_email`, binding a fresh credential if none exists yet.
    pub async fn get_valid_token_for_user(&self, user_email: &str) -> Result<UserToken> {
        if let Some(cached) = self.cache_hit(user_email) {
            return Ok(cached);
        }

        let store = self.pool.store().clone();
        let pool = Arc::clone(&self.pool);
        let user_email_owned = user_email.to_string();

        let token: Result<UserToken> = store
            .transaction(USER_TOKEN_BINDINGS_COLLECTION, user_email, move |current| {
                let pool = Arc::clone(&pool);
                let user_email = user_email_owned.clone();
                async move {
                    let now = now_millis();

                    if let Some(doc) = &current {
                        let expires_at = doc.get("expires_at").and_then(Value::as_u64).unwrap_or(0);
                        if expires_at > now {
                            let token = UserToken {
                                access_token: doc
                                    .get("access_token")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                account_uuid: doc
                                    .get("account_uuid")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                expires_at,
                            };
                            return Ok((None, Ok(token)));
                        }
                    }

                    match pool.get_valid_credentials().await {
                        Ok(selected) => {
                            let doc = json!({
                                "user_email": user_email,
                                "account_uuid": selected.account_uuid,
                                "access_token": selected.access_token,
                                "expires_at": selected.expires_at,
                            });
                            let token = UserToken {
                                access_token: selected.access_token,
                                account_uuid: selected.account_uuid,
                                expires_at: selected.expires_at,
                            };
                            Ok((Some(doc), Ok(token)))
                        }
                        Err(e) => Ok((current, Err(e))),
                    }
                }
            })
            .await?;

        if let Ok(ref t) = token {
            self.cache_insert(user_email, t);
        }
        token
    }

    /// Force the next call for `user_email` to re-bind, e.g. after the
    /// upstream reports a rate-limit or auth failure on this user's credential.
    pub async fn clear_user_token_binding(&self, user_email: &str) -> Result<()> {
        self.cache.lock().unwrap().pop(user_email);
        self.pool
            .store()
            .delete(USER_TOKEN_BINDINGS_COLLECTION, user_email)
            .await?;
        debug!(user_email, "user token binding cleared");
        Ok(())
    }

    fn cache_hit(&self, user_email: &str) -> Option<UserToken> {
        let mut cache = self.cache.lock().unwrap();
        let cached = cache.get(user_email)?;
        if cached.cached_at.elapsed() >= CACHE_TTL {
            cache.pop(user_email);
            return None;
        }
        Some(UserToken {
            access_token: cached.access_token.clone(),
            account_uuid: cached.account_uuid.clone(),
            expires_at: cached.expires_at,
        })
    }

    fn cache_insert(&self, user_email: &str, token: &UserToken) {
        self.cache.lock().unwrap().put(
            user_email.to_string(),
            CachedBinding {
                account_uuid: token.account_uuid.clone(),
                access_token: token.access_token.clone(),
                expires_at: token.expires_at,
                cached_at: Instant::now(),
            },
        );
    }
}
