//! `Resolve(api_key) → user_email`, the relay's bearer-token lookup.
//!
//! Only positive resolutions are cached: a key that resolves to a disabled
//! user is treated as "not found" on every call, so a freshly-disabled
//! account stops working at most one cache TTL after the flip rather than
//! being pinned as valid for a stale entry's remaining lifetime.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use store::Store;

use crate::error::Result;

pub const API_KEY_BINDINGS_COLLECTION: &str = "api_key_bindings";
pub const USERS_COLLECTION: &str = "users";

const CACHE_CAPACITY: usize = 1_000;
const CACHE_TTL: Duration = Duration::from_secs(60);

/// At most this many live `api_key_bindings` documents may point at one
/// `user_email` at once.
pub const MAX_LIVE_BINDINGS_PER_USER: usize = 3;

fn live_binding_count(store: &Store, user_email: &str) -> usize {
    store
        .query_prefix(API_KEY_BINDINGS_COLLECTION, "")
        .iter()
        .filter(|(_, doc)| doc.get("user_email").and_then(Value::as_str) == Some(user_email))
        .count()
}

/// Create a new `api_key_bindings` document for `user_email`, rejecting the
/// insert if the user is disabled or already has `MAX_LIVE_BINDINGS_PER_USER`
/// live bindings.
///
/// The store has no cross-document transactions, so the limit is enforced
/// by transacting on the `users` document instead of the binding itself:
/// two concurrent creation calls for the same user serialize on that one
/// lock before either writes a binding, which is what makes the count
/// check-then-insert atomic with respect to each other. Calls for
/// different users never contend.
pub async fn create_binding(store: &Store, user_email: &str, api_key: &str) -> Result<()> {
    let inner_store = store.clone();
    let api_key_owned = api_key.to_string();

    store
        .transaction(USERS_COLLECTION, user_email, move |current| {
            let store = inner_store;
            let user_email = user_email.to_string();
            let api_key = api_key_owned;
            async move {
                let enabled = current.as_ref().and_then(|u| u.get("api_enabled")).and_then(Value::as_bool).unwrap_or(false);
                if !enabled {
                    return Err(store::Error::PreconditionFailed(format!(
                        "user {user_email} is not api_enabled, refusing to bind a key"
                    )));
                }

                let live = live_binding_count(&store, &user_email);
                if live >= MAX_LIVE_BINDINGS_PER_USER {
                    return Err(store::Error::TransactionAborted(format!(
                        "user {user_email} already has {live} live api key bindings"
                    )));
                }

                store
                    .set(
                        API_KEY_BINDINGS_COLLECTION,
                        &api_key,
                        json!({
                            "user_email": user_email,
                            "created_at": Utc::now().to_rfc3339(),
                        }),
                    )
                    .await?;

                Ok((None, ()))
            }
        })
        .await?;

    Ok(())
}

struct CachedUser {
    user_email: String,
    cached_at: Instant,
}

/// Resolves bearer API keys to the user email they belong to.
pub struct ApiKeyResolver {
    store: Store,
    cache: Mutex<lru::LruCache<String, CachedUser>>,
}

impl ApiKeyResolver {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: Mutex::new(lru::LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    /// Resolve `api_key` to an enabled user's email, or `None` if the key
    /// is unknown or bound to a user with `api_enabled == false`.
    pub fn resolve(&self, api_key: &str) -> Result<Option<String>> {
        if let Some(cached) = self.cache.lock().unwrap().get(api_key) {
            if cached.cached_at.elapsed() < CACHE_TTL {
                return Ok(Some(cached.user_email.clone()));
            }
        }

        let Some(binding) = self.store.get(API_KEY_BINDINGS_COLLECTION, api_key) else {
            return Ok(None);
        };
        let Some(user_email) = binding.get("user_email").and_then(Value::as_str) else {
            return Ok(None);
        };

        let Some(user) = self.store.get(USERS_COLLECTION, user_email) else {
            return Ok(None);
        };
        if !user.get("api_enabled").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(None);
        }

        self.cache.lock().unwrap().put(
            api_key.to_string(),
            CachedUser { user_email: user_email.to_string(), cached_at: Instant::now() },
        );
        Ok(Some(user_email.to_string()))
    }
}
