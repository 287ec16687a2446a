//! `CheckRemaining`: points still available to a user in the current window.
//!
//! Backed by an LRU in front of a summation query over `hourly_aggregates`.
//! The cache's age bands trade staleness for request latency: a request
//! landing within a minute of the last check never touches the store at
//! all, one landing later gets last-known-good immediately while a fresh
//! value computes in the background, and only a true miss blocks on the
//! summation.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::window::window_bounds;
use store::Store;

pub const DAILY_POINTS_LIMITS_COLLECTION: &str = "daily_points_limits";
pub const HOURLY_AGGREGATES_COLLECTION: &str = "hourly_aggregates";

const CACHE_CAPACITY: usize = 1_000;
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FRESH_WITHOUT_REFRESH: Duration = Duration::from_secs(60);

struct CachedValue {
    remaining: i64,
    cached_at: Instant,
}

/// Computes and caches each user's remaining points for the current window.
pub struct BudgetReader {
    store: Arc<Store>,
    cache: Mutex<lru::LruCache<String, CachedValue>>,
}

impl BudgetReader {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: Mutex::new(lru::LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    /// Points still available to `user_email` in the window containing now.
    ///
    /// `self` must be held behind an `Arc` so a stale-but-live hit can spawn
    /// a detached background refresh that outlives this call.
    pub async fn check_remaining(self: &Arc<Self>, user_email: &str) -> Result<i64> {
        let points_limit = self.points_limit(user_email)?;
        if points_limit == 0 {
            return Ok(0);
        }

        if let Some(cached) = self.cache_lookup(user_email) {
            match cached {
                CacheHit::Fresh(value) => return Ok(value),
                CacheHit::Stale(value) => {
                    let this = Arc::clone(self);
                    let user_email = user_email.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = this.refresh(&user_email, points_limit).await {
                            warn!(user_email, error = %e, "background budget refresh failed");
                        }
                    });
                    return Ok(value);
                }
            }
        }

        self.refresh(user_email, points_limit).await
    }

    async fn refresh(&self, user_email: &str, points_limit: i64) -> Result<i64> {
        let remaining = self.compute_remaining(user_email, points_limit)?;
        if remaining != 0 {
            self.cache.lock().unwrap().put(
                user_email.to_string(),
                CachedValue { remaining, cached_at: Instant::now() },
            );
        }
        debug!(user_email, remaining, "budget recomputed");
        Ok(remaining)
    }

    fn compute_remaining(&self, user_email: &str, points_limit: i64) -> Result<i64> {
        let (window_start, window_end) = window_bounds(Utc::now());
        let prefix = format!("{user_email}_");

        let mut spent: i64 = 0;
        for (key, doc) in self.store.query_prefix(HOURLY_AGGREGATES_COLLECTION, &prefix) {
            let Some(hour_suffix) = key.strip_prefix(&prefix) else { continue };
            let Some(bucket_start) = parse_hour_bucket(hour_suffix) else { continue };
            if bucket_start >= window_start && bucket_start < window_end {
                spent += doc.get("total_points").and_then(Value::as_i64).unwrap_or(0);
            }
        }

        Ok(points_limit - spent)
    }

    fn points_limit(&self, user_email: &str) -> Result<i64> {
        let limit = self
            .store
            .get(DAILY_POINTS_LIMITS_COLLECTION, user_email)
            .and_then(|doc| doc.get("points_limit").and_then(Value::as_i64))
            .unwrap_or(0);
        Ok(limit)
    }

    fn cache_lookup(&self, user_email: &str) -> Option<CacheHit> {
        let mut cache = self.cache.lock().unwrap();
        let cached = cache.get(user_email)?;
        let age = cached.cached_at.elapsed();
        if age >= CACHE_TTL {
            cache.pop(user_email);
            return None;
        }
        if age < FRESH_WITHOUT_REFRESH {
            Some(CacheHit::Fresh(cached.remaining))
        } else {
            Some(CacheHit::Stale(cached.remaining))
        }
    }
}

enum CacheHit {
    Fresh(i64),
    Stale(i64),
}

fn parse_hour_bucket(suffix: &str) -> Option<chrono::DateTime<Utc>> {
    use chrono::TimeZone;
    let naive = chrono::NaiveDateTime::parse_from_str(&format!("{suffix}:00:00"), "%Y-%m-%dT%H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
