//! In-process stand-in for the production document database.
//!
//! The real deployment backs every collection with a transactional
//! key/value+query store that supports atomic per-field increments,
//! `MergeAll` upserts, and single-document ACID transactions (see the data
//! model notes carried in DESIGN.md). This crate reproduces that contract
//! in-process: every mutating operation on a given `(collection, key)`
//! serializes behind a per-document lock, the same shape as
//! `anthropic_auth::CredentialStore`'s single `Mutex<HashMap<..>>` generalized
//! to per-key granularity so unrelated documents never contend.
//!
//! `transaction()` holds its document's lock across the caller's async
//! closure, so the closure may legally perform network I/O mid-transaction
//! (spec requirement: refresh-under-contention spans the upstream HTTPS
//! call). Callers that cannot tolerate lock-held-across-await on their
//! backing store would instead split this into claim/release phases; that
//! split is not needed for an in-process lock.

mod error;
mod path;

pub use error::{Error, Result};

use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

type DocKey = (String, String);

/// A transactional, in-memory document store keyed by `(collection, key)`.
#[derive(Clone, Default)]
pub struct Store {
    docs: Arc<DashMap<DocKey, Value>>,
    locks: Arc<DashMap<DocKey, Arc<AsyncMutex<()>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, collection: &str, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry((collection.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Fetch a document by key. Returns `None` if it does not exist.
    pub fn get(&self, collection: &str, key: &str) -> Option<Value> {
        self.docs
            .get(&(collection.to_string(), key.to_string()))
            .map(|r| r.value().clone())
    }

    /// Overwrite a document wholesale (Firestore `Set`, non-merge).
    pub async fn set(&self, collection: &str, key: &str, doc: Value) -> Result<()> {
        let lock = self.lock_for(collection, key);
        let _guard = lock.lock().await;
        self.docs
            .insert((collection.to_string(), key.to_string()), doc);
        Ok(())
    }

    /// Delete a document. Not an error if it does not exist.
    pub async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let lock = self.lock_for(collection, key);
        let _guard = lock.lock().await;
        self.docs.remove(&(collection.to_string(), key.to_string()));
        Ok(())
    }

    /// Shallow-merge `patch`'s top-level fields into the document, creating
    /// it if absent (Firestore `MergeAll`).
    pub async fn merge_all(&self, collection: &str, key: &str, patch: Value) -> Result<()> {
        let lock = self.lock_for(collection, key);
        let _guard = lock.lock().await;
        let doc_key = (collection.to_string(), key.to_string());
        let mut doc = self.docs.get(&doc_key).map(|r| r.value().clone());
        let mut doc = doc.take().unwrap_or_else(|| Value::Object(Default::default()));
        path::merge_all(&mut doc, &patch);
        self.docs.insert(doc_key, doc);
        Ok(())
    }

    /// Atomically increment the numeric fields named in `increments` (dotted
    /// paths allowed, e.g. `model_usage.claude-opus-4.request_count`) and
    /// `MergeAll` `metadata` into the same document, all under one lock
    /// acquisition so the pair is indivisible with respect to other writers
    /// of this key.
    pub async fn increment_fields(
        &self,
        collection: &str,
        key: &str,
        increments: &[(&str, f64)],
        metadata: Value,
    ) -> Result<()> {
        let lock = self.lock_for(collection, key);
        let _guard = lock.lock().await;
        let doc_key = (collection.to_string(), key.to_string());
        let mut doc = self
            .docs
            .get(&doc_key)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| Value::Object(Default::default()));
        for (field, delta) in increments {
            path::increment_path(&mut doc, field, *delta);
        }
        path::merge_all(&mut doc, &metadata);
        self.docs.insert(doc_key, doc);
        Ok(())
    }

    /// Run a single-document transaction: `f` receives the current document
    /// (`None` if absent) and returns the value to write back (`None` means
    /// "leave unchanged, write nothing") plus an arbitrary return value `T`.
    /// The document's lock is held for the full duration of `f`, including
    /// any `.await` points inside it — this is what makes
    /// read-check-then-refresh-then-write atomic with respect to other
    /// callers racing on the same key.
    pub async fn transaction<F, Fut, T>(&self, collection: &str, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(Option<Value>) -> Fut,
        Fut: Future<Output = Result<(Option<Value>, T)>>,
    {
        let lock = self.lock_for(collection, key);
        let _guard = lock.lock().await;
        let doc_key = (collection.to_string(), key.to_string());
        let current = self.docs.get(&doc_key).map(|r| r.value().clone());
        let (next, ret) = f(current).await?;
        if let Some(next) = next {
            self.docs.insert(doc_key, next);
        }
        Ok(ret)
    }

    /// Return all `(key, doc)` pairs in `collection` whose key starts with
    /// `prefix`. Used for the budget reader's window sum over
    /// `HourlyAggregate` keys (`user_email + "_" + hour_bucket`).
    pub fn query_prefix(&self, collection: &str, prefix: &str) -> Vec<(String, Value)> {
        self.docs
            .iter()
            .filter(|entry| entry.key().0 == collection && entry.key().1.starts_with(prefix))
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect()
    }

    /// Count documents in a collection. Mostly useful in tests.
    pub fn len(&self, collection: &str) -> usize {
        self.docs.iter().filter(|e| e.key().0 == collection).count()
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}
