//! Background batching for the ingestion hot path.
//!
//! The ingestion handler just enqueues; a single background task drains
//! the queue, dedupes against `usage_records`, and pre-folds the numeric
//! deltas of everything still in the batch that targets the same
//! aggregate document into one `increment_fields` call. Under load this
//! turns N concurrent requests landing in the same hour bucket into one
//! store write per flush instead of N, without changing the per-request
//! latency the caller sees (enqueue never waits on a store write).
//!
//! Flushes on whichever comes first: `CAPACITY` queued records, or the
//! `FLUSH_INTERVAL` ticker. On shutdown the channel closes, the loop
//! drains and flushes whatever remains, then returns — callers await the
//! returned `JoinHandle` to get a bounded final flush.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::aggregate::{self, AggregateEffect, UsageRecord};
use crate::sse::ParsedUsage;
use store::Store;

const CAPACITY: usize = 100;
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 4096;

/// One ingested record awaiting a flush cycle.
pub struct PendingUsage {
    pub user_email: String,
    pub account_uuid: String,
    pub request_id: Option<String>,
    pub parsed: ParsedUsage,
    pub timestamp: DateTime<Utc>,
}

/// Handle to the background flush task. Cloning shares the same queue.
#[derive(Clone)]
pub struct BatchWriter {
    sender: mpsc::Sender<PendingUsage>,
}

impl BatchWriter {
    /// Spawn the flush loop and return a handle plus its `JoinHandle`.
    /// Drop every `BatchWriter` clone (or call [`BatchWriter::shutdown`])
    /// to close the queue and trigger the final flush.
    pub fn spawn(store: Arc<Store>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(run_flush_loop(store, receiver));
        (Self { sender }, handle)
    }

    /// Queue a usage record. Never blocks on a store write; only backs up
    /// if the flush loop has fallen `CHANNEL_CAPACITY` records behind.
    pub async fn enqueue(&self, item: PendingUsage) {
        if self.sender.send(item).await.is_err() {
            warn!("batch writer flush loop has shut down, dropping usage record");
        }
    }

    /// Close the queue so the flush loop drains and exits. Await the
    /// `JoinHandle` returned from [`BatchWriter::spawn`] afterwards to
    /// know the final flush has completed.
    pub fn shutdown(self) {
        drop(self.sender);
    }
}

async fn run_flush_loop(store: Arc<Store>, mut receiver: mpsc::Receiver<PendingUsage>) {
    let mut buffer = Vec::with_capacity(CAPACITY);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            item = receiver.recv() => {
                match item {
                    Some(item) => {
                        buffer.push(item);
                        if buffer.len() >= CAPACITY {
                            flush(&store, std::mem::take(&mut buffer)).await;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            flush(&store, std::mem::take(&mut buffer)).await;
                        }
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, std::mem::take(&mut buffer)).await;
                }
            }
        }
    }
}

/// Dedupe each item against `usage_records`, pre-fold the survivors' effects
/// by target document, then write one `increment_fields` per bucket.
async fn flush(store: &Store, items: Vec<PendingUsage>) -> Vec<UsageRecord> {
    let mut recorded = Vec::with_capacity(items.len());
    let mut folded: HashMap<(&'static str, String), (HashMap<String, f64>, Value)> = HashMap::new();

    for item in items {
        let (record, effects) = aggregate::price_usage(
            &item.user_email,
            &item.account_uuid,
            item.request_id.as_deref(),
            &item.parsed,
            item.timestamp,
        );

        let already_recorded = match mark_recorded(store, &record, item.request_id.as_deref(), &item.timestamp).await {
            Ok(existed) => existed,
            Err(e) => {
                error!(message_id = %record.message_id, error = %e, "failed to write usage record, dropping from batch");
                metrics::counter!("metering_aggregate_failures_total").increment(1);
                continue;
            }
        };

        if already_recorded {
            continue;
        }

        for AggregateEffect { collection, key, increments, metadata } in effects {
            let entry = folded.entry((collection, key)).or_insert_with(|| (HashMap::new(), metadata));
            for (field, delta) in increments {
                *entry.0.entry(field).or_insert(0.0) += delta;
            }
        }

        recorded.push(record);
    }

    for ((collection, key), (increments, metadata)) in folded {
        let increments_ref: Vec<(&str, f64)> = increments.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        if let Err(e) = store.increment_fields(collection, &key, &increments_ref, metadata).await {
            error!(collection, key, error = %e, "failed to flush folded aggregate");
            metrics::counter!("metering_aggregate_failures_total").increment(1);
        }
    }

    recorded
}

async fn mark_recorded(
    store: &Store,
    record: &UsageRecord,
    request_id: Option<&str>,
    timestamp: &DateTime<Utc>,
) -> store::Result<bool> {
    let key = aggregate::usage_record_key(request_id, &record.message_id, timestamp);
    store
        .transaction(aggregate::USAGE_RECORDS_COLLECTION, &key, {
            let doc = record.clone_as_doc(&aggregate::hour_bucket(timestamp));
            move |current| {
                let existed = current.is_some();
                async move { Ok((Some(doc), existed)) }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::HOURLY_AGGREGATES_COLLECTION;
    use chrono::TimeZone;
    use pricing::TokenUsage;
    use tokio::time::{Duration, advance};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 19, 0, 0).unwrap()
    }

    fn pending(user: &str, message_id: &str) -> PendingUsage {
        pending_with_request_id(user, message_id, message_id)
    }

    fn pending_with_request_id(user: &str, message_id: &str, request_id: &str) -> PendingUsage {
        PendingUsage {
            user_email: user.to_string(),
            account_uuid: "acct-1".to_string(),
            request_id: Some(request_id.to_string()),
            parsed: ParsedUsage {
                message_id: message_id.to_string(),
                model: "claude-sonnet-4-20250514".to_string(),
                usage: TokenUsage { input_tokens: 10, output_tokens: 5, cache_read_tokens: 0, cache_write_tokens: 0 },
            },
            timestamp: ts(),
        }
    }

    #[tokio::test]
    async fn folds_multiple_records_in_one_flush_into_a_single_increment() {
        let store = Store::new();
        let items = vec![pending("a@x.io", "m1"), pending("a@x.io", "m2"), pending("a@x.io", "m3")];
        let recorded = flush(&store, items).await;
        assert_eq!(recorded.len(), 3);

        let doc = store.get(HOURLY_AGGREGATES_COLLECTION, "a@x.io_2026-08-01T19").unwrap();
        assert_eq!(doc["total_requests"], 3);
    }

    #[tokio::test]
    async fn same_request_id_within_a_batch_is_folded_once() {
        let store = Store::new();
        let items = vec![pending_with_request_id("a@x.io", "m1", "req_1"), pending_with_request_id("a@x.io", "m1", "req_1")];
        let recorded = flush(&store, items).await;
        assert_eq!(recorded.len(), 1);

        let doc = store.get(HOURLY_AGGREGATES_COLLECTION, "a@x.io_2026-08-01T19").unwrap();
        assert_eq!(doc["total_requests"], 1);
    }

    /// Two tee POSTs that happen to share an upstream `message_id` but
    /// carry distinct `request_id`s are both billed: the batch dedupes on
    /// `request_id` + nanotimestamp, never on `message_id` alone.
    #[tokio::test]
    async fn same_message_id_under_different_request_ids_within_a_batch_is_counted_twice() {
        let store = Store::new();
        let items = vec![pending_with_request_id("a@x.io", "m1", "req_1"), pending_with_request_id("a@x.io", "m1", "req_2")];
        let recorded = flush(&store, items).await;
        assert_eq!(recorded.len(), 2);

        let doc = store.get(HOURLY_AGGREGATES_COLLECTION, "a@x.io_2026-08-01T19").unwrap();
        assert_eq!(doc["total_requests"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_flushes_a_partial_batch_without_reaching_capacity() {
        let store = Arc::new(Store::new());
        let (writer, handle) = BatchWriter::spawn(store.clone());

        writer.enqueue(pending("a@x.io", "m1")).await;
        advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(store.get(HOURLY_AGGREGATES_COLLECTION, "a@x.io_2026-08-01T19").is_some());

        writer.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_buffer() {
        let store = Arc::new(Store::new());
        let (writer, handle) = BatchWriter::spawn(store.clone());
        writer.enqueue(pending("a@x.io", "m1")).await;
        writer.shutdown();
        handle.await.unwrap();

        assert!(store.get(HOURLY_AGGREGATES_COLLECTION, "a@x.io_2026-08-01T19").is_some());
    }
}
