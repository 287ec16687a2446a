//! Fold one parsed usage record into the billing and capacity aggregates.
//!
//! Three collections get touched per record:
//! - `usage_records` — one immutable document per `request_id` +
//!   nanosecond timestamp. That compound key is the dedupe key: a retried
//!   tee POST for the same upstream call carries the same `X-Request-Id`
//!   and the same buffered timestamp, so it lands on the same document and
//!   is a no-op, without any pipeline logic deciding what counts as a
//!   duplicate. Dedup is a consequence of the caller's unique-id
//!   discipline, not something this module enforces.
//! - `hourly_aggregates` — per-user, per-hour points and token totals that
//!   `crates/budget` sums over a sliding window.
//! - `upstream_account_hourly_aggregates` / `..._minute_aggregates` — per
//!   upstream-account usage, keyed the same way but by `account_uuid`, for
//!   capacity and rate-limit observability independent of which user the
//!   request came in as.

use chrono::{DateTime, Utc};
use serde_json::json;
use store::Store;

use crate::error::Result;
use crate::sse::ParsedUsage;

pub const USAGE_RECORDS_COLLECTION: &str = "usage_records";
pub const HOURLY_AGGREGATES_COLLECTION: &str = "hourly_aggregates";
pub const UPSTREAM_HOURLY_AGGREGATES_COLLECTION: &str = "upstream_account_hourly_aggregates";
pub const UPSTREAM_MINUTE_AGGREGATES_COLLECTION: &str = "upstream_account_minute_aggregates";

/// The fully priced record for one completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub message_id: String,
    pub request_id: Option<String>,
    pub user_email: String,
    pub account_uuid: String,
    pub model: String,
    pub usage: pricing::TokenUsage,
    pub cost: pricing::UsageCost,
    pub points: i64,
}

/// The `usage_records` document key: `request_id` plus a nanosecond
/// timestamp, per the record's dedup contract. `X-Request-Id` is optional
/// on the wire, so a tee POST that arrives without one falls back to
/// `message_id` — the upstream-assigned id is still unique per turn, it
/// just forgoes the caller-supplied idempotency guarantee.
pub(crate) fn usage_record_key(request_id: Option<&str>, message_id: &str, ts: &DateTime<Utc>) -> String {
    match request_id {
        Some(request_id) => format!("{request_id}_{}", ts.timestamp_nanos_opt().unwrap_or_default()),
        None => message_id.to_string(),
    }
}

fn hour_key(prefix: &str, ts: &DateTime<Utc>) -> String {
    format!("{prefix}_{}", ts.format("%Y-%m-%dT%H"))
}

pub(crate) fn hour_bucket(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H").to_string()
}

fn minute_key(prefix: &str, ts: &DateTime<Utc>) -> String {
    format!("{prefix}_{}", ts.format("%Y-%m-%dT%H:%M"))
}

/// Field path segment for a model id: dots would be read as nested-path
/// separators by `store::Store::increment_fields`, so normalize them away.
fn model_path_segment(model: &str) -> String {
    model.replace('.', "_")
}

/// One target document plus the numeric deltas to fold into it.
pub struct AggregateEffect {
    pub collection: &'static str,
    pub key: String,
    pub increments: Vec<(String, f64)>,
    pub metadata: serde_json::Value,
}

/// Price `parsed` and compute the full set of effects it has on the store:
/// the priced record plus the three increment targets it feeds. Pure and
/// synchronous so [`BatchWriter`](crate::batch::BatchWriter) can pre-fold
/// many records into one `increment_fields` call per bucket before ever
/// touching the store.
pub fn price_usage(
    user_email: &str,
    account_uuid: &str,
    request_id: Option<&str>,
    parsed: &ParsedUsage,
    now: DateTime<Utc>,
) -> (UsageRecord, Vec<AggregateEffect>) {
    let cost = pricing::compute_cost(&parsed.model, parsed.usage);
    let points = pricing::cost_to_points(cost.total_cost);

    let record = UsageRecord {
        message_id: parsed.message_id.clone(),
        request_id: request_id.map(str::to_string),
        user_email: user_email.to_string(),
        account_uuid: account_uuid.to_string(),
        model: parsed.model.clone(),
        usage: parsed.usage,
        cost,
        points,
    };

    let model_seg = model_path_segment(&parsed.model);
    let model_prefix = format!("model_usage.{model_seg}");

    let user_increments = vec![
        ("total_requests".to_string(), 1.0),
        ("total_input_tokens".to_string(), record.usage.input_tokens as f64),
        ("total_output_tokens".to_string(), record.usage.output_tokens as f64),
        ("total_cache_read_tokens".to_string(), record.usage.cache_read_tokens as f64),
        ("total_cache_write_tokens".to_string(), record.usage.cache_write_tokens as f64),
        ("total_cost".to_string(), cost.total_cost),
        ("total_points".to_string(), points as f64),
        (format!("{model_prefix}.request_count"), 1.0),
        (format!("{model_prefix}.input_tokens"), record.usage.input_tokens as f64),
        (format!("{model_prefix}.output_tokens"), record.usage.output_tokens as f64),
        (format!("{model_prefix}.cache_read_tokens"), record.usage.cache_read_tokens as f64),
        (format!("{model_prefix}.cache_write_tokens"), record.usage.cache_write_tokens as f64),
        (format!("{model_prefix}.total_cost"), cost.total_cost),
        (format!("{model_prefix}.points"), points as f64),
    ];

    let upstream_increments = vec![
        ("total_requests".to_string(), 1.0),
        ("total_input_tokens".to_string(), record.usage.input_tokens as f64),
        ("total_output_tokens".to_string(), record.usage.output_tokens as f64),
        ("total_cache_read_tokens".to_string(), record.usage.cache_read_tokens as f64),
        ("total_cache_write_tokens".to_string(), record.usage.cache_write_tokens as f64),
        (format!("{model_prefix}.request_count"), 1.0),
        (format!("{model_prefix}.input_tokens"), record.usage.input_tokens as f64),
        (format!("{model_prefix}.output_tokens"), record.usage.output_tokens as f64),
    ];

    let updated_at = now.to_rfc3339();
    let effects = vec![
        AggregateEffect {
            collection: HOURLY_AGGREGATES_COLLECTION,
            key: hour_key(user_email, &now),
            increments: user_increments,
            metadata: json!({
                "user_id": user_email,
                "hour": now.format("%Y-%m-%dT%H").to_string(),
                "updated_at": updated_at,
            }),
        },
        AggregateEffect {
            collection: UPSTREAM_HOURLY_AGGREGATES_COLLECTION,
            key: hour_key(account_uuid, &now),
            increments: upstream_increments.clone(),
            metadata: json!({
                "upstream_account_uuid": account_uuid,
                "hour": now.format("%Y-%m-%dT%H").to_string(),
                "updated_at": updated_at,
            }),
        },
        AggregateEffect {
            collection: UPSTREAM_MINUTE_AGGREGATES_COLLECTION,
            key: minute_key(account_uuid, &now),
            increments: upstream_increments,
            metadata: json!({
                "upstream_account_uuid": account_uuid,
                "minute": now.format("%Y-%m-%dT%H:%M").to_string(),
                "updated_at": updated_at,
            }),
        },
    ];

    (record, effects)
}

/// Record `parsed`'s usage document and apply its effects immediately.
///
/// Idempotent per `request_id` + nanosecond timestamp: if the record
/// already exists (a retried tee POST, or the relay firing the sidecar
/// twice for one response), the aggregates are left untouched and the
/// previously stored record is returned instead of being double-counted.
/// [`BatchWriter`] is the higher-throughput path; this is the direct one
/// used when a single record must land synchronously (e.g. the `metering
/// verify` tool).
pub async fn record_usage(
    store: &Store,
    user_email: &str,
    account_uuid: &str,
    request_id: Option<&str>,
    parsed: ParsedUsage,
    now: DateTime<Utc>,
) -> Result<UsageRecord> {
    let (record, effects) = price_usage(user_email, account_uuid, request_id, &parsed, now);
    let key = usage_record_key(request_id, &parsed.message_id, &now);

    let already_recorded: bool = store
        .transaction(USAGE_RECORDS_COLLECTION, &key, {
            let doc = record.clone_as_doc(&hour_bucket(&now));
            move |current| {
                let existed = current.is_some();
                async move { Ok((Some(doc), existed)) }
            }
        })
        .await?;

    if already_recorded {
        tracing::debug!(key = %key, message_id = %parsed.message_id, "usage record already folded, skipping aggregates");
        return Ok(record);
    }

    for effect in effects {
        let increments_ref: Vec<(&str, f64)> = effect.increments.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        store
            .increment_fields(effect.collection, &effect.key, &increments_ref, effect.metadata)
            .await?;
    }

    Ok(record)
}

impl UsageRecord {
    /// `hour` is the `%Y-%m-%dT%H` bucket the record landed in, stamped at
    /// write time so the `metering verify` tool can re-derive which hourly
    /// aggregate a given record should have contributed to without having
    /// to re-parse anything timestamp-shaped out of the record itself.
    pub(crate) fn clone_as_doc(&self, hour: &str) -> serde_json::Value {
        json!({
            "message_id": self.message_id,
            "request_id": self.request_id,
            "user_email": self.user_email,
            "account_uuid": self.account_uuid,
            "model": self.model,
            "hour": hour,
            "usage": {
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
                "cache_read_tokens": self.usage.cache_read_tokens,
                "cache_write_tokens": self.usage.cache_write_tokens,
            },
            "total_cost": self.cost.total_cost,
            "points": self.points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pricing::TokenUsage;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 19, 30, 0).unwrap()
    }

    fn sample_usage() -> ParsedUsage {
        ParsedUsage {
            message_id: "msg_abc".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            },
        }
    }

    #[tokio::test]
    async fn folds_into_all_three_aggregate_collections() {
        let store = Store::new();
        record_usage(&store, "a@x.io", "acct-1", Some("req_1"), sample_usage(), ts()).await.unwrap();

        let hourly = store.get(HOURLY_AGGREGATES_COLLECTION, "a@x.io_2026-08-01T19").unwrap();
        assert_eq!(hourly["total_requests"], 1);
        assert!(hourly["total_points"].as_i64().unwrap() > 0);

        let upstream_hourly = store.get(UPSTREAM_HOURLY_AGGREGATES_COLLECTION, "acct-1_2026-08-01T19").unwrap();
        assert_eq!(upstream_hourly["total_requests"], 1);

        let upstream_minute = store.get(UPSTREAM_MINUTE_AGGREGATES_COLLECTION, "acct-1_2026-08-01T19:30").unwrap();
        assert_eq!(upstream_minute["total_requests"], 1);
    }

    #[tokio::test]
    async fn retrying_the_same_request_id_and_timestamp_does_not_double_count() {
        let store = Store::new();
        record_usage(&store, "a@x.io", "acct-1", Some("req_1"), sample_usage(), ts()).await.unwrap();
        record_usage(&store, "a@x.io", "acct-1", Some("req_1"), sample_usage(), ts()).await.unwrap();

        let hourly = store.get(HOURLY_AGGREGATES_COLLECTION, "a@x.io_2026-08-01T19").unwrap();
        assert_eq!(hourly["total_requests"], 1);
    }

    /// Two distinct calls that happen to share an upstream `message_id`
    /// (a retried client request hitting a fresh upstream attempt, say)
    /// are counted twice: the dedup key is `request_id` + nanotimestamp,
    /// not `message_id`, so collapsing them is not this module's job.
    #[tokio::test]
    async fn same_message_id_under_different_request_ids_is_counted_twice() {
        let store = Store::new();
        record_usage(&store, "a@x.io", "acct-1", Some("req_1"), sample_usage(), ts()).await.unwrap();
        record_usage(&store, "a@x.io", "acct-1", Some("req_2"), sample_usage(), ts()).await.unwrap();

        let hourly = store.get(HOURLY_AGGREGATES_COLLECTION, "a@x.io_2026-08-01T19").unwrap();
        assert_eq!(hourly["total_requests"], 2);
    }

    #[tokio::test]
    async fn usage_record_is_keyed_by_request_id_and_nanotimestamp() {
        let store = Store::new();
        let record = record_usage(&store, "a@x.io", "acct-1", Some("req_1"), sample_usage(), ts()).await.unwrap();
        assert_eq!(record.message_id, "msg_abc");
        let key = usage_record_key(Some("req_1"), "msg_abc", &ts());
        assert!(store.get(USAGE_RECORDS_COLLECTION, &key).is_some());
    }

    #[tokio::test]
    async fn missing_request_id_falls_back_to_message_id_as_the_key() {
        let store = Store::new();
        record_usage(&store, "a@x.io", "acct-1", None, sample_usage(), ts()).await.unwrap();
        assert!(store.get(USAGE_RECORDS_COLLECTION, "msg_abc").is_some());
    }
}
