//! Billing extraction from a buffered Anthropic SSE response body.
//!
//! The ingestion handler receives the whole stream as one POST body rather
//! than a live client-side stream, so this is a plain line scan rather than
//! a `Stream` adapter: iterate lines, pick out `data: ` frames, skip the
//! `[DONE]` sentinel, and fold `message_start`/`message_delta` events into
//! one usage record. Any other event type (`content_block_*`, `ping`) is
//! irrelevant to billing and ignored.

use pricing::TokenUsage;
use serde_json::Value;

use crate::error::{Error, Result};

/// Usage extracted from one completed assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUsage {
    pub message_id: String,
    pub model: String,
    pub usage: TokenUsage,
}

#[derive(Default)]
struct Builder {
    message_id: Option<String>,
    model: Option<String>,
    usage: TokenUsage,
    usage_seen: bool,
}

impl Builder {
    fn apply_usage(&mut self, usage: &Value) {
        if let Some(v) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.usage.input_tokens = v;
            self.usage_seen = true;
        }
        if let Some(v) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.usage.output_tokens = v;
            self.usage_seen = true;
        }
        if let Some(v) = usage.get("cache_creation_input_tokens").and_then(Value::as_u64) {
            self.usage.cache_write_tokens = v;
            self.usage_seen = true;
        }
        if let Some(v) = usage.get("cache_read_input_tokens").and_then(Value::as_u64) {
            self.usage.cache_read_tokens = v;
            self.usage_seen = true;
        }
    }

    fn finish(self) -> Result<ParsedUsage> {
        let message_id = self.message_id.ok_or(Error::MissingFields("message_id"))?;
        let model = self.model.ok_or(Error::MissingFields("model"))?;
        if !self.usage_seen {
            return Err(Error::MissingFields("usage"));
        }
        Ok(ParsedUsage {
            message_id,
            model,
            usage: self.usage,
        })
    }
}

/// Parse a full SSE body and return the billing-relevant usage record.
///
/// Returns an error if the stream never carried a `message_start` with an
/// id and model, or never carried any usage counts at all — a truncated or
/// malformed upstream response should not be silently billed as zero.
pub fn parse_usage(body: &str) -> Result<ParsedUsage> {
    let mut builder = Builder::default();

    for line in body.lines() {
        let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }

        let event: Value = serde_json::from_str(payload)?;
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    if let Some(id) = message.get("id").and_then(Value::as_str) {
                        builder.message_id = Some(id.to_string());
                    }
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        builder.model = Some(model.to_string());
                    }
                    if let Some(usage) = message.get("usage") {
                        builder.apply_usage(usage);
                    }
                }
            }
            Some("message_delta") => {
                if let Some(usage) = event.get("usage").or_else(|| event.get("delta").and_then(|d| d.get("usage"))) {
                    builder.apply_usage(usage);
                }
            }
            _ => {}
        }
    }

    builder.finish()
}
