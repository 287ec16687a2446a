//! Static per-model pricing and cost derivation.
//!
//! Lookup order: case-insensitive exact match against the table, then
//! substring classification (`opus` / `sonnet` / `haiku`), then a sonnet
//! default when nothing matches at all. This mirrors the variety of model
//! id strings a provider emits over time (dated snapshots, aliases) without
//! needing the table to enumerate every one of them.
//!
//! Cost/points convention: `total_cost` is input + output cost only.
//! Cache read/write costs are computed and reported on the usage record for
//! observability, but are deliberately excluded from `total_cost` and thus
//! from budget points — see DESIGN.md for why this side of the historical
//! ambiguity was pinned.

use serde::{Deserialize, Serialize};

/// Per-million-token prices in USD for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrices {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_read_per_million: f64,
    pub cache_write_per_million: f64,
}

const OPUS_PRICES: ModelPrices = ModelPrices {
    input_per_million: 15.0,
    output_per_million: 75.0,
    cache_read_per_million: 1.5,
    cache_write_per_million: 18.75,
};

const SONNET_PRICES: ModelPrices = ModelPrices {
    input_per_million: 3.0,
    output_per_million: 15.0,
    cache_read_per_million: 0.3,
    cache_write_per_million: 3.75,
};

const HAIKU_PRICES: ModelPrices = ModelPrices {
    input_per_million: 0.8,
    output_per_million: 4.0,
    cache_read_per_million: 0.08,
    cache_write_per_million: 1.0,
};

/// Exact model id → price table. Extend with dated snapshots as providers
/// publish them; unlisted ids fall through to substring classification.
const PRICE_TABLE: &[(&str, ModelPrices)] = &[
    ("claude-opus-4-20250514", OPUS_PRICES),
    ("claude-opus-4-1-20250805", OPUS_PRICES),
    ("claude-3-opus-20240229", OPUS_PRICES),
    ("claude-sonnet-4-20250514", SONNET_PRICES),
    ("claude-3-7-sonnet-20250219", SONNET_PRICES),
    ("claude-3-5-sonnet-20241022", SONNET_PRICES),
    ("claude-3-5-haiku-20241022", HAIKU_PRICES),
    ("claude-3-haiku-20240307", HAIKU_PRICES),
];

/// Resolve a model id to its price table, applying the documented fallback
/// chain. Never fails: unrecognized ids default to sonnet pricing.
pub fn prices_for_model(model: &str) -> ModelPrices {
    let lower = model.to_lowercase();

    for (known, prices) in PRICE_TABLE {
        if known.to_lowercase() == lower {
            return *prices;
        }
    }

    if lower.contains("opus") {
        return OPUS_PRICES;
    }
    if lower.contains("haiku") {
        return HAIKU_PRICES;
    }
    if lower.contains("sonnet") {
        return SONNET_PRICES;
    }

    tracing::warn!(model, "unrecognized model, defaulting to sonnet pricing");
    SONNET_PRICES
}

/// Token counts extracted from one completed SSE stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

/// Derived cost for one usage record, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageCost {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_read_cost: f64,
    pub cache_write_cost: f64,
    /// Input + output cost only. The sole input to the points conversion.
    pub total_cost: f64,
}

/// Compute per-dimension cost for `usage` under `model`'s price table.
pub fn compute_cost(model: &str, usage: TokenUsage) -> UsageCost {
    let prices = prices_for_model(model);
    let input_cost = usage.input_tokens as f64 * prices.input_per_million / 1_000_000.0;
    let output_cost = usage.output_tokens as f64 * prices.output_per_million / 1_000_000.0;
    let cache_read_cost = usage.cache_read_tokens as f64 * prices.cache_read_per_million / 1_000_000.0;
    let cache_write_cost = usage.cache_write_tokens as f64 * prices.cache_write_per_million / 1_000_000.0;

    UsageCost {
        input_cost,
        output_cost,
        cache_read_cost,
        cache_write_cost,
        total_cost: input_cost + output_cost,
    }
}

/// Convert a USD cost to the integer budget unit: `round(cost * 10_000)`.
/// This factor is the sole conversion between cost and points anywhere in
/// the system.
pub fn cost_to_points(cost: f64) -> i64 {
    (cost * 10_000.0).round() as i64
}
