//! Shared tracing initialization for both binaries.
//!
//! Both `relay` and `metering` start the same way: JSON-formatted tracing
//! with an `EnvFilter` driven by `LOG_LEVEL` (falling back to `RUST_LOG`,
//! then a hardcoded `info` default).

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. Call once at process start.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
