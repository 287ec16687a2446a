//! Usage extraction, pricing, and aggregation for completed SSE turns.
//!
//! [`sse::parse_usage`] turns a buffered upstream response body into a
//! [`sse::ParsedUsage`]; [`aggregate::record_usage`] and [`batch::BatchWriter`]
//! price it and fold it into the hourly/minute aggregates `crates/budget`
//! and the capacity dashboards read.

pub mod aggregate;
pub mod batch;
pub mod error;
pub mod sse;
pub mod verify;

pub use aggregate::{UsageRecord, record_usage};
pub use batch::{BatchWriter, PendingUsage};
pub use error::{Error, Result};
pub use sse::{ParsedUsage, parse_usage};
pub use verify::{DriftReport, verify_hour};
