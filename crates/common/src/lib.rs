//! Common types shared by the relay and metering services.

mod env;
mod error;
mod secret;
mod telemetry;

pub use env::{flag, number, optional, required};
pub use error::{Error, Result};
pub use secret::Secret;
pub use telemetry::init_tracing;
