//! Credential pool and per-user token binding.
//!
//! Two pieces compose to satisfy the relay's hot path:
//! - [`pool::CredentialPool`] selects and refreshes upstream OAuth
//!   credentials (pool-random, rate-limit aware).
//! - [`binding::UserTokenBinder`] keeps each user sticky-bound to one
//!   credential until it expires, backed by a process-local LRU in front
//!   of the transactional binding store.

pub mod binding;
pub mod error;
pub mod pool;
mod time;

pub use binding::{UserToken, UserTokenBinder};
pub use error::{Error, Result};
pub use pool::{CredentialPool, SelectedCredential};
