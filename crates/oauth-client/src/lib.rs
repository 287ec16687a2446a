//! Anthropic OAuth client library
//!
//! Provides PKCE flow generation and token exchange/refresh against
//! Anthropic's console OAuth issuer. This crate holds no persistent state —
//! credential storage and pool selection live in `store` and
//! `credential-pool` respectively, so this crate can be tested and reused
//! independently of both.
//!
//! Flow:
//! 1. Admin calls `pkce::generate_verifier()` + `pkce::compute_challenge()`.
//! 2. User authorizes via `pkce::build_authorization_url()`.
//! 3. Caller exchanges the returned code via `token::exchange_code()`.
//! 4. The credential pool persists the result and later calls
//!    `token::refresh_token()` under contention.

pub mod constants;
pub mod error;
pub mod pkce;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use pkce::{build_authorization_url, compute_challenge, generate_verifier};
pub use token::{TokenResponse, exchange_code, refresh_token};
