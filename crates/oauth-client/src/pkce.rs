//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier and S256 challenge used during the admin
//! OAuth bootstrap flow. The verifier is held server-side for the duration
//! of the flow and sent during token exchange; the challenge goes in the
//! authorization URL so the authorization server can bind the eventual code
//! exchange to the same party that started the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::constants::{ANTHROPIC_CLIENT_ID, AUTHORIZE_ENDPOINT, REDIRECT_URI, SCOPES};

/// Generate a cryptographically random PKCE code verifier.
///
/// 128 random bytes, URL-safe base64 (no padding) — well within RFC 7636's
/// 43-128 character requirement.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 128];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 code challenge from a verifier:
/// `challenge = BASE64URL(SHA256(verifier))`.
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Build the full authorization URL with all required OAuth parameters.
///
/// `state` is an opaque CSRF token the caller generates and later verifies
/// against the callback.
pub fn build_authorization_url(state: &str, challenge: &str) -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        AUTHORIZE_ENDPOINT,
        ANTHROPIC_CLIENT_ID,
        urlencoded(REDIRECT_URI),
        urlencoded(SCOPES),
        challenge,
        state,
    )
}

fn urlencoded(s: &str) -> String {
    s.replace(' ', "%20")
        .replace(':', "%3A")
        .replace('/', "%2F")
}
