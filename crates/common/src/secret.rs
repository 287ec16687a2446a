//! Wrapper for values that must never reach a log line or an error
//! message: OAuth access/refresh tokens, `API_SECRET_KEY`,
//! `ALLOWED_CLIENT_SECRET_KEY`, and anything else pulled out of the
//! environment or a `relay.toml`/`metering.toml` file that an admin route
//! or `tracing::info!` call might otherwise print by accident.

use std::fmt;

use zeroize::Zeroize;

const REDACTION_PLACEHOLDER: &str = "<secret>";

/// A value that prints as [`REDACTION_PLACEHOLDER`] under `Debug`/`Display`
/// and is wiped from memory on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the plaintext. Named loudly so call sites (config loading,
    /// `Authorization` header construction) stand out in a review.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REDACTION_PLACEHOLDER}")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REDACTION_PLACEHOLDER}")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_an_api_secret_key() {
        let secret = Secret::new(String::from("sk-relay-abc123"));
        let rendered = format!("{secret:?}");
        assert_eq!(rendered, REDACTION_PLACEHOLDER);
        assert!(!rendered.contains("sk-relay-abc123"));
    }

    #[test]
    fn expose_returns_the_oauth_token_untouched() {
        let secret = Secret::new(String::from("oauth-access-token-xyz"));
        assert_eq!(secret.expose(), "oauth-access-token-xyz");
    }

    #[test]
    fn display_never_prints_a_bearer_token() {
        let secret = Secret::new(String::from("Bearer deadbeef"));
        let rendered = format!("{secret}");
        assert_eq!(rendered, REDACTION_PLACEHOLDER);
        assert!(!rendered.contains("deadbeef"));
    }

    #[test]
    fn cloning_a_config_secret_copies_the_plaintext() {
        let secret = Secret::new(String::from("ALLOWED_CLIENT_SECRET_KEY-value"));
        let cloned = secret.clone();
        assert_eq!(secret.expose(), cloned.expose());
    }

    #[test]
    fn dropping_the_original_does_not_wipe_the_clone() {
        let secret = Secret::new(String::from("still-here"));
        let cloned = secret.clone();
        drop(secret);
        assert_eq!(cloned.expose(), "still-here");
    }

    #[test]
    fn dropping_a_secret_zeroizes_the_backing_memory() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        #[derive(Clone)]
        struct TrackedToken {
            wiped: Arc<AtomicBool>,
        }

        impl Zeroize for TrackedToken {
            fn zeroize(&mut self) {
                self.wiped.store(true, Ordering::SeqCst);
            }
        }

        let wiped = Arc::new(AtomicBool::new(false));
        let secret = Secret::new(TrackedToken { wiped: Arc::clone(&wiped) });

        assert!(!wiped.load(Ordering::SeqCst), "zeroize must not fire before drop");
        drop(secret);
        assert!(wiped.load(Ordering::SeqCst), "zeroize must fire on drop");
    }
}
