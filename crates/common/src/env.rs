//! Small helpers for the environment-variable overlay used by both services'
//! config loading (spec §6: `API_BASE_URL`, `BILLING_ENABLED`, `PORT`, ...).

use std::env::VarError;

/// Read a required environment variable, mapping a missing/invalid value to
/// a `common::Error::Config`.
pub fn required(name: &str) -> crate::Result<String> {
    std::env::var(name).map_err(|e| match e {
        VarError::NotPresent => crate::Error::Config(format!("missing required env var {name}")),
        VarError::NotUnicode(_) => {
            crate::Error::Config(format!("env var {name} is not valid UTF-8"))
        }
    })
}

/// Read an optional environment variable.
pub fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Read a boolean environment variable ("1"/"true"/"yes" are truthy,
/// case-insensitive), defaulting to `default` when unset.
pub fn flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Read a numeric environment variable, defaulting to `default` when unset
/// or unparsable.
pub fn number(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn flag_recognizes_truthy_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("COMMON_TEST_FLAG", "TRUE") };
        assert!(flag("COMMON_TEST_FLAG", false));
        unsafe { std::env::remove_var("COMMON_TEST_FLAG") };
    }

    #[test]
    fn flag_defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("COMMON_TEST_FLAG_UNSET") };
        assert!(!flag("COMMON_TEST_FLAG_UNSET", false));
        assert!(flag("COMMON_TEST_FLAG_UNSET", true));
    }

    #[test]
    fn number_parses_or_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("COMMON_TEST_PORT", "8099") };
        assert_eq!(number("COMMON_TEST_PORT", 3000), 8099);
        unsafe { std::env::set_var("COMMON_TEST_PORT", "not-a-number") };
        assert_eq!(number("COMMON_TEST_PORT", 3000), 3000);
        unsafe { std::env::remove_var("COMMON_TEST_PORT") };
    }

    #[test]
    fn required_reports_missing() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("COMMON_TEST_REQUIRED") };
        assert!(required("COMMON_TEST_REQUIRED").is_err());
    }
}
