//! Configuration loading: an optional TOML file overlaid by environment
//! variables, following `services/oauth-proxy/src/config.rs`'s
//! `resolve_path` + `load` shape. Every setting here is a single
//! string/flag/port rather than the teacher's nested tailnet/proxy/header
//! shape, so one flat `FileConfig` covers it instead of several nested
//! structs. `GCP_PROJECT_ID` and `FIRESTORE_DATABASE_NAME` from the original
//! environment surface have no counterpart here: `store::Store` is an
//! in-process stand-in with no connection settings to configure.

use std::path::{Path, PathBuf};

use common::Secret;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "relay.toml";

/// The subset of `Config` a TOML file may supply. Every field is optional
/// so a missing file, or a file that only pins a few settings, is fine —
/// environment variables fill in the rest and take priority over whatever
/// the file says.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    admin_port: Option<u16>,
    upstream_base_url: Option<String>,
    official_base_url: Option<String>,
    billing_enabled: Option<bool>,
    billing_service_url: Option<String>,
}

/// Root configuration for the relay binary.
#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub admin_port: u16,
    /// Upstream base URL for pool-backed OAuth requests.
    pub upstream_base_url: String,
    /// Upstream base URL for the `X-Official-Key` bypass path.
    pub official_base_url: String,
    /// Accepted but unused: retained for operators migrating from the
    /// legacy service-level bearer gate now superseded by the api-key
    /// resolver (spec §4.5).
    #[allow(dead_code)]
    pub api_secret_key: Option<Secret<String>>,
    #[allow(dead_code)]
    pub allowed_client_secret_key: Option<Secret<String>>,
    pub billing_enabled: bool,
    pub billing_service_url: Option<String>,
}

impl Config {
    /// A `--config <path>` CLI argument wins, then `CONFIG_PATH`, then
    /// `relay.toml` in the working directory.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(path) = cli_path {
            return PathBuf::from(path);
        }
        common::optional("CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load `path` if it exists (a missing file is not an error — the TOML
    /// layer is optional, environment variables alone are a complete
    /// configuration), then let environment variables overlay it field by
    /// field. Secrets are never read from the file, only from the
    /// environment.
    pub fn load(path: &Path) -> common::Result<Self> {
        let file = read_file_config(path)?;

        Ok(Self {
            port: common::optional("PORT")
                .and_then(|v| v.parse().ok())
                .or(file.port)
                .unwrap_or(8080),
            admin_port: common::optional("ADMIN_PORT")
                .and_then(|v| v.parse().ok())
                .or(file.admin_port)
                .unwrap_or(9090),
            upstream_base_url: common::optional("API_BASE_URL")
                .or(file.upstream_base_url)
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            official_base_url: common::optional("OFFICIAL_BASE_URL").or(file.official_base_url).ok_or_else(|| {
                common::Error::Config("OFFICIAL_BASE_URL missing from both environment and config file".to_string())
            })?,
            api_secret_key: common::optional("API_SECRET_KEY").map(Secret::new),
            allowed_client_secret_key: common::optional("ALLOWED_CLIENT_SECRET_KEY").map(Secret::new),
            billing_enabled: common::optional("BILLING_ENABLED")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .or(file.billing_enabled)
                .unwrap_or(true),
            billing_service_url: common::optional("BILLING_SERVICE_URL").or(file.billing_service_url),
        })
    }
}

fn read_file_config(path: &Path) -> common::Result<FileConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "CONFIG_PATH",
            "PORT",
            "ADMIN_PORT",
            "API_BASE_URL",
            "OFFICIAL_BASE_URL",
            "API_SECRET_KEY",
            "ALLOWED_CLIENT_SECRET_KEY",
            "BILLING_ENABLED",
            "BILLING_SERVICE_URL",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn resolve_path_prefers_cli_flag_over_env_over_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        assert_eq!(Config::resolve_path(Some("/etc/relay.toml")), PathBuf::from("/etc/relay.toml"));

        unsafe { std::env::set_var("CONFIG_PATH", "/opt/relay.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/opt/relay.toml"));
        unsafe { std::env::remove_var("CONFIG_PATH") };

        assert_eq!(Config::resolve_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn missing_file_falls_back_to_env_and_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe { std::env::set_var("OFFICIAL_BASE_URL", "https://official.example.com") };

        let config = Config::load(Path::new("/does/not/exist.toml")).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.upstream_base_url, "https://api.anthropic.com");
        assert_eq!(config.official_base_url, "https://official.example.com");

        clear_env();
    }

    #[test]
    fn env_var_overlays_file_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let dir = std::env::temp_dir().join(format!("relay-config-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.toml");
        std::fs::write(&path, "port = 7000\nofficial_base_url = \"https://file.example.com\"\n").unwrap();

        unsafe { std::env::set_var("PORT", "9000") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 9000, "env var must win over the file value");
        assert_eq!(
            config.official_base_url, "https://file.example.com",
            "file value is used when the env var is unset"
        );

        clear_env();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_official_base_url_in_both_sources_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        assert!(Config::load(Path::new("/does/not/exist.toml")).is_err());
    }
}
