//! Configuration loading: an optional TOML file overlaid by environment
//! variables, same shape as `services/relay/src/config.rs` (itself
//! following `services/oauth-proxy/src/config.rs`'s `resolve_path` + `load`
//! pattern). This binary has a single setting, so the file layer only ever
//! pins `port`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "metering.toml";

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
}

/// Root configuration for the metering binary.
#[derive(Debug)]
pub struct Config {
    pub port: u16,
}

impl Config {
    /// A `--config <path>` CLI argument wins, then `CONFIG_PATH`, then
    /// `metering.toml` in the working directory.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(path) = cli_path {
            return PathBuf::from(path);
        }
        common::optional("CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load `path` if it exists (a missing file is not an error), then let
    /// `PORT` overlay it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let file = read_file_config(path)?;
        Ok(Self {
            port: common::optional("PORT").and_then(|v| v.parse().ok()).or(file.port).unwrap_or(8081),
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
