//! Coordinator bootstrap configuration: the shared [`SyncConfig`] tunables
//! plus the handful of server-only settings, following the same
//! TOML-plus-CLI-override `Config::load` pattern as the client.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use pirate_common::config::SyncConfig;
use pirate_common::error::ConfigError;

fn default_port() -> u16 {
    7878
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub port: u16,
    #[serde(flatten)]
    pub sync: SyncConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self { port: default_port(), sync: SyncConfig::default() }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sync: SyncConfig,
}

impl Config {
    pub fn load(
        path: &Path,
        port_override: Option<u16>,
        max_members_override: Option<usize>,
        idle_timeout_ms_override: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let mut toml_config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str::<TomlConfig>(&text)?
        } else {
            TomlConfig::default()
        };

        if let Some(v) = port_override {
            toml_config.port = v;
        }
        if let Some(v) = max_members_override {
            toml_config.sync.max_members = v;
        }
        if let Some(v) = idle_timeout_ms_override {
            toml_config.sync.idle_timeout_ms = v;
        }

        Ok(Config { port: toml_config.port, sync: toml_config.sync })
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("pirate-coordinator.toml")
}
