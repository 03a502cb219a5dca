//! Client bootstrap configuration: the synchronization-kernel tunables
//! from [`pirate_common::config::SyncConfig`] plus the handful of
//! per-device settings (coordinator endpoint, local identity, local
//! control-surface port) needed to stand up a kernel instance. Follows
//! the teacher's TOML-bootstrap-plus-CLI-override `Config::load`
//! pattern.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use pirate_common::config::SyncConfig;
use pirate_common::error::ConfigError;

fn default_port() -> u16 {
    5821
}

fn default_coordinator_http_url() -> String {
    "http://localhost:7878".to_string()
}

fn default_coordinator_ws_url() -> String {
    "ws://localhost:7878".to_string()
}

/// TOML bootstrap shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub port: u16,
    pub coordinator_http_url: String,
    pub coordinator_ws_url: String,
    pub display_name: Option<String>,
    pub join_code: Option<String>,
    #[serde(flatten)]
    pub sync: SyncConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            coordinator_http_url: default_coordinator_http_url(),
            coordinator_ws_url: default_coordinator_ws_url(),
            display_name: None,
            join_code: None,
            sync: SyncConfig::default(),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub coordinator_http_url: String,
    pub coordinator_ws_url: String,
    pub display_name: String,
    /// `None` means "create a new session and become its DJ"; `Some`
    /// means "join the session with this four-digit code as a listener".
    pub join_code: Option<String>,
    pub sync: SyncConfig,
}

impl Config {
    /// Load from a TOML file with optional command-line overrides,
    /// falling back to built-in defaults for any field the file omits.
    pub fn load(
        path: &Path,
        port_override: Option<u16>,
        coordinator_http_url_override: Option<String>,
        coordinator_ws_url_override: Option<String>,
        display_name_override: Option<String>,
        join_code_override: Option<String>,
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
        if let Some(v) = coordinator_http_url_override {
            toml_config.coordinator_http_url = v;
        }
        if let Some(v) = coordinator_ws_url_override {
            toml_config.coordinator_ws_url = v;
        }
        if let Some(v) = display_name_override {
            toml_config.display_name = Some(v);
        }
        if let Some(v) = join_code_override {
            toml_config.join_code = Some(v);
        }

        Ok(Config {
            port: toml_config.port,
            coordinator_http_url: toml_config.coordinator_http_url,
            coordinator_ws_url: toml_config.coordinator_ws_url,
            display_name: toml_config.display_name.unwrap_or_else(|| "Listener".to_string()),
            join_code: toml_config.join_code,
            sync: toml_config.sync,
        })
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("pirate-client.toml")
}
