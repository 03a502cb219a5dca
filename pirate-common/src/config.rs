//! Shared synchronization-kernel configuration.
//!
//! Every tunable in the external interface's Configuration list lives
//! here as a single `SyncConfig`, loaded from a TOML bootstrap file with
//! CLI-flag overrides, following the teacher's `Config::load(path,
//! overrides...)` pattern — minus the database-backed settings layer,
//! which this crate doesn't carry (persistent storage is out of scope).

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// All constants from the external-interfaces Configuration table,
/// with the documented defaults.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub lead_time_ms: u64,
    pub commit_buffer_ms: u64,
    pub drift_check_fast_ms: u64,
    pub drift_check_slow_ms: u64,
    pub drift_fast_window_ticks: u32,
    pub drift_cooldown_ms: u64,
    pub drift_ignore_ms: u64,
    pub drift_hard_seek_ms: u64,
    pub max_queue_size: usize,
    pub max_members: usize,
    pub max_track_duration_ms: u64,
    pub grace_period_ms: u64,
    pub idle_timeout_ms: u64,
    pub watchdog_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lead_time_ms: 1500,
            commit_buffer_ms: 200,
            drift_check_fast_ms: 5_000,
            drift_check_slow_ms: 15_000,
            drift_fast_window_ticks: 12,
            drift_cooldown_ms: 500,
            drift_ignore_ms: 50,
            drift_hard_seek_ms: 500,
            max_queue_size: 100,
            max_members: 10,
            max_track_duration_ms: 1_800_000,
            grace_period_ms: 300_000,
            idle_timeout_ms: 900_000,
            watchdog_ms: 3_000,
        }
    }
}

/// CLI-flag overrides layered on top of the TOML file. `None` means "keep
/// whatever the TOML file (or the built-in default) says".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub lead_time_ms: Option<u64>,
    pub max_members: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub idle_timeout_ms: Option<u64>,
}

impl SyncConfig {
    /// Load from a TOML file on disk, falling back to built-in defaults
    /// for any field the file omits, then apply CLI overrides.
    pub fn load(path: &Path, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&text)?
        } else {
            SyncConfig::default()
        };

        if let Some(v) = overrides.lead_time_ms {
            config.lead_time_ms = v;
        }
        if let Some(v) = overrides.max_members {
            config.max_members = v;
        }
        if let Some(v) = overrides.max_queue_size {
            config.max_queue_size = v;
        }
        if let Some(v) = overrides.idle_timeout_ms {
            config.idle_timeout_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.drift_ignore_ms >= self.drift_hard_seek_ms {
            return Err(ConfigError::Invalid {
                field: "drift_ignore_ms/drift_hard_seek_ms".into(),
                reason: "drift_ignore_ms must be strictly below drift_hard_seek_ms".into(),
            });
        }
        if self.max_members == 0 {
            return Err(ConfigError::Invalid {
                field: "max_members".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.max_track_duration_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "max_track_duration_ms".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}
