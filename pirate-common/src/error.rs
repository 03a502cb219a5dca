//! Shared error types for the synchronization kernel
//!
//! Each crate in the workspace defines its own top-level error enum; this
//! module holds the error kinds that are genuinely cross-cutting (clock
//! sync, wire decode, configuration) because `pirate-client` and
//! `pirate-coordinator` both wrap them with `#[from]`.

use thiserror::Error;

/// Errors from the NTP-anchored clock.
#[derive(Debug, Error)]
pub enum ClockError {
    #[error("NTP resync failed after {attempts} attempts: {reason}")]
    ResyncFailed { attempts: u32, reason: String },

    #[error("NTP resync cancelled")]
    Cancelled,

    #[error("no time source configured")]
    NoSource,
}

impl ClockError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ClockError::ResyncFailed { .. } => "SYNC_CLOCK_001",
            ClockError::Cancelled => "SYNC_CLOCK_002",
            ClockError::NoSource => "SYNC_CLOCK_003",
        }
    }
}

/// Errors from the wire codec / anti-corruption layer.
///
/// `decodeFailure` must never be silently dropped (see the error-kind
/// table) so this always carries the offending raw payload.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to decode frame: {reason}; raw={raw}")]
    DecodeFailure { raw: String, reason: String },

    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

impl WireError {
    pub fn error_code(&self) -> &'static str {
        match self {
            WireError::DecodeFailure { .. } => "SYNC_WIRE_001",
            WireError::UnknownType(_) => "SYNC_WIRE_002",
        }
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "SYNC_CFG_001",
            ConfigError::Parse(_) => "SYNC_CFG_002",
            ConfigError::Invalid { .. } => "SYNC_CFG_003",
        }
    }
}

/// Errors from bearer-token bootstrap/validation.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization header missing or malformed")]
    MissingToken,

    #[error("token not recognized")]
    UnknownToken,
}

impl AuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "SYNC_AUTH_001",
            AuthError::UnknownToken => "SYNC_AUTH_002",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn clock_error_codes_unique() {
        let errors = vec![
            ClockError::ResyncFailed {
                attempts: 3,
                reason: "timeout".into(),
            },
            ClockError::Cancelled,
            ClockError::NoSource,
        ];
        let codes: HashSet<_> = errors.iter().map(|e| e.error_code()).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn wire_error_codes_unique() {
        let errors = vec![
            WireError::DecodeFailure {
                raw: "{}".into(),
                reason: "missing type".into(),
            },
            WireError::UnknownType("bogus".into()),
        ];
        let codes: HashSet<_> = errors.iter().map(|e| e.error_code()).collect();
        assert_eq!(codes.len(), errors.len());
    }
}
