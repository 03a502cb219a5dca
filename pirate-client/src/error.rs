//! Error types for the client-side synchronization stack: the Music
//! Source Adapter, the Transport, and the Sync Kernel that sits between
//! them.

use thiserror::Error;

use pirate_common::error::{ClockError, WireError};

/// Errors surfaced by a [`crate::adapter::MusicSource`] implementation.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("vendor playback call failed: {0}")]
    PlaybackFailed(String),

    #[error("playback watchdog timed out waiting for a start callback")]
    Timeout,

    #[error("track not available: {0}")]
    TrackNotAvailable(String),
}

impl AdapterError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AdapterError::PlaybackFailed(_) => "SYNC_ADAPTER_001",
            AdapterError::Timeout => "SYNC_ADAPTER_002",
            AdapterError::TrackNotAvailable(_) => "SYNC_ADAPTER_003",
        }
    }
}

/// Errors surfaced by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed: {0}")]
    Disconnected(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl TransportError {
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::NotConnected => "SYNC_TRANSPORT_001",
            TransportError::Disconnected(_) => "SYNC_TRANSPORT_002",
            TransportError::Wire(_) => "SYNC_TRANSPORT_003",
        }
    }
}

/// Top-level error type for the Sync Kernel actor and the binary that
/// hosts it.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error("drift became unrecoverable: offset {offset_ms} ms")]
    DriftUnrecoverable { offset_ms: i64 },

    #[error("action {0} rejected: this client is not the DJ")]
    NotDj(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] pirate_common::error::ConfigError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Error-recovery hint, mirrored from the error-kind table's
/// "Propagation policy": most errors are handled inside the layer that
/// detected them, only a few cross upward to the Session Store.
#[derive(Debug, Clone, Copy)]
pub enum RecoveryStrategy {
    RetryInternally,
    SurfaceToUser,
    Fatal,
}

impl KernelError {
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            KernelError::Adapter(AdapterError::PlaybackFailed(_)) => RecoveryStrategy::RetryInternally,
            KernelError::Adapter(AdapterError::Timeout) => RecoveryStrategy::RetryInternally,
            KernelError::Adapter(AdapterError::TrackNotAvailable(_)) => RecoveryStrategy::SurfaceToUser,
            KernelError::Transport(_) => RecoveryStrategy::RetryInternally,
            KernelError::Clock(_) => RecoveryStrategy::RetryInternally,
            KernelError::DriftUnrecoverable { .. } => RecoveryStrategy::SurfaceToUser,
            KernelError::NotDj(_) => RecoveryStrategy::SurfaceToUser,
            KernelError::Io(_) | KernelError::Config(_) | KernelError::Other(_) => RecoveryStrategy::Fatal,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            KernelError::Adapter(e) => e.error_code(),
            KernelError::Transport(e) => e.error_code(),
            KernelError::Clock(e) => e.error_code(),
            KernelError::DriftUnrecoverable { .. } => "SYNC_KERNEL_001",
            KernelError::NotDj(_) => "SYNC_KERNEL_002",
            KernelError::Io(_) => "SYNC_KERNEL_003",
            KernelError::Config(e) => e.error_code(),
            KernelError::Other(_) => "SYNC_KERNEL_004",
        }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
