//! # Pirate Radio Client
//!
//! The per-device actor that runs on every participating device, DJ or
//! listener. Drives a local music-source capability (the abstract
//! `MusicSource` — a pluggable vendor SDK binding) through the Sync
//! Kernel, which is the sole owner of `play`/`pause`/`seek` on this
//! device: every other module here only ever reads kernel events or
//! forwards intents into it.
//!
//! **Architecture:** `adapter` (vendor SDK state machine) + `transport`
//! (ordered WebSocket pipe to the coordinator) feed the `kernel` (epoch/
//! sequence gating, two-phase play, drift correction, latency
//! calibration), which publishes events the `session_store` projects
//! for UI consumers via a local SSE surface (`api`).

pub mod adapter;
pub mod api;
pub mod config;
pub mod error;
pub mod kernel;
pub mod session_store;
pub mod transport;

pub use error::{KernelError, Result};
pub use kernel::SyncKernel;
pub use session_store::SessionStore;
