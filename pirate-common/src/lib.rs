//! # Pirate Radio Common
//!
//! Shared code for every Pirate Radio process:
//! - Domain model (sessions, tracks, members, the NTP-anchored position)
//! - Wire codec / anti-corruption layer between the domain algebra and
//!   the on-the-wire JSON schema
//! - `Clock` trait + implementations
//! - Bearer-token bootstrap helpers
//! - Configuration loading
//! - Shared error types and REST error-response shape

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod wire;

pub use clock::{Clock, SystemClock};
pub use config::SyncConfig;
pub use domain::{
    DriftTier, Member, NtpAnchoredPosition, Session, SessionSnapshot, Track, MAX_MEMBERS,
    MAX_QUEUE_SIZE, MAX_TRACK_DURATION_MS,
};
pub use wire::{SyncMessage, WireEnvelope};
