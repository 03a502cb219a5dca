//! Shared HTTP API types used across the client's local surface and the
//! coordinator's REST surface.
//!
//! # Design Principle
//!
//! Pure types only, no framework dependencies — each binary wraps these
//! with its own Axum routes and extractors.

pub mod types;

pub use types::ErrorResponse;
