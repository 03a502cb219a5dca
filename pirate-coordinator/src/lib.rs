//! # Pirate Radio Coordinator
//!
//! The always-on server: authoritative session registry, membership,
//! queue, WebSocket broadcast relay, the autonomous advancement timer
//! that keeps a station "on air" with nobody driving it, and grace/idle
//! session lifetime.
//!
//! Grounded on the teacher's `wkmp-pd` (program director) role — the
//! crate responsible for keeping a station alive without a listener
//! present — though only its `Cargo.toml` survived retrieval; the
//! module shape below instead follows `wkmp-ap/src/api/server.rs`'s
//! router-building convention, generalized to a bidirectional socket.

pub mod advancement;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod rest;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

pub use registry::{SessionHandle, SessionRegistry};

/// Assembles the full coordinator router: the REST bootstrap/session
/// surface plus the WebSocket relay, sharing one [`SessionRegistry`].
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .merge(rest::router())
        .merge(ws::router())
        .with_state(registry)
        .layer(CorsLayer::permissive())
}
