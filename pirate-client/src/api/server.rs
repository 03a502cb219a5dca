//! HTTP server setup and routing for the local control surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::info;

use pirate_common::api::ErrorResponse;
use pirate_common::domain::Track;

use crate::adapter::MusicSource;
use crate::error::KernelError;
use crate::session_store::SessionStore;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Maps a kernel error to an HTTP status per its recovery strategy:
/// DJ-gating rejections are 403, everything the session store surfaces
/// to the user is 409, everything else is 500.
fn api_error(err: KernelError) -> ApiError {
    let status = match &err {
        KernelError::NotDj(_) => StatusCode::FORBIDDEN,
        KernelError::DriftUnrecoverable { .. } | KernelError::Adapter(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new(err.error_code(), err.to_string())))
}

pub struct AppState<S: MusicSource> {
    pub store: Arc<SessionStore<S>>,
}

impl<S: MusicSource> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

pub async fn run<S: MusicSource + 'static>(port: u16, store: Arc<SessionStore<S>>) -> anyhow::Result<()> {
    let state = AppState { store };

    let app = Router::new()
        .route("/health", get(health))
        .route("/events", get(super::sse::event_stream))
        .route("/playback/play", post(play))
        .route("/playback/pause", post(pause))
        .route("/playback/resume", post(resume))
        .route("/playback/seek", post(seek))
        .route("/playback/skip", post(skip))
        .route("/playback/queue", post(add_to_queue))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("starting local control surface on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health<S: MusicSource + 'static>(State(state): State<AppState<S>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "isDj": state.store.is_dj(),
        "gitHash": env!("GIT_HASH"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "buildProfile": env!("BUILD_PROFILE"),
    }))
}

#[derive(Deserialize)]
struct PlayRequest {
    track: Track,
    #[serde(rename = "positionMs", default)]
    position_ms: u64,
}

async fn play<S: MusicSource + 'static>(
    State(state): State<AppState<S>>,
    Json(req): Json<PlayRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .play(req.track, req.position_ms)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn pause<S: MusicSource + 'static>(
    State(state): State<AppState<S>>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .pause()
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn resume<S: MusicSource + 'static>(
    State(state): State<AppState<S>>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .resume()
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct SeekRequest {
    #[serde(rename = "positionMs")]
    position_ms: u64,
}

async fn seek<S: MusicSource + 'static>(
    State(state): State<AppState<S>>,
    Json(req): Json<SeekRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .seek(req.position_ms)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn skip<S: MusicSource + 'static>(
    State(state): State<AppState<S>>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .skip()
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct AddToQueueRequest {
    track: Track,
    nonce: String,
}

async fn add_to_queue<S: MusicSource + 'static>(
    State(state): State<AppState<S>>,
    Json(req): Json<AddToQueueRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .add_to_queue(req.track, req.nonce)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "status": "ok" })))
}
