//! REST surface: `/auth` bootstrap, `/sessions` create, `/sessions/join`.
//!
//! Grounded on `wkmp-ap/src/api/server.rs`'s router-building style; the
//! teacher's timestamp+HMAC auth middleware is replaced by the bearer
//! token scheme `pirate-common/src/auth.rs` defines (see DESIGN.md).

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use pirate_common::auth::parse_bearer_header;
use pirate_common::error::AuthError;

use crate::error::CoordinatorError;
use crate::registry::SessionRegistry;

/// Resolves the bearer token on an inbound request to the user id it was
/// issued to. Any handler that takes `BearerUser` as an argument rejects
/// unauthenticated or unrecognized callers before its body runs.
pub struct BearerUser(pub String);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for BearerUser
where
    Arc<SessionRegistry>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = CoordinatorError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let registry = Arc::<SessionRegistry>::from_ref(state);
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(CoordinatorError::Auth(AuthError::MissingToken))?;
        let token = parse_bearer_header(header).map_err(CoordinatorError::Auth)?;
        let user_id = registry
            .resolve_token(token)
            .ok_or(CoordinatorError::Auth(AuthError::UnknownToken))?;
        Ok(BearerUser(user_id))
    }
}

pub fn router() -> Router<Arc<SessionRegistry>> {
    Router::new()
        .route("/health", get(health))
        .route("/auth", post(bootstrap_auth))
        .route("/sessions", post(create_session))
        .route("/sessions/join", post(join_session))
}

async fn health(State(registry): State<Arc<SessionRegistry>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": registry.session_ids().len(),
        "gitHash": env!("GIT_HASH"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "buildProfile": env!("BUILD_PROFILE"),
    }))
}

#[derive(Deserialize)]
struct AuthRequest {
    #[serde(rename = "spotifyUserId")]
    spotify_user_id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Serialize)]
struct AuthResponse {
    token: String,
}

/// `POST /auth` — bootstrap a bearer token. The music-provider identity
/// is opaque to the kernel; the coordinator only needs a stable id to
/// key membership and DJ authority by.
async fn bootstrap_auth(
    State(registry): State<Arc<SessionRegistry>>,
    Json(req): Json<AuthRequest>,
) -> Json<AuthResponse> {
    let token = registry.issue_token(&req.spotify_user_id, &req.display_name);
    Json(AuthResponse { token })
}

#[derive(Serialize)]
struct CreateSessionResponse {
    id: String,
    #[serde(rename = "joinCode")]
    join_code: String,
    #[serde(rename = "creatorId")]
    creator_id: String,
    #[serde(rename = "djUserId")]
    dj_user_id: String,
}

/// `POST /sessions` — the caller auto-becomes DJ of the new session.
async fn create_session(
    State(registry): State<Arc<SessionRegistry>>,
    BearerUser(user_id): BearerUser,
) -> Json<CreateSessionResponse> {
    let handle = registry.create_session(&user_id);
    let session = handle.session.lock().unwrap();
    Json(CreateSessionResponse {
        id: session.id.to_string(),
        join_code: session.join_code.clone(),
        creator_id: session.creator_id.clone(),
        dj_user_id: session.dj_user_id.clone(),
    })
}

#[derive(Deserialize)]
struct JoinSessionRequest {
    code: String,
}

#[derive(Serialize)]
struct JoinSessionResponse {
    id: String,
    #[serde(rename = "joinCode")]
    join_code: String,
    #[serde(rename = "djUserId")]
    dj_user_id: String,
    #[serde(rename = "djDisplayName")]
    dj_display_name: String,
    #[serde(rename = "memberCount")]
    member_count: usize,
}

/// `POST /sessions/join` — returns `sessionNotFound`/`invalidJoinCode`
/// on a bad code (via [`CoordinatorError`]) or `sessionFull` at the
/// ≤10-member cap.
async fn join_session(
    State(registry): State<Arc<SessionRegistry>>,
    BearerUser(user_id): BearerUser,
    Json(req): Json<JoinSessionRequest>,
) -> Result<Json<JoinSessionResponse>, CoordinatorError> {
    let handle = registry.get_by_join_code(&req.code)?;
    registry.join(&handle, &user_id)?;
    crate::lifecycle::cancel_grace(&handle);

    let session = handle.session.lock().unwrap();
    Ok(Json(JoinSessionResponse {
        id: session.id.to_string(),
        join_code: session.join_code.clone(),
        dj_user_id: session.dj_user_id.clone(),
        dj_display_name: registry.display_name_of(&session.dj_user_id),
        member_count: session.members.len(),
    }))
}
