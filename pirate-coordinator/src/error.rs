//! Coordinator error kinds — one variant per row of the error-kind table,
//! each mapped to a REST-facing `error_code()` in the `COORD_SESSION_001`
//! convention and an HTTP status via [`CoordinatorError::status_code`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

use pirate_common::api::ErrorResponse;
use pirate_common::error::{AuthError, WireError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no session with that id or join code")]
    SessionNotFound,

    #[error("session already has the maximum number of members")]
    SessionFull,

    #[error("join code is not recognized")]
    InvalidJoinCode,

    #[error("{0} is not authorized to perform this action")]
    NotAuthorized(String),

    #[error("track {0} is not available")]
    TrackNotAvailable(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl CoordinatorError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinatorError::SessionNotFound => "COORD_SESSION_001",
            CoordinatorError::SessionFull => "COORD_SESSION_002",
            CoordinatorError::InvalidJoinCode => "COORD_SESSION_003",
            CoordinatorError::NotAuthorized(_) => "COORD_AUTH_001",
            CoordinatorError::TrackNotAvailable(_) => "COORD_TRACK_001",
            CoordinatorError::Auth(e) => e.error_code(),
            CoordinatorError::Wire(e) => e.error_code(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            CoordinatorError::SessionNotFound => StatusCode::NOT_FOUND,
            CoordinatorError::SessionFull => StatusCode::CONFLICT,
            CoordinatorError::InvalidJoinCode => StatusCode::NOT_FOUND,
            CoordinatorError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            CoordinatorError::TrackNotAvailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoordinatorError::Auth(_) => StatusCode::UNAUTHORIZED,
            CoordinatorError::Wire(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Lets REST handlers return `Result<_, CoordinatorError>` directly; the
/// body always carries the same `{error, message}` shape as the client's
/// local surface.
impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::new(self.error_code(), self.to_string());
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn error_codes_are_unique() {
        let errors: Vec<CoordinatorError> = vec![
            CoordinatorError::SessionNotFound,
            CoordinatorError::SessionFull,
            CoordinatorError::InvalidJoinCode,
            CoordinatorError::NotAuthorized("u1".into()),
            CoordinatorError::TrackNotAvailable("t1".into()),
        ];
        let codes: HashSet<_> = errors.iter().map(|e| e.error_code()).collect();
        assert_eq!(codes.len(), errors.len());
    }
}
