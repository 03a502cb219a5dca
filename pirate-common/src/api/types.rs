//! Shared REST error-response shape.
//!
//! Used by the coordinator's 4xx bodies (`sessionNotFound`, `sessionFull`,
//! `invalidJoinCode`, ...) so every error surface carries a stable
//! `error` string plus a human-readable message, matching the teacher's
//! `AuthErrorResponse` convention.

use serde::Serialize;
use serde_json::Value;

/// A REST error body: a stable machine-readable `error` code, a
/// human-readable `message`, and optional structured `details`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, message: impl Into<String>, details: Value) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: Some(details),
        }
    }
}
