//! Error types for the Aether coordinator.
//!
//! A single taxonomy is shared by every component; API handlers rely on the
//! `IntoResponse` impl to map variants onto HTTP statuses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Coordinator-level errors.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Unknown workflow-id, task-id, or session-token.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registering an existing worker-id, or starting a workflow with a
    /// colliding workflow-id.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Completion for the wrong step, a terminal workflow, or an
    /// unauthorized session token.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Operation requires a state the workflow has not reached yet.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Concurrent update lost the revision race.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage I/O failed; in-memory state must be treated as stale.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// A blocking API exceeded its bound.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Operation aborted by explicit cancellation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Malformed request payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invariant violation; the affected workflow is quarantined.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CoordinatorError {
    fn from(err: std::io::Error) -> Self {
        CoordinatorError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Persistence(err.to_string())
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            CoordinatorError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            CoordinatorError::Duplicate(msg) => (StatusCode::CONFLICT, msg.clone()),
            CoordinatorError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            CoordinatorError::ProtocolViolation(msg) => {
                tracing::warn!(error = %msg, "Protocol violation");
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            CoordinatorError::PreconditionFailed(msg) => {
                (StatusCode::PRECONDITION_FAILED, msg.clone())
            }
            CoordinatorError::Persistence(msg) => {
                tracing::error!(error = %msg, "Persistence failure");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            CoordinatorError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, msg.clone()),
            CoordinatorError::Cancelled(msg) => (StatusCode::CONFLICT, msg.clone()),
            CoordinatorError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            CoordinatorError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias used across the coordinator.
pub type CoreResult<T> = Result<T, CoordinatorError>;
