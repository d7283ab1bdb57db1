//! Health and metrics handlers.

use axum::{extract::State, http::StatusCode, Json};

use crate::api::models::HealthResponse;
use crate::api::AppState;
use crate::error::CoordinatorError;
use crate::orchestrator::MetricsSnapshot;

/// GET /healthz
pub async fn health(State(orch): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    if orch.store_healthy() {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
                persistence: "ok".to_string(),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded".to_string(),
                persistence: "read-only".to_string(),
            }),
        )
    }
}

/// GET /metrics
pub async fn metrics(
    State(orch): State<AppState>,
) -> Result<Json<MetricsSnapshot>, CoordinatorError> {
    Ok(Json(orch.metrics().await?))
}
