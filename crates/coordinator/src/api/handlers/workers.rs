//! Worker-plane registration and session handlers.

use axum::{extract::State, Json};

use crate::api::models::{
    AckResponse, HeartbeatResponse, PollTasksRequest, PollTasksResponse, RegisterWorkerRequest,
    RegisterWorkerResponse, SessionRequest, TaskDto,
};
use crate::api::AppState;
use crate::error::CoordinatorError;
use crate::registry::RegisterSpec;

/// POST /v1/workers
pub async fn register_worker(
    State(orch): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> Result<Json<RegisterWorkerResponse>, CoordinatorError> {
    if request.service_name.is_empty() {
        return Err(CoordinatorError::Validation(
            "service_name must not be empty".to_string(),
        ));
    }
    let record = orch
        .register_worker(RegisterSpec {
            worker_id: request.worker_id,
            service_name: request.service_name,
            group: request.group,
            capabilities: request.capabilities,
            workflow_types: request.workflow_types,
        })
        .await?;

    let heartbeat_interval = orch.registry().heartbeat_timeout() / 3;
    Ok(Json(RegisterWorkerResponse {
        worker_id: record.worker_id,
        session_token: record.session_token,
        heartbeat_interval_ms: heartbeat_interval.as_millis() as u64,
    }))
}

/// POST /v1/workers/heartbeat
pub async fn worker_heartbeat(
    State(orch): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<HeartbeatResponse>, CoordinatorError> {
    let next = orch.worker_heartbeat(&request.session_token).await?;
    Ok(Json(HeartbeatResponse {
        ok: true,
        next_heartbeat_ms: next.as_millis() as u64,
    }))
}

/// POST /v1/workers/drain
pub async fn drain_worker(
    State(orch): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<AckResponse>, CoordinatorError> {
    orch.drain_worker(&request.session_token).await?;
    Ok(Json(AckResponse::ok()))
}

/// POST /v1/tasks/poll
///
/// Polling claim fallback: returns available matched tasks immediately, or
/// an empty batch.
pub async fn poll_tasks(
    State(orch): State<AppState>,
    Json(request): Json<PollTasksRequest>,
) -> Result<Json<PollTasksResponse>, CoordinatorError> {
    let max = request.max.clamp(1, 100);
    let tasks = orch.dispatch_tasks(&request.session_token, max).await?;
    Ok(Json(PollTasksResponse {
        tasks: tasks.iter().map(TaskDto::from_task).collect(),
    }))
}
