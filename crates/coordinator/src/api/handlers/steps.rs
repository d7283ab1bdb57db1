//! Step completion and progress reporting handlers.

use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::models::{
    decode_optional, AckResponse, CompleteTaskRequest, ReportStepRequest, ReportedStepStatus,
};
use crate::api::AppState;
use crate::error::CoordinatorError;
use crate::orchestrator::{ReportedStatus, TaskOutcome};

/// POST /v1/tasks/{task_id}/complete
///
/// Idempotent by task id: a duplicate completion returns ok without side
/// effects.
pub async fn complete_task(
    State(orch): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<CompleteTaskRequest>,
) -> Result<Json<AckResponse>, CoordinatorError> {
    let outcome = if request.cancelled {
        TaskOutcome::Cancelled
    } else if let Some(error) = request.error {
        TaskOutcome::Failure(error)
    } else {
        TaskOutcome::Success(decode_optional("result", &request.result)?)
    };
    orch.complete_task(&task_id, outcome).await?;
    Ok(Json(AckResponse::ok()))
}

/// POST /v1/tasks/{task_id}/heartbeat
///
/// Refreshes the task's visibility deadline.
pub async fn task_heartbeat(
    State(orch): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<AckResponse>, CoordinatorError> {
    orch.task_heartbeat(&task_id).await?;
    Ok(Json(AckResponse::ok()))
}

/// POST /v1/workflows/{id}/steps/{step}/report
///
/// Progress narration from workers that run the workflow body themselves;
/// no task-id linkage.
pub async fn report_step(
    State(orch): State<AppState>,
    Path((workflow_id, step_name)): Path<(String, String)>,
    Json(request): Json<ReportStepRequest>,
) -> Result<Json<AckResponse>, CoordinatorError> {
    let status = match request.status {
        ReportedStepStatus::Started => ReportedStatus::Started,
        ReportedStepStatus::Completed => ReportedStatus::Completed,
        ReportedStepStatus::Failed => ReportedStatus::Failed,
    };
    let payload = decode_optional("payload", &request.payload)?;
    orch.report_step(&workflow_id, &step_name, status, payload, request.error)
        .await?;
    Ok(Json(AckResponse::ok()))
}
