//! Client-plane workflow handlers.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::api::models::{
    decode_optional, result_response, CancelWorkflowResponse, ResultQuery, StartWorkflowRequest,
    StartWorkflowResponse, WorkflowResultResponse, WorkflowStatusResponse,
};
use crate::api::AppState;
use crate::error::CoordinatorError;
use crate::orchestrator::CancelOutcome;

/// POST /v1/workflows
pub async fn start_workflow(
    State(orch): State<AppState>,
    Json(request): Json<StartWorkflowRequest>,
) -> Result<Json<StartWorkflowResponse>, CoordinatorError> {
    if request.workflow_type.is_empty() {
        return Err(CoordinatorError::Validation(
            "workflow_type must not be empty".to_string(),
        ));
    }
    let input = decode_optional("input", &request.input)?;
    let workflow_id = orch
        .start_workflow(&request.workflow_type, input, request.workflow_id)
        .await?;
    Ok(Json(StartWorkflowResponse {
        workflow_id,
        state: "running".to_string(),
    }))
}

/// GET /v1/workflows/{id}
pub async fn get_workflow_status(
    State(orch): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<WorkflowStatusResponse>, CoordinatorError> {
    let workflow = orch.get_workflow(&workflow_id).await?;
    Ok(Json(WorkflowStatusResponse::from_workflow(&workflow)))
}

/// GET /v1/workflows/{id}/result
///
/// Blocks up to `timeout_ms`; a workflow that is still running when the
/// bound elapses is reported as such, not as an error.
pub async fn get_workflow_result(
    State(orch): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<WorkflowResultResponse>, CoordinatorError> {
    let timeout = Duration::from_millis(query.timeout_ms.unwrap_or(0));
    orch.await_result(&workflow_id, timeout).await?;
    let workflow = orch.get_workflow(&workflow_id).await?;
    Ok(Json(result_response(&workflow)))
}

/// DELETE /v1/workflows/{id}
pub async fn cancel_workflow(
    State(orch): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<CancelWorkflowResponse>, CoordinatorError> {
    let outcome = orch.cancel_workflow(&workflow_id).await?;
    let response = match outcome {
        CancelOutcome::Accepted => CancelWorkflowResponse {
            workflow_id,
            cancelled: true,
            message: "cancellation accepted".to_string(),
        },
        CancelOutcome::AlreadyTerminal => CancelWorkflowResponse {
            workflow_id,
            cancelled: false,
            message: "workflow is already terminal".to_string(),
        },
    };
    Ok(Json(response))
}
