//! Monitor API: read-only queries and the event subscription channel.
//!
//! The WebSocket channel is bidirectional: clients send tagged request
//! objects and receive tagged responses, while lifecycle events are pushed
//! on the same socket as they commit. A subscriber that falls behind sees a
//! gap marker and should re-read authoritative state via the query
//! endpoints.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::api::models::encode_bytes;
use crate::api::AppState;
use crate::error::CoordinatorError;
use crate::events::{EventDelivery, EventFilter};
use crate::workflow::{Workflow, WorkflowFilter, WorkflowState};

// === DTOs ===

/// Requests a monitor client may send over the channel.
#[derive(Debug, Deserialize, Serialize)]
pub enum ApiRequest {
    ListActiveWorkflows,
    ListAllWorkflows,
    GetWorkflow { workflow_id: String },
    GetWorkflowHistory { workflow_id: String },
}

/// Responses pushed back to the monitor client.
#[derive(Debug, Deserialize, Serialize)]
pub enum ApiResponse {
    WorkflowList { workflows: Vec<WorkflowInfoDto> },
    WorkflowDetail { detail: WorkflowDetailDto },
    WorkflowHistory { history: Vec<StepHistoryDto> },
    Error { message: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowInfoDto {
    pub workflow_id: String,
    pub workflow_type: String,
    pub state: String,
    pub current_step: Option<String>,
    pub started_at: u64,
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepExecutionDto {
    pub step_name: String,
    pub status: String,
    pub attempt: u32,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowDetailDto {
    pub workflow_id: String,
    pub workflow_type: String,
    pub state: String,
    pub current_step: Option<String>,
    pub step_executions: Vec<StepExecutionDto>,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepHistoryDto {
    pub step_name: String,
    pub status: String,
    pub attempt: u32,
    pub timestamp: u64,
    pub duration_ms: Option<u64>,
}

fn millis(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis() as u64
}

impl WorkflowInfoDto {
    fn from_workflow(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            workflow_type: workflow.workflow_type.clone(),
            state: workflow.state.label().to_string(),
            current_step: workflow.current_step().map(String::from),
            started_at: millis(workflow.started_at),
            completed_at: workflow.completed_at.map(millis),
        }
    }
}

impl WorkflowDetailDto {
    fn from_workflow(workflow: &Workflow) -> Self {
        let (result, error) = match &workflow.state {
            WorkflowState::Completed { result } => (Some(encode_bytes(result)), None),
            WorkflowState::Failed { error } => (None, Some(error.clone())),
            _ => (None, None),
        };
        Self {
            workflow_id: workflow.id.clone(),
            workflow_type: workflow.workflow_type.clone(),
            state: workflow.state.label().to_string(),
            current_step: workflow.current_step().map(String::from),
            step_executions: workflow
                .steps
                .iter()
                .map(|step| StepExecutionDto {
                    step_name: step.step_name.clone(),
                    status: step.status.label().to_string(),
                    attempt: step.attempt,
                    started_at: step.started_at.map(millis),
                    completed_at: step.completed_at.map(millis),
                    error: step.status.error().map(String::from),
                })
                .collect(),
            started_at: millis(workflow.started_at),
            completed_at: workflow.completed_at.map(millis),
            result,
            error,
        }
    }
}

fn history_of(workflow: &Workflow) -> Vec<StepHistoryDto> {
    let mut history: Vec<StepHistoryDto> = workflow
        .steps
        .iter()
        .map(|step| {
            let duration_ms = match (step.started_at, step.completed_at) {
                (Some(start), Some(end)) => {
                    Some((end - start).num_milliseconds().max(0) as u64)
                }
                _ => None,
            };
            StepHistoryDto {
                step_name: step.step_name.clone(),
                status: step.status.label().to_string(),
                attempt: step.attempt,
                timestamp: step.started_at.map(millis).unwrap_or(0),
                duration_ms,
            }
        })
        .collect();
    history.sort_by_key(|h| h.timestamp);
    history
}

// === Query endpoints ===

#[derive(Debug, Deserialize, Default)]
pub struct ListWorkflowsQuery {
    /// "active" restricts to non-terminal workflows; anything else is all.
    #[serde(default)]
    pub scope: Option<String>,
    pub workflow_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub state: Option<String>,
}

/// GET /v1/workflows (monitor plane)
pub async fn list_workflows(
    State(orch): State<AppState>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<Json<Vec<WorkflowInfoDto>>, CoordinatorError> {
    let filter = WorkflowFilter {
        active_only: query.scope.as_deref() == Some("active"),
        workflow_type: query.workflow_type,
        since: query.since,
        state: query.state,
    };
    let workflows = orch.list_workflows(&filter).await?;
    Ok(Json(
        workflows.iter().map(WorkflowInfoDto::from_workflow).collect(),
    ))
}

/// GET /v1/workflows/{id} (monitor plane)
pub async fn get_workflow_detail(
    State(orch): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<WorkflowDetailDto>, CoordinatorError> {
    let workflow = orch.get_workflow(&workflow_id).await?;
    Ok(Json(WorkflowDetailDto::from_workflow(&workflow)))
}

// === Event subscription channel ===

#[derive(Debug, Deserialize, Default)]
pub struct SubscribeQuery {
    pub workflow_id: Option<String>,
    pub workflow_type: Option<String>,
}

/// GET /ws (monitor plane)
pub async fn monitor_ws(
    ws: WebSocketUpgrade,
    State(orch): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    let filter = EventFilter {
        workflow_id: query.workflow_id,
        workflow_type: query.workflow_type,
    };
    ws.on_upgrade(move |socket| handle_monitor_socket(socket, orch, filter))
}

async fn handle_monitor_socket(socket: WebSocket, orch: AppState, filter: EventFilter) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = orch.subscribe_events(filter);

    tracing::debug!("Monitor client connected");

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_api_request(&orch, &text).await;
                        let json = match serde_json::to_string(&response) {
                            Ok(json) => json,
                            Err(err) => {
                                tracing::error!(error = %err, "Failed to serialize monitor response");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "Monitor socket error");
                        break;
                    }
                    _ => {}
                }
            }

            delivery = subscription.next() => {
                let json = match delivery {
                    Some(EventDelivery::Event(event)) => match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(err) => {
                            tracing::error!(error = %err, "Failed to serialize event");
                            continue;
                        }
                    },
                    Some(EventDelivery::Gap { missed }) => {
                        serde_json::json!({"event_type": "gap", "missed": missed}).to_string()
                    }
                    None => break,
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Monitor client disconnected");
}

async fn handle_api_request(orch: &AppState, text: &str) -> ApiResponse {
    let request: ApiRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(err) => {
            return ApiResponse::Error {
                message: format!("Invalid request: {}", err),
            }
        }
    };

    match request {
        ApiRequest::ListActiveWorkflows => workflow_list(orch, true).await,
        ApiRequest::ListAllWorkflows => workflow_list(orch, false).await,
        ApiRequest::GetWorkflow { workflow_id } => match orch.get_workflow(&workflow_id).await {
            Ok(workflow) => ApiResponse::WorkflowDetail {
                detail: WorkflowDetailDto::from_workflow(&workflow),
            },
            Err(err) => ApiResponse::Error {
                message: err.to_string(),
            },
        },
        ApiRequest::GetWorkflowHistory { workflow_id } => {
            match orch.get_workflow(&workflow_id).await {
                Ok(workflow) => ApiResponse::WorkflowHistory {
                    history: history_of(&workflow),
                },
                Err(err) => ApiResponse::Error {
                    message: err.to_string(),
                },
            }
        }
    }
}

async fn workflow_list(orch: &AppState, active_only: bool) -> ApiResponse {
    let filter = WorkflowFilter {
        active_only,
        ..Default::default()
    };
    match orch.list_workflows(&filter).await {
        Ok(workflows) => ApiResponse::WorkflowList {
            workflows: workflows.iter().map(WorkflowInfoDto::from_workflow).collect(),
        },
        Err(err) => ApiResponse::Error {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{StepExecution, StepStatus};

    #[test]
    fn test_request_wire_shapes() {
        let request: ApiRequest = serde_json::from_str(r#""ListActiveWorkflows""#).unwrap();
        assert!(matches!(request, ApiRequest::ListActiveWorkflows));

        let request: ApiRequest =
            serde_json::from_str(r#"{"GetWorkflow": {"workflow_id": "wf-1"}}"#).unwrap();
        assert!(matches!(request, ApiRequest::GetWorkflow { workflow_id } if workflow_id == "wf-1"));
    }

    #[test]
    fn test_response_wire_shapes() {
        let response = ApiResponse::Error {
            message: "nope".to_string(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["Error"]["message"], "nope");
    }

    #[test]
    fn test_history_sorted_with_durations() {
        let mut workflow = Workflow::new("wf-1".to_string(), "etl".to_string(), vec![], None);
        let base = Utc::now();

        let mut second = StepExecution::pending("b", 1, vec![]);
        second.status = StepStatus::Completed;
        second.started_at = Some(base + chrono::Duration::seconds(10));
        second.completed_at = Some(base + chrono::Duration::seconds(12));

        let mut first = StepExecution::pending("a", 1, vec![]);
        first.status = StepStatus::Completed;
        first.started_at = Some(base);
        first.completed_at = Some(base + chrono::Duration::seconds(3));

        workflow.steps.push(second);
        workflow.steps.push(first);

        let history = history_of(&workflow);
        assert_eq!(history[0].step_name, "a");
        assert_eq!(history[0].duration_ms, Some(3_000));
        assert_eq!(history[1].step_name, "b");
        assert_eq!(history[1].duration_ms, Some(2_000));
    }

    #[test]
    fn test_detail_includes_step_errors() {
        let mut workflow = Workflow::new("wf-1".to_string(), "etl".to_string(), vec![], None);
        let mut step = StepExecution::pending("a", 1, vec![]);
        step.status = StepStatus::Failed {
            error: "boom".to_string(),
        };
        workflow.steps.push(step);

        let detail = WorkflowDetailDto::from_workflow(&workflow);
        assert_eq!(detail.step_executions[0].error.as_deref(), Some("boom"));
        assert_eq!(detail.step_executions[0].status, "failed");
    }
}
