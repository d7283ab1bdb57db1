//! Wire models for the coordinator API.
//!
//! Field names are snake_case on the wire; opaque byte payloads travel as
//! base64 strings.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoreResult};
use crate::task::{RetryPolicy, Task};
use crate::worker::{Capability, WorkflowTypeSpec};
use crate::workflow::{Workflow, WorkflowState};

pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_bytes(field: &str, value: &str) -> CoreResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| CoordinatorError::Validation(format!("field '{}' is not base64: {}", field, e)))
}

pub fn decode_optional(field: &str, value: &Option<String>) -> CoreResult<Vec<u8>> {
    match value {
        Some(value) => decode_bytes(field, value),
        None => Ok(Vec::new()),
    }
}

// === Workflow models ===

#[derive(Debug, Deserialize)]
pub struct StartWorkflowRequest {
    pub workflow_type: String,
    /// Base64 input payload.
    #[serde(default)]
    pub input: Option<String>,
    /// Optional client-supplied id; collisions are rejected.
    #[serde(default)]
    pub workflow_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartWorkflowResponse {
    pub workflow_id: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct WorkflowStatusResponse {
    pub workflow_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl WorkflowStatusResponse {
    pub fn from_workflow(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            state: workflow.state.label().to_string(),
            current_step: workflow.current_step().map(String::from),
            started_at: workflow.started_at.timestamp_millis() as u64,
            completed_at: workflow
                .completed_at
                .map(|t| t.timestamp_millis() as u64),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ResultQuery {
    /// Bound on the wait, milliseconds. Zero answers immediately.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowResultResponse {
    pub workflow_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelWorkflowResponse {
    pub workflow_id: String,
    pub cancelled: bool,
    pub message: String,
}

// === Worker models ===

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
    pub service_name: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub workflow_types: Vec<WorkflowTypeSpec>,
}

fn default_group() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: String,
    pub session_token: String,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_token: String,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub next_heartbeat_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

// === Task models ===

#[derive(Debug, Deserialize)]
pub struct PollTasksRequest {
    pub session_token: String,
    #[serde(default = "default_max_tasks")]
    pub max: usize,
}

fn default_max_tasks() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDto {
    pub task_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub step_name: String,
    pub attempt: u32,
    /// Base64 payload.
    pub input: String,
    pub retry_policy: RetryPolicy,
}

impl TaskDto {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            workflow_id: task.workflow_id.clone(),
            workflow_type: task.workflow_type.clone(),
            step_name: task.step_name.clone(),
            attempt: task.attempt,
            input: encode_bytes(&task.input),
            retry_policy: task.retry.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PollTasksResponse {
    pub tasks: Vec<TaskDto>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteTaskRequest {
    /// Base64 result payload on success.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Worker acknowledges a cancellation.
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStepStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct ReportStepRequest {
    pub status: ReportedStepStatus,
    /// Base64 payload: step input for `started`, output for `completed`.
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// === Task stream frames ===

/// Frames pushed to a worker over its task stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Task { payload: TaskDto },
    Cancel { workflow_id: String, task_id: String },
}

/// Frames a worker sends back on the task stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    Ack { task_id: String },
    Heartbeat { task_id: String },
    Return { task_id: String },
}

// === Admin models ===

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub persistence: String,
}

pub fn result_response(workflow: &Workflow) -> WorkflowResultResponse {
    let (result, error) = match &workflow.state {
        WorkflowState::Completed { result } => (Some(encode_bytes(result)), None),
        WorkflowState::Failed { error } => (None, Some(error.clone())),
        _ => (None, None),
    };
    WorkflowResultResponse {
        workflow_id: workflow.id.clone(),
        state: workflow.state.label().to_string(),
        result,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_minimal() {
        let request: StartWorkflowRequest =
            serde_json::from_str(r#"{"workflow_type": "greet"}"#).unwrap();
        assert_eq!(request.workflow_type, "greet");
        assert!(request.input.is_none());
        assert!(request.workflow_id.is_none());
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(decode_bytes("input", "!!!").is_err());
        assert_eq!(decode_bytes("input", &encode_bytes(b"hi")).unwrap(), b"hi");
    }

    #[test]
    fn test_report_status_parsing() {
        let request: ReportStepRequest =
            serde_json::from_str(r#"{"status": "started"}"#).unwrap();
        assert_eq!(request.status, ReportedStepStatus::Started);

        assert!(serde_json::from_str::<ReportStepRequest>(r#"{"status": "paused"}"#).is_err());
    }

    #[test]
    fn test_server_frame_shape() {
        let frame = ServerFrame::Cancel {
            workflow_id: "wf-1".to_string(),
            task_id: "t-1".to_string(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "cancel");
        assert_eq!(value["workflow_id"], "wf-1");
    }

    #[test]
    fn test_worker_frame_parsing() {
        let frame: WorkerFrame =
            serde_json::from_str(r#"{"type": "heartbeat", "task_id": "t-1"}"#).unwrap();
        assert!(matches!(frame, WorkerFrame::Heartbeat { task_id } if task_id == "t-1"));
    }

    #[test]
    fn test_register_defaults() {
        let request: RegisterWorkerRequest =
            serde_json::from_str(r#"{"service_name": "greeter"}"#).unwrap();
        assert_eq!(request.group, "default");
        assert!(request.capabilities.is_empty());
    }
}
