//! Worker registration records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of unit a worker is willing to execute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Step,
    Activity,
    Workflow,
}

/// An advertised (name, kind) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub name: String,
    pub kind: CapabilityKind,
}

/// A workflow type a worker serves. A non-empty `steps` list declares the
/// step plan for that type; an empty list means the worker drives the
/// workflow body itself and narrates steps via report-step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTypeSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
}

/// Session liveness state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Draining,
    Dead,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Dead => "dead",
        }
    }
}

/// Registration record for a live worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub service_name: String,
    pub group: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub workflow_types: Vec<WorkflowTypeSpec>,
    pub session_token: String,
    pub session: SessionState,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Whether this worker may be offered tasks of the given type.
    pub fn serves(&self, workflow_type: &str) -> bool {
        self.session == SessionState::Active
            && self.workflow_types.iter().any(|t| t.name == workflow_type)
    }

    /// Names of all advertised workflow types.
    pub fn advertised_types(&self) -> Vec<String> {
        self.workflow_types.iter().map(|t| t.name.clone()).collect()
    }
}
