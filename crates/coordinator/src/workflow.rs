//! Workflow and step execution records.
//!
//! `WorkflowState` carries the lifecycle state machine; transition helpers
//! return `None` for disallowed transitions so callers cannot move a
//! terminal workflow. The coordinator's lifecycle engine is the sole mutator
//! of these records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running { current_step: Option<String> },
    Completed { result: Vec<u8> },
    Failed { error: String },
    Cancelled,
}

impl WorkflowState {
    /// Whether the state is absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed { .. } | WorkflowState::Failed { .. } | WorkflowState::Cancelled
        )
    }

    /// Wire label for the state.
    pub fn label(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running { .. } => "running",
            WorkflowState::Completed { .. } => "completed",
            WorkflowState::Failed { .. } => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }

    pub fn start(&self) -> Option<Self> {
        match self {
            WorkflowState::Pending => Some(WorkflowState::Running { current_step: None }),
            _ => None,
        }
    }

    pub fn step_started(&self, step_name: &str) -> Option<Self> {
        match self {
            WorkflowState::Running { .. } => Some(WorkflowState::Running {
                current_step: Some(step_name.to_string()),
            }),
            _ => None,
        }
    }

    pub fn step_cleared(&self) -> Option<Self> {
        match self {
            WorkflowState::Running { .. } => Some(WorkflowState::Running { current_step: None }),
            _ => None,
        }
    }

    pub fn complete(&self, result: Vec<u8>) -> Option<Self> {
        match self {
            WorkflowState::Running { .. } => Some(WorkflowState::Completed { result }),
            _ => None,
        }
    }

    pub fn fail(&self, error: String) -> Option<Self> {
        match self {
            WorkflowState::Running { .. } => Some(WorkflowState::Failed { error }),
            _ => None,
        }
    }

    pub fn cancel(&self) -> Option<Self> {
        match self {
            WorkflowState::Pending | WorkflowState::Running { .. } => {
                Some(WorkflowState::Cancelled)
            }
            _ => None,
        }
    }
}

/// Status of a single step attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed { error: String },
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed { .. } | StepStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed { .. } => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StepStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One record per attempted step. Attempt records are appended, never
/// overwritten; a retry adds a new record with an incremented attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_name: String,
    pub status: StepStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<u8>>,
}

impl StepExecution {
    pub fn pending(step_name: &str, attempt: u32, input: Vec<u8>) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Pending,
            attempt,
            started_at: None,
            completed_at: None,
            input,
            output: None,
        }
    }
}

/// A durable execution instance of a named workflow type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub workflow_type: String,
    pub state: WorkflowState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<u8>,
    /// Ordered step attempt records.
    #[serde(default)]
    pub steps: Vec<StepExecution>,
    /// Declared step list; `None` means the worker drives the body itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<String>>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every persisted mutation; the store rejects stale
    /// revisions with a conflict.
    pub revision: u64,
}

impl Workflow {
    pub fn new(id: String, workflow_type: String, input: Vec<u8>, plan: Option<Vec<String>>) -> Self {
        let now = Utc::now();
        Workflow {
            id,
            workflow_type,
            state: WorkflowState::Pending,
            input,
            steps: Vec::new(),
            plan,
            cancel_requested: false,
            started_at: now,
            completed_at: None,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn current_step(&self) -> Option<&str> {
        match &self.state {
            WorkflowState::Running { current_step } => current_step.as_deref(),
            _ => None,
        }
    }

    /// Latest attempt number recorded for a step, 0 if never attempted.
    pub fn latest_attempt(&self, step_name: &str) -> u32 {
        self.steps
            .iter()
            .filter(|s| s.step_name == step_name)
            .map(|s| s.attempt)
            .max()
            .unwrap_or(0)
    }

    /// Mutable access to a specific attempt record.
    pub fn step_mut(&mut self, step_name: &str, attempt: u32) -> Option<&mut StepExecution> {
        self.steps
            .iter_mut()
            .find(|s| s.step_name == step_name && s.attempt == attempt)
    }

    /// The step after `step_name` in the declared plan.
    pub fn next_planned_step(&self, step_name: &str) -> Option<&str> {
        let plan = self.plan.as_ref()?;
        let idx = plan.iter().position(|s| s == step_name)?;
        plan.get(idx + 1).map(|s| s.as_str())
    }

    /// The name of the first task dispatched for this workflow.
    pub fn initial_step(&self) -> &str {
        self.plan
            .as_ref()
            .and_then(|p| p.first())
            .map(|s| s.as_str())
            .unwrap_or("start")
    }

    /// Count of step records currently in `Running` status.
    pub fn running_step_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }
}

/// Filter for listing workflows through the Monitor API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowFilter {
    /// Only non-terminal workflows.
    #[serde(default)]
    pub active_only: bool,
    pub workflow_type: Option<String>,
    /// Only workflows started at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only workflows in this state (wire label).
    pub state: Option<String>,
}

impl WorkflowFilter {
    pub fn matches(&self, workflow: &Workflow) -> bool {
        if self.active_only && workflow.is_terminal() {
            return false;
        }
        if let Some(t) = &self.workflow_type {
            if &workflow.workflow_type != t {
                return false;
            }
        }
        if let Some(since) = self.since {
            if workflow.started_at < since {
                return false;
            }
        }
        if let Some(state) = &self.state {
            if workflow.state.label() != state {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_lifecycle() {
        let workflow = Workflow::new(
            "wf-1".to_string(),
            "test-workflow".to_string(),
            b"input".to_vec(),
            None,
        );
        assert!(matches!(workflow.state, WorkflowState::Pending));

        let started = workflow.state.start().unwrap();
        assert!(matches!(started, WorkflowState::Running { .. }));

        let step_started = started.step_started("step1").unwrap();
        assert!(matches!(
            step_started,
            WorkflowState::Running { current_step: Some(ref step) } if step == "step1"
        ));

        let completed = step_started.complete(b"result".to_vec()).unwrap();
        assert!(matches!(
            completed,
            WorkflowState::Completed { result } if result == b"result"
        ));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let completed = WorkflowState::Completed { result: vec![] };
        assert!(completed.start().is_none());
        assert!(completed.fail("boom".to_string()).is_none());
        assert!(completed.cancel().is_none());

        let failed = WorkflowState::Failed {
            error: "boom".to_string(),
        };
        assert!(failed.cancel().is_none());
        assert!(failed.complete(vec![]).is_none());

        assert!(WorkflowState::Cancelled.start().is_none());
    }

    #[test]
    fn test_cancel_from_pending_and_running() {
        assert!(matches!(
            WorkflowState::Pending.cancel(),
            Some(WorkflowState::Cancelled)
        ));
        let running = WorkflowState::Running { current_step: None };
        assert!(matches!(running.cancel(), Some(WorkflowState::Cancelled)));
    }

    #[test]
    fn test_plan_navigation() {
        let workflow = Workflow::new(
            "wf-1".to_string(),
            "pipeline".to_string(),
            vec![],
            Some(vec![
                "extract".to_string(),
                "transform".to_string(),
                "load".to_string(),
            ]),
        );

        assert_eq!(workflow.initial_step(), "extract");
        assert_eq!(workflow.next_planned_step("extract"), Some("transform"));
        assert_eq!(workflow.next_planned_step("transform"), Some("load"));
        assert_eq!(workflow.next_planned_step("load"), None);
    }

    #[test]
    fn test_initial_step_defaults_to_start() {
        let workflow = Workflow::new("wf-1".to_string(), "greet".to_string(), vec![], None);
        assert_eq!(workflow.initial_step(), "start");
    }

    #[test]
    fn test_latest_attempt() {
        let mut workflow = Workflow::new("wf-1".to_string(), "t".to_string(), vec![], None);
        assert_eq!(workflow.latest_attempt("step1"), 0);

        workflow
            .steps
            .push(StepExecution::pending("step1", 1, vec![]));
        workflow
            .steps
            .push(StepExecution::pending("step1", 2, vec![]));
        assert_eq!(workflow.latest_attempt("step1"), 2);
        assert_eq!(workflow.latest_attempt("step2"), 0);
    }

    #[test]
    fn test_filter_matches() {
        let mut workflow = Workflow::new("wf-1".to_string(), "etl".to_string(), vec![], None);

        let all = WorkflowFilter::default();
        assert!(all.matches(&workflow));

        let by_type = WorkflowFilter {
            workflow_type: Some("etl".to_string()),
            ..Default::default()
        };
        assert!(by_type.matches(&workflow));

        workflow.state = WorkflowState::Completed { result: vec![] };
        let active = WorkflowFilter {
            active_only: true,
            ..Default::default()
        };
        assert!(!active.matches(&workflow));

        let by_state = WorkflowFilter {
            state: Some("completed".to_string()),
            ..Default::default()
        };
        assert!(by_state.matches(&workflow));
    }
}
