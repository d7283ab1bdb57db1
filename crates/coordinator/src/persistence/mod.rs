//! Tiered durable storage for workflow state.
//!
//! Three tiers share one `WorkflowStore` trait, selected at startup:
//! memory (lost on restart), snapshot (periodic whole-state file), and
//! state-action-log (per-workflow write-ahead log, replayed on recovery).
//! All operations are atomic with respect to a single workflow id; callers
//! provide the per-workflow serialization discipline.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoreResult};
use crate::workflow::{Workflow, WorkflowFilter};

pub mod action_log;
pub mod memory;
pub mod snapshot;

pub use action_log::ActionLogStore;
pub use memory::MemoryStore;
pub use snapshot::SnapshotStore;

/// Format version stamped on every persisted record.
pub const STORE_VERSION: u32 = 1;

/// Durability tier selected at server start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceMode {
    Memory,
    Snapshot,
    StateActionLog,
}

impl std::str::FromStr for PersistenceMode {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(PersistenceMode::Memory),
            "snapshot" => Ok(PersistenceMode::Snapshot),
            "state-action-log" => Ok(PersistenceMode::StateActionLog),
            other => Err(CoordinatorError::Validation(format!(
                "unknown persistence mode '{}', expected memory|snapshot|state-action-log",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceMode::Memory => write!(f, "memory"),
            PersistenceMode::Snapshot => write!(f, "snapshot"),
            PersistenceMode::StateActionLog => write!(f, "state-action-log"),
        }
    }
}

/// The mutation an update represents; recorded in the action log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    WorkflowCreated,
    WorkflowStarted,
    CancelRequested,
    StepScheduled { step_name: String, attempt: u32 },
    StepStarted { step_name: String, attempt: u32 },
    StepCompleted { step_name: String, attempt: u32 },
    StepFailed { step_name: String, attempt: u32 },
    StepReported { step_name: String },
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

/// One append-only record of the action log. `record` is the full
/// post-action state and doubles as the replay payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub version: u32,
    pub seq: u64,
    pub workflow_id: String,
    pub action: ActionKind,
    pub before: String,
    pub after: String,
    pub at: DateTime<Utc>,
    pub record: Workflow,
}

/// Uniform persistence interface over the three tiers.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert a fresh workflow; colliding ids yield `Duplicate`.
    async fn create(&self, workflow: &Workflow) -> CoreResult<()>;

    async fn get(&self, id: &str) -> CoreResult<Option<Workflow>>;

    /// Persist an updated record. The incoming revision must advance the
    /// stored one by exactly one, otherwise `Conflict`. On the action-log
    /// tier the entry is appended and synced before this returns.
    async fn update(&self, workflow: &Workflow, action: ActionKind) -> CoreResult<()>;

    async fn list(&self, filter: &WorkflowFilter) -> CoreResult<Vec<Workflow>>;

    /// Everything the store holds; used once at startup, before any
    /// mutation is accepted.
    async fn load_all(&self) -> CoreResult<Vec<Workflow>>;

    /// Drop a workflow entirely (retention sweep).
    async fn remove(&self, id: &str) -> CoreResult<()>;

    /// Force durable state out (snapshot tier); no-op elsewhere.
    async fn flush(&self) -> CoreResult<()>;

    /// False once a write has failed; the coordinator degrades to
    /// read-only.
    fn healthy(&self) -> bool;
}

/// Open the store for the configured tier.
pub async fn open_store(
    mode: PersistenceMode,
    db_path: &Path,
) -> CoreResult<Arc<dyn WorkflowStore>> {
    match mode {
        PersistenceMode::Memory => Ok(Arc::new(MemoryStore::new())),
        PersistenceMode::Snapshot => Ok(Arc::new(SnapshotStore::open(db_path).await?)),
        PersistenceMode::StateActionLog => Ok(Arc::new(ActionLogStore::open(db_path).await?)),
    }
}
