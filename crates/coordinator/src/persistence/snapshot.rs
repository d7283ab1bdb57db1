//! Snapshot tier: in-memory state with periodic whole-state snapshots.
//!
//! Recovery replays the latest snapshot only; data loss is bounded by the
//! inter-snapshot interval. Snapshots are written to a temporary file and
//! renamed into place so a crash mid-write never corrupts the previous one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{CoordinatorError, CoreResult};
use crate::workflow::{Workflow, WorkflowFilter};

use super::{ActionKind, WorkflowStore, STORE_VERSION};

const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    taken_at: DateTime<Utc>,
    workflows: Vec<Workflow>,
}

pub struct SnapshotStore {
    workflows: RwLock<HashMap<String, Workflow>>,
    path: PathBuf,
    dirty: AtomicBool,
    healthy: AtomicBool,
}

impl SnapshotStore {
    /// Open (and if present, recover) the snapshot under `db_path`.
    pub async fn open(db_path: &Path) -> CoreResult<Self> {
        tokio::fs::create_dir_all(db_path).await?;
        let path = db_path.join(SNAPSHOT_FILE);

        let mut workflows = HashMap::new();
        if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read(&path).await?;
            let snapshot: SnapshotFile = serde_json::from_slice(&raw)?;
            if snapshot.version != STORE_VERSION {
                return Err(CoordinatorError::Persistence(format!(
                    "snapshot format version {} is not supported",
                    snapshot.version
                )));
            }
            for workflow in snapshot.workflows {
                workflows.insert(workflow.id.clone(), workflow);
            }
            tracing::info!(
                path = %path.display(),
                workflows = workflows.len(),
                "Recovered state from snapshot"
            );
        }

        Ok(Self {
            workflows: RwLock::new(workflows),
            path,
            dirty: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        })
    }

    async fn write_snapshot(&self) -> CoreResult<()> {
        let workflows: Vec<Workflow> = {
            let guard = self.workflows.read().await;
            guard.values().cloned().collect()
        };
        let snapshot = SnapshotFile {
            version: STORE_VERSION,
            taken_at: Utc::now(),
            workflows,
        };
        let raw = serde_json::to_vec(&snapshot)?;

        let tmp = self.path.with_extension("json.tmp");
        let result: CoreResult<()> = async {
            tokio::fs::write(&tmp, &raw).await?;
            tokio::fs::rename(&tmp, &self.path).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.healthy.store(true, Ordering::Relaxed);
                tracing::debug!(path = %self.path.display(), "Snapshot written");
                Ok(())
            }
            Err(err) => {
                self.healthy.store(false, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl WorkflowStore for SnapshotStore {
    async fn create(&self, workflow: &Workflow) -> CoreResult<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(CoordinatorError::Duplicate(format!(
                "workflow '{}' already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, id: &str) -> CoreResult<Option<Workflow>> {
        Ok(self.workflows.read().await.get(id).cloned())
    }

    async fn update(&self, workflow: &Workflow, _action: ActionKind) -> CoreResult<()> {
        let mut workflows = self.workflows.write().await;
        let stored = workflows.get(&workflow.id).ok_or_else(|| {
            CoordinatorError::NotFound(format!("workflow '{}' not found", workflow.id))
        })?;
        if workflow.revision != stored.revision + 1 {
            return Err(CoordinatorError::Conflict(format!(
                "workflow '{}' revision {} does not follow stored revision {}",
                workflow.id, workflow.revision, stored.revision
            )));
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn list(&self, filter: &WorkflowFilter) -> CoreResult<Vec<Workflow>> {
        let workflows = self.workflows.read().await;
        let mut result: Vec<Workflow> = workflows
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(result)
    }

    async fn load_all(&self) -> CoreResult<Vec<Workflow>> {
        Ok(self.workflows.read().await.values().cloned().collect())
    }

    async fn remove(&self, id: &str) -> CoreResult<()> {
        self.workflows.write().await.remove(id);
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> CoreResult<()> {
        if self.dirty.swap(false, Ordering::Relaxed) {
            self.write_snapshot().await?;
        }
        Ok(())
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}
