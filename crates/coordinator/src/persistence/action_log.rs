//! State + action log tier: write-ahead logging with replay recovery.
//!
//! Layout under `db_path`: one directory per workflow holding
//! `snapshot.json` and an append-only `actions.log` (one version-prefixed
//! JSON record per line). Every mutation is appended and synced before the
//! caller is acknowledged. A checkpoint snapshot is cut when a workflow
//! reaches a terminal state, after which the log is truncated. Recovery
//! reads the snapshot, then replays log entries with a higher sequence
//! number; a torn final line (crash mid-append) is tolerated and the log is
//! treated as ending before it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{CoordinatorError, CoreResult};
use crate::workflow::{Workflow, WorkflowFilter};

use super::{ActionKind, ActionLogEntry, WorkflowStore, STORE_VERSION};

const SNAPSHOT_FILE: &str = "snapshot.json";
const LOG_FILE: &str = "actions.log";

#[derive(Debug, Serialize, Deserialize)]
struct WorkflowSnapshot {
    version: u32,
    seq: u64,
    taken_at: DateTime<Utc>,
    workflow: Workflow,
}

struct Slot {
    workflow: Workflow,
    seq: u64,
}

pub struct ActionLogStore {
    root: PathBuf,
    state: RwLock<HashMap<String, Slot>>,
    healthy: AtomicBool,
}

impl ActionLogStore {
    /// Open the store, replaying every workflow directory under `db_path`.
    pub async fn open(db_path: &Path) -> CoreResult<Self> {
        tokio::fs::create_dir_all(db_path).await?;

        let mut state = HashMap::new();
        let mut entries = tokio::fs::read_dir(db_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let workflow_id = entry.file_name().to_string_lossy().to_string();
            match Self::recover_one(&entry.path()).await {
                Ok(Some(slot)) => {
                    state.insert(workflow_id, slot);
                }
                Ok(None) => {
                    tracing::warn!(workflow_id = %workflow_id, "Empty workflow directory, skipping");
                }
                Err(err) => {
                    return Err(CoordinatorError::Persistence(format!(
                        "failed to recover workflow '{}': {}",
                        workflow_id, err
                    )));
                }
            }
        }

        tracing::info!(
            path = %db_path.display(),
            workflows = state.len(),
            "Recovered state from action log"
        );

        Ok(Self {
            root: db_path.to_path_buf(),
            state: RwLock::new(state),
            healthy: AtomicBool::new(true),
        })
    }

    async fn recover_one(dir: &Path) -> CoreResult<Option<Slot>> {
        let mut slot: Option<Slot> = None;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if tokio::fs::try_exists(&snapshot_path).await? {
            let raw = tokio::fs::read(&snapshot_path).await?;
            let snapshot: WorkflowSnapshot = serde_json::from_slice(&raw)?;
            if snapshot.version != STORE_VERSION {
                return Err(CoordinatorError::Persistence(format!(
                    "snapshot format version {} is not supported",
                    snapshot.version
                )));
            }
            slot = Some(Slot {
                workflow: snapshot.workflow,
                seq: snapshot.seq,
            });
        }

        let log_path = dir.join(LOG_FILE);
        if tokio::fs::try_exists(&log_path).await? {
            let raw = tokio::fs::read_to_string(&log_path).await?;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: ActionLogEntry = match serde_json::from_str(line) {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!(
                            path = %log_path.display(),
                            error = %err,
                            "Torn action log line, stopping replay here"
                        );
                        break;
                    }
                };
                if entry.version != STORE_VERSION {
                    return Err(CoordinatorError::Persistence(format!(
                        "action log format version {} is not supported",
                        entry.version
                    )));
                }
                let base_seq = slot.as_ref().map(|s| s.seq).unwrap_or(0);
                if entry.seq > base_seq {
                    slot = Some(Slot {
                        workflow: entry.record,
                        seq: entry.seq,
                    });
                }
            }
        }

        Ok(slot)
    }

    fn workflow_dir(&self, workflow_id: &str) -> PathBuf {
        self.root.join(workflow_id)
    }

    async fn append_entry(&self, entry: &ActionLogEntry) -> CoreResult<()> {
        let dir = self.workflow_dir(&entry.workflow_id);
        let result: CoreResult<()> = async {
            tokio::fs::create_dir_all(&dir).await?;
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_FILE))
                .await?;
            file.write_all(&line).await?;
            file.sync_data().await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            self.healthy.store(false, Ordering::Relaxed);
        }
        result
    }

    /// Cut a checkpoint snapshot and truncate the log behind it.
    async fn checkpoint(&self, workflow: &Workflow, seq: u64) -> CoreResult<()> {
        let dir = self.workflow_dir(&workflow.id);
        let snapshot = WorkflowSnapshot {
            version: STORE_VERSION,
            seq,
            taken_at: Utc::now(),
            workflow: workflow.clone(),
        };
        let raw = serde_json::to_vec(&snapshot)?;
        let path = dir.join(SNAPSHOT_FILE);
        let tmp = dir.join("snapshot.json.tmp");
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let log_path = dir.join(LOG_FILE);
        if tokio::fs::try_exists(&log_path).await? {
            tokio::fs::remove_file(&log_path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for ActionLogStore {
    async fn create(&self, workflow: &Workflow) -> CoreResult<()> {
        let mut state = self.state.write().await;
        if state.contains_key(&workflow.id) {
            return Err(CoordinatorError::Duplicate(format!(
                "workflow '{}' already exists",
                workflow.id
            )));
        }

        let entry = ActionLogEntry {
            version: STORE_VERSION,
            seq: 1,
            workflow_id: workflow.id.clone(),
            action: ActionKind::WorkflowCreated,
            before: "none".to_string(),
            after: workflow.state.label().to_string(),
            at: Utc::now(),
            record: workflow.clone(),
        };
        self.append_entry(&entry).await?;

        state.insert(
            workflow.id.clone(),
            Slot {
                workflow: workflow.clone(),
                seq: 1,
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> CoreResult<Option<Workflow>> {
        Ok(self.state.read().await.get(id).map(|s| s.workflow.clone()))
    }

    async fn update(&self, workflow: &Workflow, action: ActionKind) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let slot = state.get(&workflow.id).ok_or_else(|| {
            CoordinatorError::NotFound(format!("workflow '{}' not found", workflow.id))
        })?;
        if workflow.revision != slot.workflow.revision + 1 {
            return Err(CoordinatorError::Conflict(format!(
                "workflow '{}' revision {} does not follow stored revision {}",
                workflow.id, workflow.revision, slot.workflow.revision
            )));
        }

        let seq = slot.seq + 1;
        let entry = ActionLogEntry {
            version: STORE_VERSION,
            seq,
            workflow_id: workflow.id.clone(),
            action,
            before: slot.workflow.state.label().to_string(),
            after: workflow.state.label().to_string(),
            at: Utc::now(),
            record: workflow.clone(),
        };
        self.append_entry(&entry).await?;

        if workflow.is_terminal() {
            if let Err(err) = self.checkpoint(workflow, seq).await {
                // The log entry is durable; the checkpoint retries on the
                // next terminal write or is subsumed by replay.
                tracing::warn!(
                    workflow_id = %workflow.id,
                    error = %err,
                    "Checkpoint failed after terminal transition"
                );
            }
        }

        state.insert(
            workflow.id.clone(),
            Slot {
                workflow: workflow.clone(),
                seq,
            },
        );
        Ok(())
    }

    async fn list(&self, filter: &WorkflowFilter) -> CoreResult<Vec<Workflow>> {
        let state = self.state.read().await;
        let mut result: Vec<Workflow> = state
            .values()
            .map(|s| &s.workflow)
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(result)
    }

    async fn load_all(&self) -> CoreResult<Vec<Workflow>> {
        Ok(self
            .state
            .read()
            .await
            .values()
            .map(|s| s.workflow.clone())
            .collect())
    }

    async fn remove(&self, id: &str) -> CoreResult<()> {
        let mut state = self.state.write().await;
        state.remove(id);
        let dir = self.workflow_dir(id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> CoreResult<()> {
        Ok(())
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{StepExecution, StepStatus, WorkflowState};

    fn workflow(id: &str) -> Workflow {
        Workflow::new(id.to_string(), "test-type".to_string(), b"input".to_vec(), None)
    }

    #[tokio::test]
    async fn test_every_mutation_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = workflow("wf-1");

        {
            let store = ActionLogStore::open(dir.path()).await.unwrap();
            store.create(&wf).await.unwrap();

            wf.state = WorkflowState::Running {
                current_step: Some("start".to_string()),
            };
            wf.steps.push(StepExecution::pending("start", 1, b"input".to_vec()));
            wf.touch();
            store.update(&wf, ActionKind::WorkflowStarted).await.unwrap();
            // No flush, no shutdown hook: the log alone must carry this.
        }

        let recovered = ActionLogStore::open(dir.path()).await.unwrap();
        let got = recovered.get("wf-1").await.unwrap().unwrap();
        assert_eq!(got.revision, wf.revision);
        assert_eq!(got.steps.len(), 1);
        assert!(matches!(got.state, WorkflowState::Running { .. }));
    }

    #[tokio::test]
    async fn test_terminal_checkpoint_compacts_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = workflow("wf-1");

        let store = ActionLogStore::open(dir.path()).await.unwrap();
        store.create(&wf).await.unwrap();

        wf.state = WorkflowState::Running { current_step: None };
        wf.touch();
        store.update(&wf, ActionKind::WorkflowStarted).await.unwrap();

        wf.state = WorkflowState::Completed {
            result: b"done".to_vec(),
        };
        wf.touch();
        store.update(&wf, ActionKind::WorkflowCompleted).await.unwrap();

        let wf_dir = dir.path().join("wf-1");
        assert!(wf_dir.join(SNAPSHOT_FILE).exists());
        assert!(!wf_dir.join(LOG_FILE).exists());

        let recovered = ActionLogStore::open(dir.path()).await.unwrap();
        let got = recovered.get("wf-1").await.unwrap().unwrap();
        assert!(matches!(got.state, WorkflowState::Completed { .. }));
    }

    #[tokio::test]
    async fn test_torn_tail_line_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = workflow("wf-1");

        {
            let store = ActionLogStore::open(dir.path()).await.unwrap();
            store.create(&wf).await.unwrap();
            wf.state = WorkflowState::Running { current_step: None };
            wf.touch();
            store.update(&wf, ActionKind::WorkflowStarted).await.unwrap();
        }

        // Simulate a crash mid-append.
        let log_path = dir.path().join("wf-1").join(LOG_FILE);
        let mut raw = std::fs::read_to_string(&log_path).unwrap();
        raw.push_str("{\"version\":1,\"seq\":3,\"workflow_id\":\"wf-1\"");
        std::fs::write(&log_path, raw).unwrap();

        let recovered = ActionLogStore::open(dir.path()).await.unwrap();
        let got = recovered.get("wf-1").await.unwrap().unwrap();
        assert_eq!(got.revision, wf.revision);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ActionLogStore::open(dir.path()).await.unwrap();
        store.create(&workflow("wf-1")).await.unwrap();
        assert!(matches!(
            store.create(&workflow("wf-1")).await.unwrap_err(),
            CoordinatorError::Duplicate(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_deletes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ActionLogStore::open(dir.path()).await.unwrap();
        store.create(&workflow("wf-1")).await.unwrap();
        assert!(dir.path().join("wf-1").exists());

        store.remove("wf-1").await.unwrap();
        assert!(!dir.path().join("wf-1").exists());
        assert!(store.get("wf-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_step_records_replay_faithfully() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = workflow("wf-1");

        {
            let store = ActionLogStore::open(dir.path()).await.unwrap();
            store.create(&wf).await.unwrap();

            wf.state = WorkflowState::Running {
                current_step: Some("start".to_string()),
            };
            let mut step = StepExecution::pending("start", 1, b"input".to_vec());
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            wf.steps.push(step);
            wf.touch();
            store
                .update(
                    &wf,
                    ActionKind::StepStarted {
                        step_name: "start".to_string(),
                        attempt: 1,
                    },
                )
                .await
                .unwrap();

            let record = wf.step_mut("start", 1).unwrap();
            record.status = StepStatus::Failed {
                error: "boom".to_string(),
            };
            record.completed_at = Some(Utc::now());
            wf.steps.push(StepExecution::pending("start", 2, b"input".to_vec()));
            wf.touch();
            store
                .update(
                    &wf,
                    ActionKind::StepFailed {
                        step_name: "start".to_string(),
                        attempt: 1,
                    },
                )
                .await
                .unwrap();
        }

        let recovered = ActionLogStore::open(dir.path()).await.unwrap();
        let got = recovered.get("wf-1").await.unwrap().unwrap();
        assert_eq!(got.steps.len(), 2);
        assert!(matches!(got.steps[0].status, StepStatus::Failed { .. }));
        assert_eq!(got.steps[1].attempt, 2);
        assert_eq!(got.latest_attempt("start"), 2);
    }
}
