//! In-process store for development and tests. Lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{CoordinatorError, CoreResult};
use crate::workflow::{Workflow, WorkflowFilter};

use super::{ActionKind, WorkflowStore};

pub struct MemoryStore {
    workflows: RwLock<HashMap<String, Workflow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            workflows: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn create(&self, workflow: &Workflow) -> CoreResult<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(CoordinatorError::Duplicate(format!(
                "workflow '{}' already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
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
        Ok(())
    }

    async fn flush(&self) -> CoreResult<()> {
        Ok(())
    }

    fn healthy(&self) -> bool {
        true
    }
}
