//! Worker registry: live workers, advertised capabilities, session liveness.
//!
//! A session token is issued at registration and must accompany every
//! subsequent worker operation; tokens of dead sessions are rejected so a
//! stale worker cannot act after its slot was revived.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoordinatorError, CoreResult};
use crate::worker::{Capability, SessionState, WorkerRecord, WorkflowTypeSpec};

/// Registration request as the registry sees it.
#[derive(Debug, Clone)]
pub struct RegisterSpec {
    pub worker_id: Option<String>,
    pub service_name: String,
    pub group: String,
    pub capabilities: Vec<Capability>,
    pub workflow_types: Vec<WorkflowTypeSpec>,
}

#[derive(Default)]
struct Inner {
    workers: HashMap<String, WorkerRecord>,
    /// session_token -> worker_id
    tokens: HashMap<String, String>,
}

pub struct WorkerRegistry {
    inner: RwLock<Inner>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Register a worker, assigning a worker id when none is supplied.
    /// A worker id already held by a live session is rejected; a dead slot
    /// is revived with a fresh session token.
    pub async fn register(&self, spec: RegisterSpec) -> CoreResult<WorkerRecord> {
        let mut inner = self.inner.write().await;

        let worker_id = spec
            .worker_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = inner.workers.get(&worker_id) {
            if existing.session != SessionState::Dead {
                return Err(CoordinatorError::Duplicate(format!(
                    "worker '{}' is already registered",
                    worker_id
                )));
            }
            let stale_token = existing.session_token.clone();
            inner.tokens.remove(&stale_token);
        }

        let now = Utc::now();
        let record = WorkerRecord {
            worker_id: worker_id.clone(),
            service_name: spec.service_name,
            group: spec.group,
            capabilities: spec.capabilities,
            workflow_types: spec.workflow_types,
            session_token: Uuid::new_v4().to_string(),
            session: SessionState::Active,
            last_heartbeat_at: now,
            registered_at: now,
        };

        inner
            .tokens
            .insert(record.session_token.clone(), worker_id.clone());
        inner.workers.insert(worker_id.clone(), record.clone());

        tracing::info!(
            worker_id = %record.worker_id,
            service_name = %record.service_name,
            group = %record.group,
            types = record.workflow_types.len(),
            "Worker registered"
        );

        Ok(record)
    }

    /// Resolve a session token to its worker record, rejecting dead
    /// sessions.
    pub async fn authorize(&self, session_token: &str) -> CoreResult<WorkerRecord> {
        let inner = self.inner.read().await;
        let worker_id = inner
            .tokens
            .get(session_token)
            .ok_or_else(|| CoordinatorError::NotFound("unknown session token".to_string()))?;
        let record = inner
            .workers
            .get(worker_id)
            .ok_or_else(|| CoordinatorError::NotFound("unknown session token".to_string()))?;
        if record.session == SessionState::Dead {
            return Err(CoordinatorError::ProtocolViolation(
                "session is no longer live".to_string(),
            ));
        }
        Ok(record.clone())
    }

    /// Refresh liveness; returns the interval before the next heartbeat is
    /// due.
    pub async fn heartbeat(&self, session_token: &str) -> CoreResult<Duration> {
        let mut inner = self.inner.write().await;
        let worker_id = inner
            .tokens
            .get(session_token)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound("unknown session token".to_string()))?;
        let record = inner
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| CoordinatorError::NotFound("unknown session token".to_string()))?;
        if record.session == SessionState::Dead {
            return Err(CoordinatorError::ProtocolViolation(
                "session is no longer live".to_string(),
            ));
        }
        record.last_heartbeat_at = Utc::now();
        Ok(self.heartbeat_timeout / 3)
    }

    /// Transition a worker to draining: no new dispatch, in-flight tasks may
    /// complete.
    pub async fn drain(&self, session_token: &str) -> CoreResult<()> {
        let mut inner = self.inner.write().await;
        let worker_id = inner
            .tokens
            .get(session_token)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound("unknown session token".to_string()))?;
        if let Some(record) = inner.workers.get_mut(&worker_id) {
            if record.session == SessionState::Active {
                record.session = SessionState::Draining;
                tracing::info!(worker_id = %worker_id, "Worker draining");
            }
        }
        Ok(())
    }

    /// Active workers advertising the given workflow type.
    pub async fn lookup_for(&self, workflow_type: &str) -> Vec<WorkerRecord> {
        let inner = self.inner.read().await;
        inner
            .workers
            .values()
            .filter(|w| w.serves(workflow_type))
            .cloned()
            .collect()
    }

    /// Declared step plan for a workflow type, if any registered worker
    /// advertises one.
    pub async fn declared_steps(&self, workflow_type: &str) -> Option<Vec<String>> {
        let inner = self.inner.read().await;
        inner
            .workers
            .values()
            .filter(|w| w.session != SessionState::Dead)
            .flat_map(|w| w.workflow_types.iter())
            .find(|t| t.name == workflow_type && !t.steps.is_empty())
            .map(|t| t.steps.clone())
    }

    /// Mark workers whose heartbeat lapsed as dead; returns the newly dead
    /// records so their claims can be released.
    pub async fn reap_expired(&self) -> Vec<WorkerRecord> {
        let deadline = Utc::now()
            - chrono::Duration::from_std(self.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let mut inner = self.inner.write().await;
        let mut dead = Vec::new();
        for record in inner.workers.values_mut() {
            if record.session != SessionState::Dead && record.last_heartbeat_at < deadline {
                record.session = SessionState::Dead;
                tracing::warn!(
                    worker_id = %record.worker_id,
                    last_heartbeat_at = %record.last_heartbeat_at,
                    "Worker heartbeat lapsed, marking dead"
                );
                dead.push(record.clone());
            }
        }
        dead
    }

    pub async fn list(&self) -> Vec<WorkerRecord> {
        self.inner.read().await.workers.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .workers
            .values()
            .filter(|w| w.session == SessionState::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(worker_id: Option<&str>) -> RegisterSpec {
        RegisterSpec {
            worker_id: worker_id.map(|s| s.to_string()),
            service_name: "greeter".to_string(),
            group: "default".to_string(),
            capabilities: vec![],
            workflow_types: vec![WorkflowTypeSpec {
                name: "greet".to_string(),
                steps: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn test_register_assigns_id_and_token() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        let record = registry.register(spec(None)).await.unwrap();
        assert!(!record.worker_id.is_empty());
        assert!(!record.session_token.is_empty());
        assert_eq!(record.session, SessionState::Active);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        registry.register(spec(Some("worker-1"))).await.unwrap();

        let err = registry.register(spec(Some("worker-1"))).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_dead_slot_is_revived() {
        let registry = WorkerRegistry::new(Duration::from_millis(1));
        let first = registry.register(spec(Some("worker-1"))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let dead = registry.reap_expired().await;
        assert_eq!(dead.len(), 1);

        let revived = registry.register(spec(Some("worker-1"))).await.unwrap();
        assert_ne!(revived.session_token, first.session_token);
        assert_eq!(revived.session, SessionState::Active);

        // The stale token must no longer authorize anything.
        assert!(registry.authorize(&first.session_token).await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_worker_alive() {
        let registry = WorkerRegistry::new(Duration::from_millis(40));
        let record = registry.register(spec(Some("worker-1"))).await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            registry.heartbeat(&record.session_token).await.unwrap();
        }
        assert!(registry.reap_expired().await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_for_returns_only_active_matching() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        let record = registry.register(spec(Some("worker-1"))).await.unwrap();

        let mut other = spec(Some("worker-2"));
        other.workflow_types = vec![WorkflowTypeSpec {
            name: "etl".to_string(),
            steps: vec![],
        }];
        registry.register(other).await.unwrap();

        let found = registry.lookup_for("greet").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].worker_id, "worker-1");

        registry.drain(&record.session_token).await.unwrap();
        assert!(registry.lookup_for("greet").await.is_empty());
    }

    #[tokio::test]
    async fn test_declared_steps_resolution() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        let mut planned = spec(Some("worker-1"));
        planned.workflow_types = vec![WorkflowTypeSpec {
            name: "etl".to_string(),
            steps: vec!["extract".to_string(), "load".to_string()],
        }];
        registry.register(planned).await.unwrap();

        assert_eq!(
            registry.declared_steps("etl").await,
            Some(vec!["extract".to_string(), "load".to_string()])
        );
        assert_eq!(registry.declared_steps("greet").await, None);
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        assert!(matches!(
            registry.heartbeat("nope").await.unwrap_err(),
            CoordinatorError::NotFound(_)
        ));
    }
}
