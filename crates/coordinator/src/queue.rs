//! Per-workflow-type FIFO task queues with claim semantics.
//!
//! A task is claimed at dispatch: the claiming worker's session token and a
//! visibility deadline are recorded, and the task is not offered to anyone
//! else. Releasing a claim (explicit return, worker death, visibility
//! expiry) puts the task back at the head of its queue so FIFO order per
//! workflow survives redelivery. Enqueueing is idempotent keyed by
//! (workflow_id, step_name, attempt), and completed task ids are remembered
//! so duplicate completions are acknowledged without side effects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::task::Task;

/// A dispatched task together with its claim bookkeeping.
#[derive(Debug, Clone)]
pub struct Claim {
    pub task: Task,
    pub session_token: String,
    pub deadline: Instant,
}

/// Outcome of completing a task by id.
#[derive(Debug)]
pub enum CompleteOutcome {
    /// First completion; the claimed task is handed back for state advance.
    Completed(Task),
    /// Duplicate completion; already processed.
    AlreadyCompleted,
    /// Task id was never dispatched.
    Unknown,
}

#[derive(Default)]
struct Inner {
    /// workflow_type -> FIFO of dispatchable tasks.
    queues: HashMap<String, VecDeque<Task>>,
    /// Dedup keys of tasks that are queued or claimed.
    live: HashSet<(String, String, u32)>,
    /// task_id -> claim.
    claims: HashMap<String, Claim>,
    /// task_ids that reached completion.
    completed: HashSet<String>,
}

pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl TaskQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Enqueue at the tail. Returns false when an equivalent task (same
    /// workflow, step, attempt) is already live.
    pub async fn enqueue(&self, task: Task) -> bool {
        self.push(task, false).await
    }

    /// Enqueue at the head, used for redelivery.
    pub async fn enqueue_front(&self, task: Task) -> bool {
        self.push(task, true).await
    }

    async fn push(&self, task: Task, front: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let key = task.dedup_key();
        if inner.live.contains(&key) {
            tracing::debug!(
                workflow_id = %task.workflow_id,
                step_name = %task.step_name,
                attempt = task.attempt,
                "Task already live, skipping enqueue"
            );
            return false;
        }
        inner.live.insert(key);
        let queue = inner.queues.entry(task.workflow_type.clone()).or_default();
        if front {
            queue.push_front(task);
        } else {
            queue.push_back(task);
        }
        drop(inner);
        self.notify.notify_waiters();
        true
    }

    /// Claim up to `max` tasks matching the given workflow types for the
    /// session. Claimed tasks carry a visibility deadline refreshed by task
    /// heartbeats.
    pub async fn claim(&self, workflow_types: &[String], session_token: &str, max: usize) -> Vec<Task> {
        let mut inner = self.inner.lock().await;
        let mut claimed = Vec::new();
        let deadline = Instant::now() + self.visibility_timeout;

        'outer: for workflow_type in workflow_types {
            while claimed.len() < max {
                let task = match inner.queues.get_mut(workflow_type).and_then(|q| q.pop_front()) {
                    Some(task) => task,
                    None => continue 'outer,
                };
                inner.claims.insert(
                    task.task_id.clone(),
                    Claim {
                        task: task.clone(),
                        session_token: session_token.to_string(),
                        deadline,
                    },
                );
                claimed.push(task);
            }
            if claimed.len() >= max {
                break;
            }
        }
        claimed
    }

    /// Park until new tasks may be available.
    pub async fn wait_for_tasks(&self) {
        self.notify.notified().await;
    }

    /// Resolve a completion by task id. The first completion removes the
    /// claim and retires the dedup key; repeats are reported as such.
    pub async fn complete(&self, task_id: &str) -> CompleteOutcome {
        let mut inner = self.inner.lock().await;
        if let Some(claim) = inner.claims.remove(task_id) {
            inner.live.remove(&claim.task.dedup_key());
            inner.completed.insert(task_id.to_string());
            return CompleteOutcome::Completed(claim.task);
        }
        if inner.completed.contains(task_id) {
            return CompleteOutcome::AlreadyCompleted;
        }
        CompleteOutcome::Unknown
    }

    /// The task behind a live claim, if any.
    pub async fn claimed_task(&self, task_id: &str) -> Option<Task> {
        let inner = self.inner.lock().await;
        inner.claims.get(task_id).map(|c| c.task.clone())
    }

    /// Whether this task id already completed.
    pub async fn is_completed(&self, task_id: &str) -> bool {
        self.inner.lock().await.completed.contains(task_id)
    }

    /// Refresh the visibility deadline for a claimed task.
    pub async fn heartbeat(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let timeout = self.visibility_timeout;
        match inner.claims.get_mut(task_id) {
            Some(claim) => {
                claim.deadline = Instant::now() + timeout;
                true
            }
            None => false,
        }
    }

    /// Explicitly return a claimed task to the head of its queue.
    pub async fn release(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(claim) = inner.claims.remove(task_id) {
            inner
                .queues
                .entry(claim.task.workflow_type.clone())
                .or_default()
                .push_front(claim.task);
            drop(inner);
            self.notify.notify_waiters();
            return true;
        }
        false
    }

    /// Drop claims whose visibility deadline has passed. The claims are
    /// handed back so the lifecycle engine can record the lost attempt and
    /// re-enqueue.
    pub async fn release_expired(&self) -> Vec<Claim> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .claims
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut released = Vec::new();
        for task_id in expired {
            if let Some(claim) = inner.claims.remove(&task_id) {
                inner.live.remove(&claim.task.dedup_key());
                released.push(claim);
            }
        }
        released
    }

    /// Drop every claim held by a session (worker death or drain-abort).
    pub async fn release_session(&self, session_token: &str) -> Vec<Claim> {
        let mut inner = self.inner.lock().await;
        let held: Vec<String> = inner
            .claims
            .iter()
            .filter(|(_, c)| c.session_token == session_token)
            .map(|(id, _)| id.clone())
            .collect();
        let mut released = Vec::new();
        for task_id in held {
            if let Some(claim) = inner.claims.remove(&task_id) {
                inner.live.remove(&claim.task.dedup_key());
                released.push(claim);
            }
        }
        released
    }

    /// Purge queued (unclaimed) tasks for a workflow, e.g. on cancellation.
    pub async fn remove_workflow(&self, workflow_id: &str) -> usize {
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        let mut freed: Vec<(String, String, u32)> = Vec::new();
        for queue in inner.queues.values_mut() {
            queue.retain(|task| {
                if task.workflow_id == workflow_id {
                    freed.push(task.dedup_key());
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        for key in freed {
            inner.live.remove(&key);
        }
        removed
    }

    /// Current claims against a workflow.
    pub async fn claims_for_workflow(&self, workflow_id: &str) -> Vec<Claim> {
        let inner = self.inner.lock().await;
        inner
            .claims
            .values()
            .filter(|c| c.task.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    /// Total queued (unclaimed) tasks across all types.
    pub async fn depth(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.queues.values().map(|q| q.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RetryPolicy;

    fn task(workflow_id: &str, step: &str, attempt: u32) -> Task {
        Task::new(workflow_id, "etl", step, attempt, vec![], RetryPolicy::default())
    }

    fn types() -> Vec<String> {
        vec!["etl".to_string()]
    }

    #[tokio::test]
    async fn test_fifo_order_per_type() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        queue.enqueue(task("wf-1", "a", 1)).await;
        queue.enqueue(task("wf-2", "a", 1)).await;

        let claimed = queue.claim(&types(), "tok", 10).await;
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].workflow_id, "wf-1");
        assert_eq!(claimed[1].workflow_id, "wf-2");
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_attempt() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        assert!(queue.enqueue(task("wf-1", "a", 1)).await);
        assert!(!queue.enqueue(task("wf-1", "a", 1)).await);
        assert!(queue.enqueue(task("wf-1", "a", 2)).await);
        assert_eq!(queue.depth().await, 2);
    }

    #[tokio::test]
    async fn test_claimed_task_is_not_reoffered() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        queue.enqueue(task("wf-1", "a", 1)).await;

        let first = queue.claim(&types(), "tok-1", 10).await;
        assert_eq!(first.len(), 1);

        let second = queue.claim(&types(), "tok-2", 10).await;
        assert!(second.is_empty());

        // The dedup key is still held by the claim.
        assert!(!queue.enqueue(task("wf-1", "a", 1)).await);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        queue.enqueue(task("wf-1", "a", 1)).await;
        let claimed = queue.claim(&types(), "tok", 1).await;
        let task_id = claimed[0].task_id.clone();

        assert!(matches!(
            queue.complete(&task_id).await,
            CompleteOutcome::Completed(_)
        ));
        assert!(matches!(
            queue.complete(&task_id).await,
            CompleteOutcome::AlreadyCompleted
        ));
        assert!(matches!(
            queue.complete("unknown").await,
            CompleteOutcome::Unknown
        ));
    }

    #[tokio::test]
    async fn test_release_returns_to_head() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        queue.enqueue(task("wf-1", "a", 1)).await;
        queue.enqueue(task("wf-2", "a", 1)).await;

        let claimed = queue.claim(&types(), "tok", 1).await;
        assert_eq!(claimed[0].workflow_id, "wf-1");
        queue.release(&claimed[0].task_id).await;

        let next = queue.claim(&types(), "tok", 1).await;
        assert_eq!(next[0].workflow_id, "wf-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_releases_claim() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        queue.enqueue(task("wf-1", "a", 1)).await;
        let claimed = queue.claim(&types(), "tok", 1).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(queue.release_expired().await.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let expired = queue.release_expired().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task.task_id, claimed[0].task_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_heartbeat_extends_visibility() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        queue.enqueue(task("wf-1", "a", 1)).await;
        let claimed = queue.claim(&types(), "tok", 1).await;

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(queue.heartbeat(&claimed[0].task_id).await);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(queue.release_expired().await.is_empty());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(queue.release_expired().await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_session_drops_all_claims() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        queue.enqueue(task("wf-1", "a", 1)).await;
        queue.enqueue(task("wf-2", "a", 1)).await;
        queue.claim(&types(), "tok-1", 2).await;

        let released = queue.release_session("tok-1").await;
        assert_eq!(released.len(), 2);
        assert!(queue.release_session("tok-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_workflow_purges_queued_tasks() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        queue.enqueue(task("wf-1", "a", 1)).await;
        queue.enqueue(task("wf-2", "a", 1)).await;

        assert_eq!(queue.remove_workflow("wf-1").await, 1);
        assert_eq!(queue.depth().await, 1);

        // A purged key may be enqueued again later.
        assert!(queue.enqueue(task("wf-1", "a", 1)).await);
    }
}
