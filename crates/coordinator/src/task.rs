//! Dispatchable tasks and step retry policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between step retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64, multiplier: f64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

/// Retry policy carried on every dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Delay before dispatching the attempt that follows `failed_attempt`.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                multiplier,
            } => {
                let exponent = failed_attempt.saturating_sub(1);
                let millis = (*initial_ms as f64) * multiplier.powi(exponent as i32);
                Duration::from_millis(millis as u64)
            }
        }
    }
}

/// A dispatchable instance of a step. `task_id` is the claim token a worker
/// references when completing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub step_name: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<u8>,
    pub retry: RetryPolicy,
}

impl Task {
    pub fn new(
        workflow_id: &str,
        workflow_type: &str,
        step_name: &str,
        attempt: u32,
        input: Vec<u8>,
        retry: RetryPolicy,
    ) -> Self {
        Task {
            task_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            step_name: step_name.to_string(),
            attempt,
            input,
            retry,
        }
    }

    /// Idempotency key for enqueueing: one live task per step attempt.
    pub fn dedup_key(&self) -> (String, String, u32) {
        (
            self.workflow_id.clone(),
            self.step_name.clone(),
            self.attempt,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Fixed { delay_ms: 250 },
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(3), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Exponential {
                initial_ms: 100,
                multiplier: 2.0,
            },
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_task_ids_are_fresh_per_dispatch() {
        let a = Task::new("wf-1", "etl", "extract", 1, vec![], RetryPolicy::default());
        let b = Task::new("wf-1", "etl", "extract", 1, vec![], RetryPolicy::default());
        assert_ne!(a.task_id, b.task_id);
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_retry_policy_serialization() {
        let policy = RetryPolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("exponential"));

        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }
}
