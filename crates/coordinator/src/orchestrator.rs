//! The workflow lifecycle engine.
//!
//! One logical state machine per workflow id. All mutations to a workflow
//! are serialized through a per-workflow async mutex; the engine never
//! blocks on workers. Every transition follows the same discipline:
//! validate, persist (action log first on the highest tier), emit lifecycle
//! events, enqueue follow-up tasks, acknowledge the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

use crate::error::{CoordinatorError, CoreResult};
use crate::events::{EventBus, EventFilter, EventSubscription, LifecycleEvent};
use crate::persistence::{ActionKind, WorkflowStore};
use crate::queue::{Claim, CompleteOutcome, TaskQueue};
use crate::registry::{RegisterSpec, WorkerRegistry};
use crate::task::{RetryPolicy, Task};
use crate::worker::{SessionState, WorkerRecord};
use crate::workflow::{StepExecution, StepStatus, Workflow, WorkflowFilter, WorkflowState};

/// Tunables for the lifecycle engine.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_retry: RetryPolicy,
    /// How long a cancel waits for the worker before force-transitioning.
    pub cancellation_deadline: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            cancellation_deadline: Duration::from_secs(10),
        }
    }
}

/// What a worker reported for a task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(Vec<u8>),
    Failure(String),
    Cancelled,
}

/// Progress narration from a worker running the workflow body itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    Started,
    Completed,
    Failed,
}

/// Result of awaiting a workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Completed(Vec<u8>),
    Failed(String),
    Cancelled,
    StillRunning,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Accepted,
    AlreadyTerminal,
}

/// Pushed to task streams when a claimed workflow is being cancelled.
#[derive(Debug, Clone)]
pub struct CancelNotice {
    pub workflow_id: String,
    pub session_token: String,
    pub task_id: String,
}

/// Counters served by the admin endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub workflows_total: usize,
    pub workflows_pending: usize,
    pub workflows_running: usize,
    pub workflows_completed: usize,
    pub workflows_failed: usize,
    pub workflows_cancelled: usize,
    pub active_workers: usize,
    pub queued_tasks: usize,
}

pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
    bus: EventBus,
    queue: Arc<TaskQueue>,
    registry: Arc<WorkerRegistry>,
    settings: OrchestratorSettings,
    /// Per-workflow mutation locks, created lazily.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Wakers for await-result callers, keyed by workflow id.
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
    cancel_tx: broadcast::Sender<CancelNotice>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        bus: EventBus,
        queue: Arc<TaskQueue>,
        registry: Arc<WorkerRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (cancel_tx, _rx) = broadcast::channel(256);
        Self {
            store,
            bus,
            queue,
            registry,
            settings,
            locks: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            cancel_tx,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn store_healthy(&self) -> bool {
        self.store.healthy()
    }

    pub async fn flush_store(&self) -> CoreResult<()> {
        self.store.flush().await
    }

    pub fn subscribe_events(&self, filter: EventFilter) -> EventSubscription {
        self.bus.subscribe(filter)
    }

    pub fn subscribe_cancellations(&self) -> broadcast::Receiver<CancelNotice> {
        self.cancel_tx.subscribe()
    }

    async fn workflow_lock(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn waiter(&self, workflow_id: &str) -> Arc<Notify> {
        let mut waiters = self.waiters.lock().await;
        waiters
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    async fn wake_waiters(&self, workflow_id: &str) {
        let notify = self.waiter(workflow_id).await;
        notify.notify_waiters();
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        if self.store.healthy() {
            Ok(())
        } else {
            Err(CoordinatorError::Persistence(
                "store is unavailable for writes, coordinator is read-only".to_string(),
            ))
        }
    }

    async fn load(&self, workflow_id: &str) -> CoreResult<Workflow> {
        self.store
            .get(workflow_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("workflow '{}' not found", workflow_id)))
    }

    /// Re-arm queues from persisted state. Called once at startup, after the
    /// store has presented its recovered snapshot.
    pub async fn recover(self: &Arc<Self>) -> CoreResult<usize> {
        let workflows = self.store.load_all().await?;
        let mut resumed = 0;

        for workflow in workflows {
            if workflow.is_terminal() {
                continue;
            }
            let id = workflow.id.clone();
            match &workflow.state {
                WorkflowState::Pending => {
                    // Crash landed between create and start; run the start
                    // transition now.
                    if let Err(err) = self.begin(&id).await {
                        tracing::error!(workflow_id = %id, error = %err, "Failed to resume pending workflow");
                        continue;
                    }
                    resumed += 1;
                }
                WorkflowState::Running { current_step } => {
                    let step = match current_step.clone() {
                        Some(step) => step,
                        None => continue, // worker-driven body between steps
                    };
                    let attempt = workflow.latest_attempt(&step).max(1);
                    let task = Task::new(
                        &workflow.id,
                        &workflow.workflow_type,
                        &step,
                        attempt,
                        self.task_input(&workflow, &step, attempt),
                        self.settings.default_retry.clone(),
                    );
                    if self.queue.enqueue(task).await {
                        resumed += 1;
                    }
                }
                _ => {}
            }
        }

        tracing::info!(resumed, "Recovery complete, in-flight workflows re-enqueued");
        Ok(resumed)
    }

    /// Input bytes for dispatching a step attempt: the recorded attempt
    /// input when present, otherwise the workflow input.
    fn task_input(&self, workflow: &Workflow, step: &str, attempt: u32) -> Vec<u8> {
        workflow
            .steps
            .iter()
            .find(|s| s.step_name == step && s.attempt == attempt)
            .map(|s| s.input.clone())
            .unwrap_or_else(|| workflow.input.clone())
    }

    // === Client plane ===

    /// Create, persist, announce and enqueue a new workflow.
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        input: Vec<u8>,
        workflow_id: Option<String>,
    ) -> CoreResult<String> {
        self.ensure_writable()?;

        let id = workflow_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let plan = self.registry.declared_steps(workflow_type).await;
        let workflow = Workflow::new(id.clone(), workflow_type.to_string(), input, plan);
        self.store.create(&workflow).await?;

        self.begin(&id).await?;
        Ok(id)
    }

    /// Start transition: Pending -> Running with the initial step scheduled.
    async fn begin(&self, workflow_id: &str) -> CoreResult<()> {
        let lock = self.workflow_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load(workflow_id).await?;
        let started = match workflow.state.start() {
            Some(state) => state,
            None => return Ok(()), // already past Pending
        };
        workflow.state = started;

        let step = workflow.initial_step().to_string();
        let input = workflow.input.clone();
        workflow
            .steps
            .push(StepExecution::pending(&step, 1, input.clone()));
        workflow.state = WorkflowState::Running {
            current_step: Some(step.clone()),
        };
        workflow.touch();
        self.store
            .update(&workflow, ActionKind::WorkflowStarted)
            .await?;

        self.bus.emit(LifecycleEvent::workflow_started(
            &workflow.id,
            &workflow.workflow_type,
            &workflow.input,
        ));

        let task = Task::new(
            &workflow.id,
            &workflow.workflow_type,
            &step,
            1,
            input,
            self.settings.default_retry.clone(),
        );
        self.queue.enqueue(task).await;

        tracing::info!(
            workflow_id = %workflow.id,
            workflow_type = %workflow.workflow_type,
            step = %step,
            "Workflow started"
        );
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> CoreResult<Workflow> {
        self.load(workflow_id).await
    }

    pub async fn list_workflows(&self, filter: &WorkflowFilter) -> CoreResult<Vec<Workflow>> {
        self.store.list(filter).await
    }

    /// Block up to `timeout` for a terminal state. A zero timeout answers
    /// immediately. Abandoning the wait never affects workflow state.
    pub async fn await_result(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> CoreResult<AwaitOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the waiter before reading state so a transition between
            // the read and the park cannot be missed.
            let notify = self.waiter(workflow_id).await;
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let workflow = self.load(workflow_id).await?;
            match workflow.state {
                WorkflowState::Completed { result } => return Ok(AwaitOutcome::Completed(result)),
                WorkflowState::Failed { error } => return Ok(AwaitOutcome::Failed(error)),
                WorkflowState::Cancelled => return Ok(AwaitOutcome::Cancelled),
                _ => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(AwaitOutcome::StillRunning);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(AwaitOutcome::StillRunning);
            }
        }
    }

    /// Request cancellation. Running steps are given until the deadline to
    /// acknowledge; idle workflows transition immediately.
    pub async fn cancel_workflow(self: &Arc<Self>, workflow_id: &str) -> CoreResult<CancelOutcome> {
        self.ensure_writable()?;
        let lock = self.workflow_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load(workflow_id).await?;
        if workflow.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        let claims = self.queue.claims_for_workflow(workflow_id).await;
        if claims.is_empty() {
            self.queue.remove_workflow(workflow_id).await;
            self.finish_cancel(&mut workflow, true).await?;
            return Ok(CancelOutcome::Accepted);
        }

        workflow.cancel_requested = true;
        workflow.touch();
        self.store
            .update(&workflow, ActionKind::CancelRequested)
            .await?;

        for claim in claims {
            let _ = self.cancel_tx.send(CancelNotice {
                workflow_id: workflow_id.to_string(),
                session_token: claim.session_token.clone(),
                task_id: claim.task.task_id.clone(),
            });
        }

        let this = Arc::clone(self);
        let id = workflow_id.to_string();
        let deadline = self.settings.cancellation_deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Err(err) = this.force_cancel(&id).await {
                tracing::error!(workflow_id = %id, error = %err, "Forced cancellation failed");
            }
        });

        tracing::info!(workflow_id = %workflow_id, "Cancellation requested, worker notified");
        Ok(CancelOutcome::Accepted)
    }

    /// Deadline elapsed without the worker acknowledging: transition
    /// regardless. The running step record is left as the worker last
    /// reported it; late reports are recorded for audit only.
    async fn force_cancel(&self, workflow_id: &str) -> CoreResult<()> {
        let lock = self.workflow_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load(workflow_id).await?;
        if workflow.is_terminal() {
            return Ok(());
        }
        self.queue.remove_workflow(workflow_id).await;
        self.finish_cancel(&mut workflow, false).await
    }

    /// Persist + announce the Cancelled transition. `settle_steps` also
    /// marks non-terminal step records Cancelled (no worker holds them).
    async fn finish_cancel(&self, workflow: &mut Workflow, settle_steps: bool) -> CoreResult<()> {
        if settle_steps {
            let now = Utc::now();
            for step in workflow.steps.iter_mut() {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Cancelled;
                    if step.started_at.is_some() {
                        step.completed_at = Some(now);
                    }
                }
            }
        }
        workflow.state = workflow
            .state
            .cancel()
            .ok_or_else(|| CoordinatorError::Internal("cancel of terminal workflow".to_string()))?;
        workflow.cancel_requested = true;
        workflow.completed_at = Some(Utc::now());
        workflow.touch();
        self.store
            .update(workflow, ActionKind::WorkflowCancelled)
            .await?;

        self.bus.emit(LifecycleEvent::workflow_cancelled(
            &workflow.id,
            &workflow.workflow_type,
        ));
        self.wake_waiters(&workflow.id).await;
        tracing::info!(workflow_id = %workflow.id, "Workflow cancelled");
        Ok(())
    }

    // === Worker plane ===

    pub async fn register_worker(&self, spec: RegisterSpec) -> CoreResult<WorkerRecord> {
        self.registry.register(spec).await
    }

    pub async fn worker_heartbeat(&self, session_token: &str) -> CoreResult<Duration> {
        self.registry.heartbeat(session_token).await
    }

    pub async fn drain_worker(&self, session_token: &str) -> CoreResult<()> {
        self.registry.drain(session_token).await
    }

    pub async fn task_heartbeat(&self, task_id: &str) -> CoreResult<()> {
        if self.queue.heartbeat(task_id).await {
            Ok(())
        } else {
            Err(CoordinatorError::NotFound(format!(
                "task '{}' is not claimed",
                task_id
            )))
        }
    }

    /// Claim up to `max` tasks for the session and mark their steps started.
    pub async fn dispatch_tasks(&self, session_token: &str, max: usize) -> CoreResult<Vec<Task>> {
        let worker = self.registry.authorize(session_token).await?;
        if worker.session != SessionState::Active {
            return Ok(Vec::new());
        }

        let types = worker.advertised_types();
        let claimed = self.queue.claim(&types, session_token, max).await;

        let mut dispatched = Vec::with_capacity(claimed.len());
        for task in claimed {
            match self.mark_step_started(&task).await {
                Ok(true) => dispatched.push(task),
                Ok(false) => {
                    // Stale task (workflow cancelled or finished); retire it.
                    self.queue.complete(&task.task_id).await;
                }
                Err(err) => {
                    tracing::error!(
                        task_id = %task.task_id,
                        workflow_id = %task.workflow_id,
                        error = %err,
                        "Failed to mark step started, returning task to queue"
                    );
                    self.queue.release(&task.task_id).await;
                }
            }
        }
        Ok(dispatched)
    }

    async fn mark_step_started(&self, task: &Task) -> CoreResult<bool> {
        let lock = self.workflow_lock(&task.workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load(&task.workflow_id).await?;
        if workflow.is_terminal() || workflow.cancel_requested {
            return Ok(false);
        }

        if workflow.step_mut(&task.step_name, task.attempt).is_none() {
            workflow.steps.push(StepExecution::pending(
                &task.step_name,
                task.attempt,
                task.input.clone(),
            ));
        }
        let record = workflow
            .step_mut(&task.step_name, task.attempt)
            .ok_or_else(|| CoordinatorError::Internal("step record vanished".to_string()))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = StepStatus::Running;
        record.started_at = Some(Utc::now());

        workflow.state = workflow
            .state
            .step_started(&task.step_name)
            .ok_or_else(|| CoordinatorError::Internal("dispatch against non-running workflow".to_string()))?;
        workflow.touch();
        self.store
            .update(
                &workflow,
                ActionKind::StepStarted {
                    step_name: task.step_name.clone(),
                    attempt: task.attempt,
                },
            )
            .await?;

        self.bus.emit(LifecycleEvent::step_started(
            &workflow.id,
            &workflow.workflow_type,
            &task.step_name,
            task.attempt,
            &task.input,
        ));
        Ok(true)
    }

    /// Resolve a task completion. Idempotent by task id: duplicates return
    /// Ok without side effects.
    pub async fn complete_task(
        self: &Arc<Self>,
        task_id: &str,
        outcome: TaskOutcome,
    ) -> CoreResult<()> {
        let task = match self.queue.claimed_task(task_id).await {
            Some(task) => task,
            None => {
                if self.queue.is_completed(task_id).await {
                    return Ok(());
                }
                return Err(CoordinatorError::NotFound(format!(
                    "task '{}' not found",
                    task_id
                )));
            }
        };

        let lock = self.workflow_lock(&task.workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load(&task.workflow_id).await?;

        if workflow.is_terminal() {
            // Late completion after a forced transition: retire the claim
            // and record the outcome for audit without touching state.
            self.queue.complete(task_id).await;
            self.record_audit(&mut workflow, &task.step_name, &outcome).await?;
            return Ok(());
        }

        // A completion must reference the step the coordinator holds as
        // current. Worker-driven bodies narrate their own steps, so the
        // finalizing start task is always acceptable there.
        let current = workflow.current_step().map(str::to_string);
        let matches_current = current.as_deref() == Some(task.step_name.as_str());
        let finalizes_body =
            workflow.plan.is_none() && task.step_name == workflow.initial_step();
        if !matches_current && !finalizes_body {
            return Err(CoordinatorError::ProtocolViolation(format!(
                "completion for step '{}' but current step is '{}'",
                task.step_name,
                current.unwrap_or_default()
            )));
        }

        match self.queue.complete(task_id).await {
            CompleteOutcome::Completed(_) => {}
            CompleteOutcome::AlreadyCompleted => return Ok(()),
            CompleteOutcome::Unknown => {
                return Err(CoordinatorError::NotFound(format!(
                    "task '{}' not found",
                    task_id
                )))
            }
        }

        let result = match outcome {
            TaskOutcome::Success(result) => self.apply_success(&mut workflow, &task, result).await,
            TaskOutcome::Failure(error) => self.apply_failure(&mut workflow, &task, error).await,
            TaskOutcome::Cancelled => self.apply_cancelled(&mut workflow, &task).await,
        };
        if let Err(CoordinatorError::Internal(diagnostic)) = &result {
            self.quarantine(&task.workflow_id, diagnostic).await;
        }
        result
    }

    /// An invariant violation surfaced mid-transition: mark the workflow
    /// Failed with a diagnostic and preserve its records. Best effort; the
    /// caller still receives the original error.
    async fn quarantine(&self, workflow_id: &str, diagnostic: &str) {
        let mut workflow = match self.store.get(workflow_id).await {
            Ok(Some(workflow)) if !workflow.is_terminal() => workflow,
            _ => return,
        };
        workflow.state = WorkflowState::Failed {
            error: format!("quarantined: {}", diagnostic),
        };
        workflow.completed_at = Some(Utc::now());
        workflow.touch();
        if let Err(err) = self
            .store
            .update(&workflow, ActionKind::WorkflowFailed)
            .await
        {
            tracing::error!(workflow_id = %workflow_id, error = %err, "Failed to persist quarantine");
            return;
        }
        self.bus.emit(LifecycleEvent::workflow_failed(
            &workflow.id,
            &workflow.workflow_type,
            diagnostic,
        ));
        self.wake_waiters(workflow_id).await;
        tracing::error!(workflow_id = %workflow_id, diagnostic, "Workflow quarantined");
    }

    async fn apply_success(
        self: &Arc<Self>,
        workflow: &mut Workflow,
        task: &Task,
        result: Vec<u8>,
    ) -> CoreResult<()> {
        let now = Utc::now();
        let finalizes_body = workflow.plan.is_none() && task.step_name == workflow.initial_step();
        let record = workflow
            .step_mut(&task.step_name, task.attempt)
            .ok_or_else(|| CoordinatorError::Internal("completion for unknown step record".to_string()))?;
        if record.status.is_terminal() && !finalizes_body {
            return Ok(());
        }
        if !record.status.is_terminal() {
            record.status = StepStatus::Completed;
            record.completed_at = Some(now);
            if record.started_at.is_none() {
                record.started_at = Some(now);
            }
            record.output = Some(result.clone());
        }

        if workflow.cancel_requested {
            // The in-flight step was allowed to finish, but the workflow
            // still lands in Cancelled rather than advancing.
            workflow.state = workflow
                .state
                .cancel()
                .ok_or_else(|| CoordinatorError::Internal("cancel of terminal workflow".to_string()))?;
            workflow.completed_at = Some(now);
            workflow.touch();
            self.store
                .update(workflow, ActionKind::WorkflowCancelled)
                .await?;
            self.bus.emit(LifecycleEvent::step_completed(
                &workflow.id,
                &workflow.workflow_type,
                &task.step_name,
                task.attempt,
                &result,
            ));
            self.bus.emit(LifecycleEvent::workflow_cancelled(
                &workflow.id,
                &workflow.workflow_type,
            ));
            self.wake_waiters(&workflow.id).await;
            return Ok(());
        }

        let next = workflow.next_planned_step(&task.step_name).map(String::from);
        match next {
            Some(next_step) => {
                // Advance the plan; the completed output feeds the next step.
                workflow
                    .steps
                    .push(StepExecution::pending(&next_step, 1, result.clone()));
                workflow.state = WorkflowState::Running {
                    current_step: Some(next_step.clone()),
                };
                workflow.touch();
                self.store
                    .update(
                        workflow,
                        ActionKind::StepCompleted {
                            step_name: task.step_name.clone(),
                            attempt: task.attempt,
                        },
                    )
                    .await?;

                self.bus.emit(LifecycleEvent::step_completed(
                    &workflow.id,
                    &workflow.workflow_type,
                    &task.step_name,
                    task.attempt,
                    &result,
                ));

                let next_task = Task::new(
                    &workflow.id,
                    &workflow.workflow_type,
                    &next_step,
                    1,
                    result,
                    task.retry.clone(),
                );
                self.queue.enqueue(next_task).await;
                tracing::debug!(
                    workflow_id = %workflow.id,
                    step = %task.step_name,
                    next = %next_step,
                    "Step completed, advancing plan"
                );
            }
            None => {
                workflow.state = workflow
                    .state
                    .complete(result.clone())
                    .ok_or_else(|| CoordinatorError::Internal("completion of non-running workflow".to_string()))?;
                workflow.completed_at = Some(now);
                workflow.touch();
                self.store
                    .update(workflow, ActionKind::WorkflowCompleted)
                    .await?;

                self.bus.emit(LifecycleEvent::step_completed(
                    &workflow.id,
                    &workflow.workflow_type,
                    &task.step_name,
                    task.attempt,
                    &result,
                ));
                self.bus.emit(LifecycleEvent::workflow_completed(
                    &workflow.id,
                    &workflow.workflow_type,
                    &result,
                ));
                self.wake_waiters(&workflow.id).await;
                tracing::info!(workflow_id = %workflow.id, "Workflow completed");
            }
        }
        Ok(())
    }

    async fn apply_failure(
        self: &Arc<Self>,
        workflow: &mut Workflow,
        task: &Task,
        error: String,
    ) -> CoreResult<()> {
        let now = Utc::now();
        let finalizes_body = workflow.plan.is_none() && task.step_name == workflow.initial_step();
        let record = workflow
            .step_mut(&task.step_name, task.attempt)
            .ok_or_else(|| CoordinatorError::Internal("failure for unknown step record".to_string()))?;
        if record.status.is_terminal() && !finalizes_body {
            return Ok(());
        }
        if !record.status.is_terminal() {
            record.status = StepStatus::Failed {
                error: error.clone(),
            };
            record.completed_at = Some(now);
            if record.started_at.is_none() {
                record.started_at = Some(now);
            }
        }

        if workflow.cancel_requested {
            workflow.state = workflow
                .state
                .cancel()
                .ok_or_else(|| CoordinatorError::Internal("cancel of terminal workflow".to_string()))?;
            workflow.completed_at = Some(now);
            workflow.touch();
            self.store
                .update(workflow, ActionKind::WorkflowCancelled)
                .await?;
            self.bus.emit(LifecycleEvent::step_failed(
                &workflow.id,
                &workflow.workflow_type,
                &task.step_name,
                task.attempt,
                &error,
            ));
            self.bus.emit(LifecycleEvent::workflow_cancelled(
                &workflow.id,
                &workflow.workflow_type,
            ));
            self.wake_waiters(&workflow.id).await;
            return Ok(());
        }

        if task.attempt < task.retry.max_retries {
            let next_attempt = task.attempt + 1;
            workflow.steps.push(StepExecution::pending(
                &task.step_name,
                next_attempt,
                task.input.clone(),
            ));
            workflow.touch();
            self.store
                .update(
                    workflow,
                    ActionKind::StepFailed {
                        step_name: task.step_name.clone(),
                        attempt: task.attempt,
                    },
                )
                .await?;

            self.bus.emit(LifecycleEvent::step_failed(
                &workflow.id,
                &workflow.workflow_type,
                &task.step_name,
                task.attempt,
                &error,
            ));

            let retry_task = Task::new(
                &workflow.id,
                &workflow.workflow_type,
                &task.step_name,
                next_attempt,
                task.input.clone(),
                task.retry.clone(),
            );
            let delay = task.retry.delay_after(task.attempt);
            self.schedule_enqueue(retry_task, delay);
            tracing::warn!(
                workflow_id = %workflow.id,
                step = %task.step_name,
                attempt = task.attempt,
                next_attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Step failed, retry scheduled"
            );
        } else {
            workflow.state = workflow
                .state
                .fail(error.clone())
                .ok_or_else(|| CoordinatorError::Internal("failure of non-running workflow".to_string()))?;
            workflow.completed_at = Some(now);
            workflow.touch();
            self.store
                .update(workflow, ActionKind::WorkflowFailed)
                .await?;

            self.bus.emit(LifecycleEvent::step_failed(
                &workflow.id,
                &workflow.workflow_type,
                &task.step_name,
                task.attempt,
                &error,
            ));
            self.bus.emit(LifecycleEvent::workflow_failed(
                &workflow.id,
                &workflow.workflow_type,
                &error,
            ));
            self.wake_waiters(&workflow.id).await;
            tracing::warn!(
                workflow_id = %workflow.id,
                step = %task.step_name,
                error = %error,
                "Retries exhausted, workflow failed"
            );
        }
        Ok(())
    }

    async fn apply_cancelled(&self, workflow: &mut Workflow, task: &Task) -> CoreResult<()> {
        let now = Utc::now();
        if let Some(record) = workflow.step_mut(&task.step_name, task.attempt) {
            if !record.status.is_terminal() {
                record.status = StepStatus::Cancelled;
                record.completed_at = Some(now);
            }
        }
        self.finish_cancel(workflow, false).await
    }

    /// Record a late outcome against a terminal workflow without changing
    /// its state.
    async fn record_audit(
        &self,
        workflow: &mut Workflow,
        step_name: &str,
        outcome: &TaskOutcome,
    ) -> CoreResult<()> {
        let now = Utc::now();
        let Some(record) = latest_record_mut(workflow, step_name) else {
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }
        record.status = match outcome {
            TaskOutcome::Success(result) => {
                record.output = Some(result.clone());
                StepStatus::Completed
            }
            TaskOutcome::Failure(error) => StepStatus::Failed {
                error: error.clone(),
            },
            TaskOutcome::Cancelled => StepStatus::Cancelled,
        };
        record.completed_at = Some(now);
        workflow.touch();
        self.store
            .update(
                workflow,
                ActionKind::StepReported {
                    step_name: step_name.to_string(),
                },
            )
            .await?;
        tracing::debug!(
            workflow_id = %workflow.id,
            step = %step_name,
            "Late report recorded for audit"
        );
        Ok(())
    }

    fn schedule_enqueue(self: &Arc<Self>, task: Task, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match this.store.get(&task.workflow_id).await {
                Ok(Some(workflow)) if !workflow.is_terminal() && !workflow.cancel_requested => {
                    this.queue.enqueue(task).await;
                }
                _ => {
                    tracing::debug!(
                        workflow_id = %task.workflow_id,
                        step = %task.step_name,
                        "Dropping scheduled retry for settled workflow"
                    );
                }
            }
        });
    }

    /// Progress narration from workers that run the workflow body
    /// themselves. Steps never enqueued as tasks are accepted and recorded;
    /// after a terminal transition the report lands as audit only.
    pub async fn report_step(
        &self,
        workflow_id: &str,
        step_name: &str,
        status: ReportedStatus,
        payload: Vec<u8>,
        error: Option<String>,
    ) -> CoreResult<()> {
        let lock = self.workflow_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load(workflow_id).await?;
        let now = Utc::now();

        if workflow.is_terminal() {
            let outcome = match status {
                ReportedStatus::Started => return Ok(()),
                ReportedStatus::Completed => TaskOutcome::Success(payload),
                ReportedStatus::Failed => {
                    TaskOutcome::Failure(error.unwrap_or_else(|| "step failed".to_string()))
                }
            };
            return self.record_audit(&mut workflow, step_name, &outcome).await;
        }

        match status {
            ReportedStatus::Started => {
                // The worker is narrating its own steps: the dispatched body
                // record hands over and closes, so only one step is running
                // at a time.
                if workflow.plan.is_none() {
                    let body = workflow.initial_step().to_string();
                    if body != step_name {
                        if let Some(record) = latest_record_mut(&mut workflow, &body) {
                            if record.status == StepStatus::Running {
                                record.status = StepStatus::Completed;
                                record.completed_at = Some(now);
                            }
                        }
                    }
                }

                let attempt = workflow.latest_attempt(step_name) + 1;
                let mut record = StepExecution::pending(step_name, attempt, payload.clone());
                record.status = StepStatus::Running;
                record.started_at = Some(now);
                workflow.steps.push(record);
                workflow.state = workflow.state.step_started(step_name).ok_or_else(|| {
                    CoordinatorError::ProtocolViolation(
                        "step report against a workflow that is not running".to_string(),
                    )
                })?;
                workflow.touch();
                self.store
                    .update(
                        &workflow,
                        ActionKind::StepStarted {
                            step_name: step_name.to_string(),
                            attempt,
                        },
                    )
                    .await?;
                self.bus.emit(LifecycleEvent::step_started(
                    &workflow.id,
                    &workflow.workflow_type,
                    step_name,
                    attempt,
                    &payload,
                ));
            }
            ReportedStatus::Completed => {
                let attempt = ensure_report_record(&mut workflow, step_name, now);
                let record = latest_record_mut(&mut workflow, step_name)
                    .ok_or_else(|| CoordinatorError::Internal("step record vanished".to_string()))?;
                if record.status.is_terminal() {
                    return Ok(());
                }
                record.status = StepStatus::Completed;
                record.completed_at = Some(now);
                record.output = Some(payload.clone());
                workflow.state = workflow.state.step_cleared().ok_or_else(|| {
                    CoordinatorError::ProtocolViolation(
                        "step report against a workflow that is not running".to_string(),
                    )
                })?;
                workflow.touch();
                self.store
                    .update(
                        &workflow,
                        ActionKind::StepCompleted {
                            step_name: step_name.to_string(),
                            attempt,
                        },
                    )
                    .await?;
                self.bus.emit(LifecycleEvent::step_completed(
                    &workflow.id,
                    &workflow.workflow_type,
                    step_name,
                    attempt,
                    &payload,
                ));
            }
            ReportedStatus::Failed => {
                let message = error.unwrap_or_else(|| "step failed".to_string());
                let attempt = ensure_report_record(&mut workflow, step_name, now);
                let record = latest_record_mut(&mut workflow, step_name)
                    .ok_or_else(|| CoordinatorError::Internal("step record vanished".to_string()))?;
                if record.status.is_terminal() {
                    return Ok(());
                }
                record.status = StepStatus::Failed {
                    error: message.clone(),
                };
                record.completed_at = Some(now);
                workflow.state = workflow.state.step_started(step_name).ok_or_else(|| {
                    CoordinatorError::ProtocolViolation(
                        "step report against a workflow that is not running".to_string(),
                    )
                })?;
                workflow.touch();
                self.store
                    .update(
                        &workflow,
                        ActionKind::StepFailed {
                            step_name: step_name.to_string(),
                            attempt,
                        },
                    )
                    .await?;
                self.bus.emit(LifecycleEvent::step_failed(
                    &workflow.id,
                    &workflow.workflow_type,
                    step_name,
                    attempt,
                    &message,
                ));
            }
        }
        Ok(())
    }

    /// A claimed task lost its worker (death or visibility expiry): record
    /// the lost attempt and put a successor at the head of the queue.
    pub async fn handle_lost_claim(self: &Arc<Self>, claim: Claim, reason: &str) {
        let task = claim.task;
        let lock = self.workflow_lock(&task.workflow_id).await;
        let _guard = lock.lock().await;

        let workflow = match self.store.get(&task.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(
                    workflow_id = %task.workflow_id,
                    error = %err,
                    "Failed to load workflow for lost claim"
                );
                return;
            }
        };
        if workflow.is_terminal() || workflow.cancel_requested {
            return;
        }

        let mut workflow = workflow;
        let now = Utc::now();
        if let Some(record) = workflow.step_mut(&task.step_name, task.attempt) {
            if !record.status.is_terminal() {
                record.status = StepStatus::Failed {
                    error: reason.to_string(),
                };
                record.completed_at = Some(now);
                if record.started_at.is_none() {
                    record.started_at = Some(now);
                }
            }
        }

        let next_attempt = task.attempt + 1;
        workflow.steps.push(StepExecution::pending(
            &task.step_name,
            next_attempt,
            task.input.clone(),
        ));
        workflow.touch();
        if let Err(err) = self
            .store
            .update(
                &workflow,
                ActionKind::StepFailed {
                    step_name: task.step_name.clone(),
                    attempt: task.attempt,
                },
            )
            .await
        {
            tracing::error!(
                workflow_id = %workflow.id,
                error = %err,
                "Failed to persist lost claim"
            );
            return;
        }

        self.bus.emit(LifecycleEvent::step_failed(
            &workflow.id,
            &workflow.workflow_type,
            &task.step_name,
            task.attempt,
            reason,
        ));

        let redelivery = Task::new(
            &workflow.id,
            &workflow.workflow_type,
            &task.step_name,
            next_attempt,
            task.input.clone(),
            task.retry.clone(),
        );
        self.queue.enqueue_front(redelivery).await;
        tracing::warn!(
            workflow_id = %workflow.id,
            step = %task.step_name,
            attempt = task.attempt,
            reason,
            "Claim lost, task redelivered"
        );
    }

    /// Periodic sweep: dead workers and expired visibility claims.
    pub async fn run_reaper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;

            for worker in self.registry.reap_expired().await {
                let claims = self.queue.release_session(&worker.session_token).await;
                for claim in claims {
                    self.handle_lost_claim(claim, "worker-lost").await;
                }
            }

            for claim in self.queue.release_expired().await {
                self.handle_lost_claim(claim, "visibility-timeout").await;
            }
        }
    }

    /// Remove terminal workflows older than the retention horizon.
    pub async fn run_retention(self: Arc<Self>, retention: Duration, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let horizon = Utc::now()
                - chrono::Duration::from_std(retention)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            let workflows = match self.store.list(&WorkflowFilter::default()).await {
                Ok(workflows) => workflows,
                Err(err) => {
                    tracing::error!(error = %err, "Retention sweep failed to list workflows");
                    continue;
                }
            };
            for workflow in workflows {
                let settled_at = workflow.completed_at.unwrap_or(workflow.updated_at);
                if workflow.is_terminal() && settled_at < horizon {
                    if let Err(err) = self.store.remove(&workflow.id).await {
                        tracing::error!(
                            workflow_id = %workflow.id,
                            error = %err,
                            "Retention sweep failed to remove workflow"
                        );
                    } else {
                        tracing::info!(workflow_id = %workflow.id, "Retention sweep removed workflow");
                    }
                }
            }
        }
    }

    pub async fn metrics(&self) -> CoreResult<MetricsSnapshot> {
        let workflows = self.store.list(&WorkflowFilter::default()).await?;
        let mut snapshot = MetricsSnapshot {
            workflows_total: workflows.len(),
            workflows_pending: 0,
            workflows_running: 0,
            workflows_completed: 0,
            workflows_failed: 0,
            workflows_cancelled: 0,
            active_workers: self.registry.active_count().await,
            queued_tasks: self.queue.depth().await,
        };
        for workflow in &workflows {
            match workflow.state {
                WorkflowState::Pending => snapshot.workflows_pending += 1,
                WorkflowState::Running { .. } => snapshot.workflows_running += 1,
                WorkflowState::Completed { .. } => snapshot.workflows_completed += 1,
                WorkflowState::Failed { .. } => snapshot.workflows_failed += 1,
                WorkflowState::Cancelled => snapshot.workflows_cancelled += 1,
            }
        }
        Ok(snapshot)
    }
}

/// Latest attempt record for a step.
fn latest_record_mut<'a>(
    workflow: &'a mut Workflow,
    step_name: &str,
) -> Option<&'a mut StepExecution> {
    let attempt = workflow.latest_attempt(step_name);
    if attempt == 0 {
        return None;
    }
    workflow.step_mut(step_name, attempt)
}

/// Make sure a record exists for a reported step, returning its attempt.
fn ensure_report_record(
    workflow: &mut Workflow,
    step_name: &str,
    now: chrono::DateTime<Utc>,
) -> u32 {
    let attempt = workflow.latest_attempt(step_name);
    if attempt > 0 {
        return attempt;
    }
    let mut record = StepExecution::pending(step_name, 1, Vec::new());
    record.status = StepStatus::Running;
    record.started_at = Some(now);
    workflow.steps.push(record);
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventDelivery, EventType};
    use crate::persistence::{ActionLogStore, MemoryStore};
    use crate::task::Backoff;
    use crate::worker::WorkflowTypeSpec;

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            default_retry: RetryPolicy {
                max_retries: 3,
                backoff: Backoff::Fixed { delay_ms: 1 },
            },
            cancellation_deadline: Duration::from_millis(50),
        }
    }

    fn orchestrator_with(store: Arc<dyn WorkflowStore>) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            store,
            EventBus::new(),
            Arc::new(TaskQueue::new(Duration::from_secs(60))),
            Arc::new(WorkerRegistry::new(Duration::from_secs(30))),
            settings(),
        ))
    }

    fn orchestrator() -> Arc<Orchestrator> {
        orchestrator_with(Arc::new(MemoryStore::new()))
    }

    async fn register(orch: &Arc<Orchestrator>, types: Vec<WorkflowTypeSpec>) -> WorkerRecord {
        orch.register_worker(RegisterSpec {
            worker_id: None,
            service_name: "test-service".to_string(),
            group: "default".to_string(),
            capabilities: vec![],
            workflow_types: types,
        })
        .await
        .unwrap()
    }

    fn plain_type(name: &str) -> Vec<WorkflowTypeSpec> {
        vec![WorkflowTypeSpec {
            name: name.to_string(),
            steps: vec![],
        }]
    }

    fn planned_type(name: &str, steps: &[&str]) -> Vec<WorkflowTypeSpec> {
        vec![WorkflowTypeSpec {
            name: name.to_string(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
        }]
    }

    async fn next_event(sub: &mut EventSubscription) -> LifecycleEvent {
        match tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
        {
            EventDelivery::Event(event) => event,
            EventDelivery::Gap { .. } => panic!("unexpected gap"),
        }
    }

    #[tokio::test]
    async fn test_single_step_happy_path() {
        let orch = orchestrator();
        let worker = register(&orch, plain_type("greet")).await;
        let mut sub = orch.subscribe_events(EventFilter::default());

        let id = orch
            .start_workflow("greet", b"World".to_vec(), None)
            .await
            .unwrap();

        let tasks = orch.dispatch_tasks(&worker.session_token, 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].step_name, "start");
        assert_eq!(tasks[0].workflow_type, "greet");
        assert_eq!(tasks[0].input, b"World");

        orch.complete_task(&tasks[0].task_id, TaskOutcome::Success(b"Hello, World!".to_vec()))
            .await
            .unwrap();

        let outcome = orch
            .await_result(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, AwaitOutcome::Completed(b"Hello, World!".to_vec()));

        let order: Vec<EventType> = vec![
            next_event(&mut sub).await.event_type,
            next_event(&mut sub).await.event_type,
            next_event(&mut sub).await.event_type,
            next_event(&mut sub).await.event_type,
        ];
        assert_eq!(
            order,
            vec![
                EventType::WorkflowStarted,
                EventType::StepStarted,
                EventType::StepCompleted,
                EventType::WorkflowCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_planned_steps_advance_in_order() {
        let orch = orchestrator();
        let worker = register(&orch, planned_type("etl", &["extract", "transform", "load"])).await;

        let id = orch
            .start_workflow("etl", b"raw".to_vec(), None)
            .await
            .unwrap();

        for (step, output) in [
            ("extract", b"e".to_vec()),
            ("transform", b"t".to_vec()),
            ("load", b"l".to_vec()),
        ] {
            let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();
            assert_eq!(tasks.len(), 1, "expected a task for step {}", step);
            assert_eq!(tasks[0].step_name, step);
            orch.complete_task(&tasks[0].task_id, TaskOutcome::Success(output))
                .await
                .unwrap();
        }

        let outcome = orch
            .await_result(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, AwaitOutcome::Completed(b"l".to_vec()));

        let workflow = orch.get_workflow(&id).await.unwrap();
        let names: Vec<&str> = workflow.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["extract", "transform", "load"]);
        for window in workflow.steps.windows(2) {
            assert!(window[0].started_at.unwrap() <= window[1].started_at.unwrap());
        }
        for step in &workflow.steps {
            assert!(step.completed_at.unwrap() >= step.started_at.unwrap());
        }
        // The completed output feeds the next step.
        assert_eq!(workflow.steps[1].input, b"e");
    }

    #[tokio::test]
    async fn test_worker_driven_body_narrates_steps() {
        let orch = orchestrator();
        let worker = register(&orch, plain_type("slow-process")).await;

        let id = orch
            .start_workflow("slow-process", vec![], None)
            .await
            .unwrap();
        let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();
        assert_eq!(tasks.len(), 1);

        for step in ["step-1-init", "step-2-process", "step-3-finalize"] {
            orch.report_step(&id, step, ReportedStatus::Started, vec![], None)
                .await
                .unwrap();
            // Never more than one step running, body record included.
            let workflow = orch.get_workflow(&id).await.unwrap();
            assert_eq!(workflow.running_step_count(), 1);
            assert_eq!(workflow.current_step(), Some(step));

            orch.report_step(&id, step, ReportedStatus::Completed, b"ok".to_vec(), None)
                .await
                .unwrap();
        }

        orch.complete_task(&tasks[0].task_id, TaskOutcome::Success(b"done".to_vec()))
            .await
            .unwrap();

        let workflow = orch.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.state.label(), "completed");
        let reported: Vec<&str> = workflow
            .steps
            .iter()
            .filter(|s| s.step_name.starts_with("step-"))
            .map(|s| s.step_name.as_str())
            .collect();
        assert_eq!(reported, vec!["step-1-init", "step-2-process", "step-3-finalize"]);
    }

    #[tokio::test]
    async fn test_duplicate_completion_has_no_effect() {
        let orch = orchestrator();
        let worker = register(&orch, plain_type("greet")).await;
        let id = orch.start_workflow("greet", vec![], None).await.unwrap();
        let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();

        orch.complete_task(&tasks[0].task_id, TaskOutcome::Success(b"once".to_vec()))
            .await
            .unwrap();
        let first = orch.get_workflow(&id).await.unwrap();

        let mut sub = orch.subscribe_events(EventFilter::default());
        orch.complete_task(&tasks[0].task_id, TaskOutcome::Success(b"twice".to_vec()))
            .await
            .unwrap();
        let second = orch.get_workflow(&id).await.unwrap();

        assert_eq!(first.revision, second.revision);
        assert!(matches!(second.state, WorkflowState::Completed { ref result } if result == b"once"));

        // No event was emitted by the duplicate.
        let quiet = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_failed() {
        let orch = orchestrator();
        let worker = register(&orch, plain_type("flaky")).await;
        let mut sub = orch.subscribe_events(EventFilter::default());

        let id = orch.start_workflow("flaky", vec![], None).await.unwrap();

        for attempt in 1..=3u32 {
            let tasks = loop {
                let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();
                if !tasks.is_empty() {
                    break tasks;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            assert_eq!(tasks[0].attempt, attempt);
            orch.complete_task(&tasks[0].task_id, TaskOutcome::Failure(format!("boom {}", attempt)))
                .await
                .unwrap();
        }

        let outcome = orch
            .await_result(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, AwaitOutcome::Failed("boom 3".to_string()));

        let workflow = orch.get_workflow(&id).await.unwrap();
        let attempts: Vec<u32> = workflow.steps.iter().map(|s| s.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        for step in &workflow.steps {
            assert!(matches!(step.status, StepStatus::Failed { .. }));
        }

        // Exactly one workflow:failed across the whole run.
        let mut failed_events = 0;
        while let Ok(Some(EventDelivery::Event(event))) =
            tokio::time::timeout(Duration::from_millis(50), sub.next()).await
        {
            if event.event_type == EventType::WorkflowFailed {
                failed_events += 1;
            }
        }
        assert_eq!(failed_events, 1);
    }

    #[tokio::test]
    async fn test_cancel_unclaimed_workflow_is_immediate() {
        let orch = orchestrator();
        register(&orch, plain_type("greet")).await;
        let id = orch.start_workflow("greet", vec![], None).await.unwrap();

        assert_eq!(
            orch.cancel_workflow(&id).await.unwrap(),
            CancelOutcome::Accepted
        );
        let workflow = orch.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.state, WorkflowState::Cancelled);
        assert!(matches!(workflow.steps[0].status, StepStatus::Cancelled));
        assert_eq!(orch.queue().depth().await, 0);

        assert_eq!(
            orch.cancel_workflow(&id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn test_cancel_running_step_with_acknowledgement() {
        let orch = orchestrator();
        let worker = register(&orch, plain_type("process")).await;
        let id = orch.start_workflow("process", vec![], None).await.unwrap();
        let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();

        let mut cancels = orch.subscribe_cancellations();
        assert_eq!(
            orch.cancel_workflow(&id).await.unwrap(),
            CancelOutcome::Accepted
        );

        let notice = tokio::time::timeout(Duration::from_secs(1), cancels.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.workflow_id, id);
        assert_eq!(notice.session_token, worker.session_token);

        orch.complete_task(&tasks[0].task_id, TaskOutcome::Cancelled)
            .await
            .unwrap();

        let workflow = orch.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.state, WorkflowState::Cancelled);
        assert!(matches!(workflow.steps[0].status, StepStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_deadline_forces_transition() {
        let orch = orchestrator();
        let worker = register(&orch, plain_type("process")).await;
        let id = orch.start_workflow("process", vec![], None).await.unwrap();
        let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();

        orch.cancel_workflow(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let workflow = orch.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.state, WorkflowState::Cancelled);
        // The running record is left to the worker's eventual report.
        assert!(matches!(workflow.steps[0].status, StepStatus::Running));

        // The late completion is recorded for audit without a transition.
        orch.complete_task(&tasks[0].task_id, TaskOutcome::Success(b"late".to_vec()))
            .await
            .unwrap();
        let workflow = orch.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.state, WorkflowState::Cancelled);
        assert!(matches!(workflow.steps[0].status, StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_lost_claim_redelivers_with_incremented_attempt() {
        let orch = orchestrator();
        let worker = register(&orch, plain_type("greet")).await;
        let id = orch.start_workflow("greet", vec![], None).await.unwrap();
        let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();
        assert_eq!(tasks[0].attempt, 1);

        let claims = orch.queue().release_session(&worker.session_token).await;
        assert_eq!(claims.len(), 1);
        orch.handle_lost_claim(claims.into_iter().next().unwrap(), "worker-lost")
            .await;

        let workflow = orch.get_workflow(&id).await.unwrap();
        assert!(matches!(
            &workflow.steps[0].status,
            StepStatus::Failed { error } if error == "worker-lost"
        ));
        assert_eq!(workflow.steps[1].attempt, 2);

        // Redelivered to another worker advertising the same type.
        let other = register(&orch, plain_type("greet")).await;
        let tasks = orch.dispatch_tasks(&other.session_token, 1).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_completion_for_wrong_step_is_rejected() {
        let orch = orchestrator();
        let worker = register(&orch, planned_type("etl", &["extract", "load"])).await;
        let id = orch.start_workflow("etl", vec![], None).await.unwrap();
        let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();

        // A narrated report moves the current step away from the claimed one.
        orch.report_step(&id, "detour", ReportedStatus::Started, vec![], None)
            .await
            .unwrap();

        let err = orch
            .complete_task(&tasks[0].task_id, TaskOutcome::Success(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_await_with_zero_timeout() {
        let orch = orchestrator();
        register(&orch, plain_type("greet")).await;
        let id = orch.start_workflow("greet", vec![], None).await.unwrap();

        let outcome = orch.await_result(&id, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, AwaitOutcome::StillRunning);
    }

    #[tokio::test]
    async fn test_duplicate_workflow_id_rejected() {
        let orch = orchestrator();
        register(&orch, plain_type("greet")).await;
        orch.start_workflow("greet", vec![], Some("wf-1".to_string()))
            .await
            .unwrap();
        let err = orch
            .start_workflow("greet", vec![], Some("wf-1".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_unknown_task_completion_is_not_found() {
        let orch = orchestrator();
        let err = orch
            .complete_task("no-such-task", TaskOutcome::Success(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_crash_recovery_resumes_in_flight_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let mut ids = Vec::new();

        {
            let store: Arc<dyn WorkflowStore> =
                Arc::new(ActionLogStore::open(dir.path()).await.unwrap());
            let orch = orchestrator_with(store);
            let worker = register(&orch, plain_type("greet")).await;

            for i in 0..10 {
                let id = orch
                    .start_workflow("greet", format!("input-{}", i).into_bytes(), None)
                    .await
                    .unwrap();
                ids.push(id);
            }
            // Complete five, leave five in flight.
            for _ in 0..5 {
                let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();
                orch.complete_task(&tasks[0].task_id, TaskOutcome::Success(b"ok".to_vec()))
                    .await
                    .unwrap();
            }
        }

        // Restart: fresh store over the same directory.
        let store: Arc<dyn WorkflowStore> =
            Arc::new(ActionLogStore::open(dir.path()).await.unwrap());
        let orch = orchestrator_with(store);
        let resumed = orch.recover().await.unwrap();
        assert_eq!(resumed, 5);

        let all = orch.list_workflows(&WorkflowFilter::default()).await.unwrap();
        assert_eq!(all.len(), 10);
        let completed = all.iter().filter(|w| w.state.label() == "completed").count();
        let running = all.iter().filter(|w| w.state.label() == "running").count();
        assert_eq!(completed, 5);
        assert_eq!(running, 5);

        // Reconnecting workers make progress on the re-enqueued tasks.
        let worker = register(&orch, plain_type("greet")).await;
        let tasks = orch.dispatch_tasks(&worker.session_token, 10).await.unwrap();
        assert_eq!(tasks.len(), 5);
        for task in tasks {
            orch.complete_task(&task.task_id, TaskOutcome::Success(b"ok".to_vec()))
                .await
                .unwrap();
        }
        let metrics = orch.metrics().await.unwrap();
        assert_eq!(metrics.workflows_completed, 10);
    }

    #[tokio::test]
    async fn test_step_finishing_after_cancel_request_lands_cancelled() {
        let orch = orchestrator();
        let worker = register(&orch, planned_type("etl", &["extract", "load"])).await;
        let id = orch.start_workflow("etl", vec![], None).await.unwrap();
        let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();

        orch.cancel_workflow(&id).await.unwrap();
        orch.complete_task(&tasks[0].task_id, TaskOutcome::Success(b"done".to_vec()))
            .await
            .unwrap();

        let workflow = orch.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.state, WorkflowState::Cancelled);
        // The finished step keeps its result, and no follow-up task lands.
        assert!(matches!(workflow.steps[0].status, StepStatus::Completed));
        assert_eq!(orch.queue().depth().await, 0);
    }

    #[tokio::test]
    async fn test_report_step_after_terminal_is_audit_only() {
        let orch = orchestrator();
        let worker = register(&orch, plain_type("greet")).await;
        let id = orch.start_workflow("greet", vec![], None).await.unwrap();
        let tasks = orch.dispatch_tasks(&worker.session_token, 1).await.unwrap();
        orch.report_step(&id, "inner", ReportedStatus::Started, vec![], None)
            .await
            .unwrap();
        orch.complete_task(&tasks[0].task_id, TaskOutcome::Success(vec![]))
            .await
            .unwrap();

        let before = orch.get_workflow(&id).await.unwrap();
        assert_eq!(before.state.label(), "completed");

        orch.report_step(&id, "inner", ReportedStatus::Completed, b"late".to_vec(), None)
            .await
            .unwrap();
        let after = orch.get_workflow(&id).await.unwrap();
        assert_eq!(after.state.label(), "completed");
        let inner = after
            .steps
            .iter()
            .find(|s| s.step_name == "inner")
            .unwrap();
        assert!(matches!(inner.status, StepStatus::Completed));
    }
}
