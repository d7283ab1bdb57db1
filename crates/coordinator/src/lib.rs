//! Aether core coordination plane.
//!
//! Clients define workflows as ordered sequences of named steps executed
//! remotely by polyglot workers. This crate is the server side: it accepts
//! start requests, owns the per-workflow lifecycle state machine,
//! dispatches tasks to registered workers, collects results, persists state
//! to one of three durability tiers, and broadcasts lifecycle events to
//! monitoring subscribers.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod persistence;
pub mod queue;
pub mod registry;
pub mod server;
pub mod task;
pub mod worker;
pub mod workflow;

pub use config::Config;
pub use error::{CoordinatorError, CoreResult};
pub use events::{EventBus, EventFilter, EventType, LifecycleEvent};
pub use orchestrator::{
    AwaitOutcome, CancelOutcome, Orchestrator, OrchestratorSettings, ReportedStatus, TaskOutcome,
};
pub use persistence::{open_store, PersistenceMode, WorkflowStore};
pub use queue::TaskQueue;
pub use registry::{RegisterSpec, WorkerRegistry};
pub use task::{Backoff, RetryPolicy, Task};
pub use worker::{Capability, CapabilityKind, SessionState, WorkerRecord, WorkflowTypeSpec};
pub use workflow::{StepExecution, StepStatus, Workflow, WorkflowFilter, WorkflowState};
