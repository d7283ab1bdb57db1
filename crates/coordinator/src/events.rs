//! In-process lifecycle event bus.
//!
//! Built on `tokio::sync::broadcast`: emitters never block, and a slow
//! subscriber only loses its own oldest events. A lagging receiver observes
//! a gap marker and is expected to re-read authoritative state through the
//! Monitor API. Persisted state remains the source of truth; delivery here
//! is best-effort.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the broadcast ring buffer per subscriber.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum EventType {
    #[serde(rename = "workflow:started")]
    WorkflowStarted,
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow:failed")]
    WorkflowFailed,
    #[serde(rename = "workflow:cancelled")]
    WorkflowCancelled,
    #[serde(rename = "step:started")]
    StepStarted,
    #[serde(rename = "step:completed")]
    StepCompleted,
    #[serde(rename = "step:failed")]
    StepFailed,
}

/// Event-specific payload. Opaque byte fields are carried base64-encoded,
/// ready for the JSON wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EventPayload {
    WorkflowStarted { input: String },
    WorkflowCompleted { result: String },
    WorkflowFailed { error: String },
    WorkflowCancelled {},
    StepStarted { step_name: String, attempt: u32, input: String },
    StepCompleted { step_name: String, attempt: u32, output: String },
    StepFailed { step_name: String, attempt: u32, error: String },
}

/// Immutable record of a state transition.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LifecycleEvent {
    pub event_type: EventType,
    pub workflow_id: String,
    pub workflow_type: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub payload: EventPayload,
}

impl LifecycleEvent {
    fn new(
        event_type: EventType,
        workflow_id: &str,
        workflow_type: &str,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_type,
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            timestamp: Utc::now().timestamp_millis() as u64,
            payload,
        }
    }

    pub fn workflow_started(workflow_id: &str, workflow_type: &str, input: &[u8]) -> Self {
        Self::new(
            EventType::WorkflowStarted,
            workflow_id,
            workflow_type,
            EventPayload::WorkflowStarted {
                input: BASE64.encode(input),
            },
        )
    }

    pub fn workflow_completed(workflow_id: &str, workflow_type: &str, result: &[u8]) -> Self {
        Self::new(
            EventType::WorkflowCompleted,
            workflow_id,
            workflow_type,
            EventPayload::WorkflowCompleted {
                result: BASE64.encode(result),
            },
        )
    }

    pub fn workflow_failed(workflow_id: &str, workflow_type: &str, error: &str) -> Self {
        Self::new(
            EventType::WorkflowFailed,
            workflow_id,
            workflow_type,
            EventPayload::WorkflowFailed {
                error: error.to_string(),
            },
        )
    }

    pub fn workflow_cancelled(workflow_id: &str, workflow_type: &str) -> Self {
        Self::new(
            EventType::WorkflowCancelled,
            workflow_id,
            workflow_type,
            EventPayload::WorkflowCancelled {},
        )
    }

    pub fn step_started(
        workflow_id: &str,
        workflow_type: &str,
        step_name: &str,
        attempt: u32,
        input: &[u8],
    ) -> Self {
        Self::new(
            EventType::StepStarted,
            workflow_id,
            workflow_type,
            EventPayload::StepStarted {
                step_name: step_name.to_string(),
                attempt,
                input: BASE64.encode(input),
            },
        )
    }

    pub fn step_completed(
        workflow_id: &str,
        workflow_type: &str,
        step_name: &str,
        attempt: u32,
        output: &[u8],
    ) -> Self {
        Self::new(
            EventType::StepCompleted,
            workflow_id,
            workflow_type,
            EventPayload::StepCompleted {
                step_name: step_name.to_string(),
                attempt,
                output: BASE64.encode(output),
            },
        )
    }

    pub fn step_failed(
        workflow_id: &str,
        workflow_type: &str,
        step_name: &str,
        attempt: u32,
        error: &str,
    ) -> Self {
        Self::new(
            EventType::StepFailed,
            workflow_id,
            workflow_type,
            EventPayload::StepFailed {
                step_name: step_name.to_string(),
                attempt,
                error: error.to_string(),
            },
        )
    }
}

/// Optional subscriber filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub workflow_id: Option<String>,
    pub workflow_type: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &LifecycleEvent) -> bool {
        if let Some(id) = &self.workflow_id {
            if &event.workflow_id != id {
                return false;
            }
        }
        if let Some(t) = &self.workflow_type {
            if &event.workflow_type != t {
                return false;
            }
        }
        true
    }
}

/// What a subscriber receives: an event, or a marker that it fell behind.
#[derive(Debug, Clone)]
pub enum EventDelivery {
    Event(LifecycleEvent),
    /// `missed` events were dropped for this subscriber; re-read state via
    /// the Monitor API.
    Gap {
        missed: u64,
    },
}

/// A filtered view over the broadcast channel.
pub struct EventSubscription {
    rx: broadcast::Receiver<LifecycleEvent>,
    filter: EventFilter,
}

impl EventSubscription {
    /// Next delivery for this subscriber; `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<EventDelivery> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(EventDelivery::Event(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(EventDelivery::Gap { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Broadcast hub for lifecycle events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Emit to all current subscribers. Emitting with no subscribers is not
    /// an error.
    pub fn emit(&self, event: LifecycleEvent) {
        tracing::trace!(
            workflow_id = %event.workflow_id,
            event_type = ?event.event_type,
            "Emitting lifecycle event"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_matching_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::default());

        bus.emit(LifecycleEvent::workflow_started("wf-1", "greet", b"World"));

        match sub.next().await.unwrap() {
            EventDelivery::Event(event) => {
                assert_eq!(event.event_type, EventType::WorkflowStarted);
                assert_eq!(event.workflow_id, "wf-1");
            }
            EventDelivery::Gap { .. } => panic!("unexpected gap"),
        }
    }

    #[tokio::test]
    async fn test_filter_by_workflow_id() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter {
            workflow_id: Some("wf-2".to_string()),
            workflow_type: None,
        });

        bus.emit(LifecycleEvent::workflow_started("wf-1", "greet", b""));
        bus.emit(LifecycleEvent::workflow_started("wf-2", "greet", b""));

        match sub.next().await.unwrap() {
            EventDelivery::Event(event) => assert_eq!(event.workflow_id, "wf-2"),
            EventDelivery::Gap { .. } => panic!("unexpected gap"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_same_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(EventFilter::default());
        let mut b = bus.subscribe(EventFilter::default());

        bus.emit(LifecycleEvent::step_completed("wf-1", "greet", "start", 1, b"hi"));

        assert!(matches!(a.next().await, Some(EventDelivery::Event(_))));
        assert!(matches!(b.next().await, Some(EventDelivery::Event(_))));
    }

    #[test]
    fn test_wire_shape() {
        let event = LifecycleEvent::step_failed("wf-1", "etl", "extract", 2, "timeout");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event_type"], "step:failed");
        assert_eq!(value["workflow_id"], "wf-1");
        assert_eq!(value["workflow_type"], "etl");
        assert_eq!(value["payload"]["step_name"], "extract");
        assert_eq!(value["payload"]["attempt"], 2);
        assert_eq!(value["payload"]["error"], "timeout");
        assert!(value["timestamp"].is_u64());
    }

    #[test]
    fn test_payload_bytes_are_base64() {
        let event = LifecycleEvent::workflow_completed("wf-1", "greet", b"Hello, World!");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["payload"]["result"], BASE64.encode(b"Hello, World!"));
    }
}
