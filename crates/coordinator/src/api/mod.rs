//! HTTP surfaces of the coordinator.
//!
//! Two routers share one application state: the coordinator router carries
//! the client and worker planes, the monitor router carries the read-only
//! query plane and the event subscription channel.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;

pub mod handlers;
pub mod models;
pub mod monitor;
pub mod websocket;

pub type AppState = Arc<Orchestrator>;

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Client plane + worker plane.
///
/// ## Workflows
/// - `POST /v1/workflows` — start a workflow
/// - `GET /v1/workflows/{id}` — status
/// - `GET /v1/workflows/{id}/result` — await the result
/// - `DELETE /v1/workflows/{id}` — cancel
/// - `POST /v1/workflows/{id}/steps/{step}/report` — progress narration
///
/// ## Workers
/// - `POST /v1/workers` — register
/// - `GET /v1/workers/{id}/tasks` — WebSocket task streaming
/// - `POST /v1/workers/heartbeat` — session heartbeat
/// - `POST /v1/workers/drain` — stop new dispatch
///
/// ## Tasks
/// - `POST /v1/tasks/poll` — polling claim fallback
/// - `POST /v1/tasks/{task_id}/complete` — complete (idempotent)
/// - `POST /v1/tasks/{task_id}/heartbeat` — visibility refresh
pub fn coordinator_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows", post(handlers::workflows::start_workflow))
        .route(
            "/v1/workflows/:id",
            get(handlers::workflows::get_workflow_status)
                .delete(handlers::workflows::cancel_workflow),
        )
        .route(
            "/v1/workflows/:id/result",
            get(handlers::workflows::get_workflow_result),
        )
        .route(
            "/v1/workflows/:id/steps/:step/report",
            post(handlers::steps::report_step),
        )
        .route("/v1/workers", post(handlers::workers::register_worker))
        .route("/v1/workers/:id/tasks", get(websocket::worker_tasks_ws))
        .route(
            "/v1/workers/heartbeat",
            post(handlers::workers::worker_heartbeat),
        )
        .route("/v1/workers/drain", post(handlers::workers::drain_worker))
        .route("/v1/tasks/poll", post(handlers::workers::poll_tasks))
        .route(
            "/v1/tasks/:task_id/complete",
            post(handlers::steps::complete_task),
        )
        .route(
            "/v1/tasks/:task_id/heartbeat",
            post(handlers::steps::task_heartbeat),
        )
        .route("/healthz", get(handlers::admin::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state)
}

/// Read-only monitor plane.
///
/// - `GET /v1/workflows` — summaries (`scope=active|all`, `workflow_type`,
///   `since`, `state` filters)
/// - `GET /v1/workflows/{id}` — full record with step executions
/// - `GET /ws` — event subscription channel
pub fn monitor_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows", get(monitor::list_workflows))
        .route("/v1/workflows/:id", get(monitor::get_workflow_detail))
        .route("/ws", get(monitor::monitor_ws))
        .route("/healthz", get(handlers::admin::health))
        .route("/metrics", get(handlers::admin::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state)
}

/// Standalone metrics listener, bound only when `[metrics] enabled`.
pub fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::admin::metrics))
        .route("/healthz", get(handlers::admin::health))
        .with_state(state)
}

// The wrong-method case is worth pinning down since workers hit these
// routes from hand-rolled SDKs.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::orchestrator::OrchestratorSettings;
    use crate::persistence::MemoryStore;
    use crate::queue::TaskQueue;
    use crate::registry::WorkerRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> AppState {
        Arc::new(Orchestrator::new(
            Arc::new(MemoryStore::new()),
            EventBus::new(),
            Arc::new(TaskQueue::new(std::time::Duration::from_secs(60))),
            Arc::new(WorkerRegistry::new(std::time::Duration::from_secs(30))),
            OrchestratorSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = coordinator_router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_404() {
        let app = coordinator_router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/workflows/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_then_status_roundtrip() {
        let app = coordinator_router(state());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/workflows")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"workflow_type": "greet"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let id = value["workflow_id"].as_str().unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/workflows/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["state"], "running");
        assert_eq!(value["current_step"], "start");
    }

    #[tokio::test]
    async fn test_monitor_list_shape() {
        let app = monitor_router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/workflows?scope=active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.is_array());
    }
}
