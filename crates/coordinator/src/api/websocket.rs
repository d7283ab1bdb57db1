//! Streaming task delivery to workers.
//!
//! A worker opens `GET /v1/workers/{id}/tasks?token=...` and receives
//! matched tasks as they become available, plus cancel frames for workflows
//! it holds claims on. The worker answers with ack, heartbeat, or return
//! frames. Delivery is woken by the queue and backstopped by a short poll
//! interval, so one loop serves both delivery and control frames.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};

use crate::api::models::{ServerFrame, TaskDto, WorkerFrame};
use crate::api::AppState;

/// Maximum tasks pushed per wake-up.
const STREAM_TASKS_LIMIT: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// GET /v1/workers/{id}/tasks — WebSocket task streaming.
pub async fn worker_tasks_ws(
    ws: WebSocketUpgrade,
    State(orch): State<AppState>,
    Path(worker_id): Path<String>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_worker_socket(socket, orch, worker_id, query.token))
}

async fn handle_worker_socket(
    socket: WebSocket,
    orch: AppState,
    worker_id: String,
    session_token: String,
) {
    if orch.registry().authorize(&session_token).await.is_err() {
        tracing::warn!(worker_id = %worker_id, "Task stream rejected: invalid session token");
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    let mut cancels = orch.subscribe_cancellations();
    let mut poll_timer = interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            // Queue wake-up: push whatever matches right away.
            _ = orch.queue().wait_for_tasks() => {
                if !push_tasks(&orch, &mut sender, &worker_id, &session_token).await {
                    break;
                }
            }

            // Backstop poll in case a wake-up was missed.
            _ = poll_timer.tick() => {
                if !push_tasks(&orch, &mut sender, &worker_id, &session_token).await {
                    break;
                }
            }

            notice = cancels.recv() => {
                match notice {
                    Ok(notice) if notice.session_token == session_token => {
                        let frame = ServerFrame::Cancel {
                            workflow_id: notice.workflow_id,
                            task_id: notice.task_id,
                        };
                        if let Ok(json) = serde_json::to_string(&frame) {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_worker_frame(&orch, &worker_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(worker_id = %worker_id, "Task stream closed by worker");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are handled by axum; binary is ignored.
                    }
                    Some(Err(err)) => {
                        tracing::warn!(worker_id = %worker_id, error = %err, "Task stream error");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(worker_id = %worker_id, "Task stream ended");
}

/// Claim and stream available tasks; false means the socket is gone or the
/// session is no longer valid.
async fn push_tasks(
    orch: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
    worker_id: &str,
    session_token: &str,
) -> bool {
    let tasks = match orch.dispatch_tasks(session_token, STREAM_TASKS_LIMIT).await {
        Ok(tasks) => tasks,
        Err(err) => {
            tracing::warn!(worker_id = %worker_id, error = %err, "Task stream dispatch failed");
            return false;
        }
    };
    for task in tasks {
        let frame = ServerFrame::Task {
            payload: TaskDto::from_task(&task),
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(error = %err, "Failed to serialize task frame");
                continue;
            }
        };
        if sender.send(Message::Text(json)).await.is_err() {
            tracing::debug!(worker_id = %worker_id, "Task stream send failed");
            return false;
        }
        tracing::debug!(
            worker_id = %worker_id,
            task_id = %task.task_id,
            step = %task.step_name,
            "Task streamed to worker"
        );
    }
    true
}

async fn handle_worker_frame(orch: &AppState, worker_id: &str, text: &str) {
    let frame: WorkerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(worker_id = %worker_id, error = %err, "Unparseable frame on task stream");
            return;
        }
    };
    match frame {
        WorkerFrame::Ack { task_id } => {
            tracing::trace!(worker_id = %worker_id, task_id = %task_id, "Task acknowledged");
        }
        WorkerFrame::Heartbeat { task_id } => {
            if let Err(err) = orch.task_heartbeat(&task_id).await {
                tracing::debug!(task_id = %task_id, error = %err, "Task heartbeat ignored");
            }
        }
        WorkerFrame::Return { task_id } => {
            if orch.queue().release(&task_id).await {
                tracing::info!(worker_id = %worker_id, task_id = %task_id, "Task returned to queue");
            }
        }
    }
}
