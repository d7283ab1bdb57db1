//! Server assembly: wiring, listeners, background sweeps, graceful
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::api::{coordinator_router, metrics_router, monitor_router};
use crate::config::Config;
use crate::events::EventBus;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::persistence::{open_store, PersistenceMode};
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::task::RetryPolicy;

/// Build the orchestrator stack for the given configuration.
pub async fn build(config: &Config) -> anyhow::Result<Arc<Orchestrator>> {
    let mode = config.persistence_mode()?;
    let store = open_store(mode, &config.server.db_path).await?;

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        EventBus::new(),
        Arc::new(TaskQueue::new(config.visibility_timeout())),
        Arc::new(WorkerRegistry::new(config.heartbeat_timeout())),
        OrchestratorSettings {
            default_retry: RetryPolicy::default(),
            cancellation_deadline: config.cancellation_deadline(),
        },
    ));
    orchestrator.recover().await?;
    Ok(orchestrator)
}

/// Run the coordinator until SIGINT/SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let mode = config.persistence_mode()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        persistence = %mode,
        db_path = %config.server.db_path.display(),
        "Starting Aether coordinator"
    );

    let orchestrator = build(&config).await?;

    // Background sweeps.
    let reaper_interval = (config.heartbeat_timeout() / 3).max(Duration::from_secs(1));
    let reaper = tokio::spawn(Arc::clone(&orchestrator).run_reaper(reaper_interval));

    let flusher = if mode == PersistenceMode::Snapshot {
        let orch = Arc::clone(&orchestrator);
        let interval = config.snapshot_interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = orch.flush_store().await {
                    tracing::error!(error = %err, "Snapshot flush failed");
                }
            }
        }))
    } else {
        None
    };

    let retention = config.retention().map(|horizon| {
        tokio::spawn(
            Arc::clone(&orchestrator).run_retention(horizon, Duration::from_secs(3600)),
        )
    });

    // Listeners.
    let api_listener = TcpListener::bind(config.grpc_addr()).await?;
    let monitor_listener = TcpListener::bind(config.http_addr()).await?;
    tracing::info!(address = %config.grpc_addr(), "Coordinator API listening");
    tracing::info!(address = %config.http_addr(), "Monitor API listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let metrics_server = if config.metrics.enabled {
        let listener = TcpListener::bind(config.metrics_addr()).await?;
        tracing::info!(address = %config.metrics_addr(), "Metrics listening");
        let router = metrics_router(Arc::clone(&orchestrator));
        let mut rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await;
        }))
    } else {
        None
    };

    let mut api_rx = shutdown_rx.clone();
    let api_server = axum::serve(api_listener, coordinator_router(Arc::clone(&orchestrator)))
        .with_graceful_shutdown(async move {
            let _ = api_rx.changed().await;
        });

    let mut monitor_rx = shutdown_rx.clone();
    let monitor_server = axum::serve(monitor_listener, monitor_router(Arc::clone(&orchestrator)))
        .with_graceful_shutdown(async move {
            let _ = monitor_rx.changed().await;
        });

    let (api_result, monitor_result) = tokio::join!(api_server, monitor_server);
    api_result?;
    monitor_result?;

    reaper.abort();
    if let Some(flusher) = flusher {
        flusher.abort();
    }
    if let Some(retention) = retention {
        retention.abort();
    }
    if let Some(metrics_server) = metrics_server {
        let _ = metrics_server.await;
    }

    // Final flush so the snapshot tier loses nothing on a clean exit.
    orchestrator.flush_store().await?;
    tracing::info!("Coordinator shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
