//! Aether command line tool: the `serve` entrypoint plus a thin client for
//! status, cancellation, and listing.

mod client;
mod templates;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aether_coordinator::{server, Config};
use client::AetherClient;

#[derive(Parser)]
#[command(name = "aetherctl")]
#[command(version, about = "Aether workflow engine CLI")]
struct Cli {
    /// Coordinator API base URL
    #[arg(long, default_value = "http://localhost:7233", global = true)]
    server: String,

    /// Monitor API base URL
    #[arg(long, default_value = "http://localhost:7234", global = true)]
    monitor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Aether coordinator
    Serve {
        /// Durable state directory
        #[arg(long)]
        db: Option<PathBuf>,
        /// Client/worker-plane port
        #[arg(long)]
        grpc_port: Option<u16>,
        /// Monitor-plane port
        #[arg(long)]
        http_port: Option<u16>,
        /// Persistence mode: memory | snapshot | state-action-log
        #[arg(long)]
        persistence: Option<String>,
        /// Configuration file (TOML); defaults to ./aether.toml when present
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show workflow status
    Status { workflow_id: String },
    /// Cancel a workflow
    Cancel { workflow_id: String },
    /// Workflow queries
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Scaffold a new Aether project
    Init {
        /// Project name
        name: String,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List workflows
    List {
        /// Workflow type filter
        #[arg(short = 't', long = "type")]
        workflow_type: Option<String>,
        /// State filter: pending | running | completed | failed | cancelled
        #[arg(short, long)]
        state: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aether_coordinator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn format_instant(millis: u64) -> String {
    chrono_from_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn chrono_from_millis(millis: u64) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(millis as i64)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            db,
            grpc_port,
            http_port,
            persistence,
            config,
        } => {
            init_tracing();
            let mut config = Config::load(config.as_deref())?;
            if let Some(db) = db {
                config.server.db_path = db;
            }
            if let Some(port) = grpc_port {
                config.server.grpc_port = port;
            }
            if let Some(port) = http_port {
                config.server.http_port = port;
            }
            if let Some(mode) = persistence {
                config.persistence.mode = mode;
            }
            server::run(config).await
        }

        Commands::Status { workflow_id } => {
            let client = AetherClient::new(&cli.server, &cli.monitor);
            let status = client.status(&workflow_id).await?;
            println!("Workflow:  {}", status.workflow_id);
            println!("State:     {}", status.state);
            if let Some(step) = &status.current_step {
                println!("Step:      {}", step);
            }
            println!("Started:   {}", format_instant(status.started_at));
            if let Some(completed) = status.completed_at {
                println!("Completed: {}", format_instant(completed));
            }
            Ok(())
        }

        Commands::Cancel { workflow_id } => {
            let client = AetherClient::new(&cli.server, &cli.monitor);
            let result = client.cancel(&workflow_id).await?;
            println!("{}: {}", result.workflow_id, result.message);
            Ok(())
        }

        Commands::Workflow { action } => {
            let WorkflowAction::List {
                workflow_type,
                state,
            } = action;
            let client = AetherClient::new(&cli.server, &cli.monitor);
            let workflows = client
                .list_workflows(workflow_type.as_deref(), state.as_deref())
                .await?;
            if workflows.is_empty() {
                println!("No workflows found");
                return Ok(());
            }
            println!(
                "{:<38} {:<20} {:<10} {:<20} STARTED",
                "WORKFLOW", "TYPE", "STATE", "STEP"
            );
            for workflow in workflows {
                println!(
                    "{:<38} {:<20} {:<10} {:<20} {}",
                    workflow.workflow_id,
                    workflow.workflow_type,
                    workflow.state,
                    workflow.current_step.as_deref().unwrap_or("-"),
                    format_instant(workflow.started_at)
                );
            }
            Ok(())
        }

        Commands::Init { name, output } => templates::scaffold(&name, &output),
    }
}
