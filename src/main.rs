//! Schema Sentinel - schema drift watcher
//!
//! Polls a hosted Postgres project for schema changes and reconciles the
//! application against them:
//! - Detect: privileged catalog introspection, or the restricted REST surface
//! - Classify: fingerprint comparison and a typed change set
//! - Reconcile: snapshot backup, notification fan-out, binding regeneration,
//!   validation and an allow-listed auto-commit
//! - Observe: a live dashboard with a server-sent event stream

mod bindings;
mod config;
mod dashboard;
mod detector;
mod error;
mod introspection;
mod notify;
mod orchestrator;
mod pipeline;
mod process;
mod routes;
mod snapshot;
mod state;
mod store;
mod supervisor;
#[cfg(test)]
mod testing;

use crate::config::{Credentials, StatePaths};
use crate::orchestrator::Orchestrator;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "schema-sentinel", version, about = "Watch a database schema and reconcile the app against it")]
struct Cli {
    /// Project root (bindings, docs and git working tree)
    #[arg(long = "project-root", env = "SENTINEL_PROJECT_ROOT", default_value = ".")]
    project_root: PathBuf,

    /// State directory, relative to the project root unless absolute
    #[arg(long = "state-dir", env = "SENTINEL_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the detection loop and the dashboard under supervision
    Start,
    /// Stop a running instance
    Stop,
    /// Show persisted state
    Status,
    /// Run one detection cycle now
    Check,
    /// Regenerate the typed bindings
    Types,
    /// Run the validation checks
    Validate,
    /// Create the configuration document
    Setup {
        /// Also pull the remote schema into local files
        #[arg(long)]
        pull: bool,
    },
    #[command(hide = true)]
    Monitor,
    #[command(hide = true)]
    Dashboard,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first so clap sees its variables
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let supervised = matches!(cli.command, Command::Monitor | Command::Dashboard);
    init_tracing(!supervised);

    let credentials = Credentials::from_env()?;
    let paths = StatePaths::new(cli.project_root, cli.state_dir);
    let orchestrator = Orchestrator::new(paths, credentials);

    match cli.command {
        Command::Start => {
            info!("🚀 Starting Schema Sentinel...");
            let cancel = shutdown_token();
            orchestrator.start(cancel).await?;
            info!("👋 Shutdown complete");
        }
        Command::Stop => {
            if !orchestrator.stop().await? {
                info!("Nothing to stop");
            }
        }
        Command::Status => print_json(&orchestrator.status().await?)?,
        Command::Check => {
            let report = orchestrator.check().await?;
            print_json(&report)?;
            if !report.healthy() {
                anyhow::bail!("cycle finished with errors: {}", report.message());
            }
        }
        Command::Types => print_json(&orchestrator.types().await?)?,
        Command::Validate => {
            let report = orchestrator.validate().await?;
            for line in report.summary_lines() {
                println!("{}", line);
            }
            if !report.overall {
                anyhow::bail!("validation failed");
            }
        }
        Command::Setup { pull } => print_json(&orchestrator.setup(pull).await?)?,
        Command::Monitor => {
            let cancel = shutdown_token();
            if let Err(e) = orchestrator.run_monitor(cancel).await {
                error!("❌ Monitor stopped: {}", e);
                return Err(e.into());
            }
        }
        Command::Dashboard => {
            let cancel = shutdown_token();
            orchestrator.run_dashboard(cancel).await?;
        }
    }

    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing(ansi: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schema_sentinel=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_ansi(ansi)
                .with_target(true)
                .with_level(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Token cancelled on the first Ctrl+C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    token
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
