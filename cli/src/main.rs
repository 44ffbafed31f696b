//! Tandem CLI - convergence simulation for the sync core.
//!
//! Runs several client replicas against an in-memory server replica, with
//! local edits racing every sync, and checks that they all end up holding
//! the server's data. Prints a JSON summary and exits non-zero when a
//! replica diverged.

mod config;
mod error;
mod remote;
mod simulation;

use crate::config::Config;
use crate::error::Result;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env first so it can set RUST_LOG
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_cli=info,tandem_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "simulation failed");
            ExitCode::from(2)
        }
    }
}

/// Whether every replica converged.
async fn run() -> Result<bool> {
    let config = Config::from_env()?;
    tracing::info!(
        clients = config.clients,
        rounds = config.rounds,
        latency_ms = config.remote_latency.as_millis() as u64,
        "starting simulation"
    );

    let summary = simulation::run(&config).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary.converged)
}
