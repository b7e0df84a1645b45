//! Coordinator daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use skein_coordinator::{CoordinatorConfig, CoordinatorHandler};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "skein-coordinator", about = "Skein shuffle coordinator")]
struct Args {
    /// Path to the coordinator TOML config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind address from config.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = CoordinatorConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let handler = Arc::new(CoordinatorHandler::from_config(&config)?);
    let background = handler.spawn_background();

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(bind = %config.bind, "coordinator listening");

    tokio::select! {
        result = skein_wire::serve(listener, Arc::clone(&handler)) => {
            result.context("serve loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    for task in background {
        task.abort();
    }
    Ok(())
}
