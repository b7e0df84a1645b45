//! Shuffle-server daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use skein_server::{Heartbeater, ServerConfig, ShuffleServerHandler};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "skein-server", about = "Skein shuffle server")]
struct Args {
    /// Path to the server TOML config.
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
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let handler = Arc::new(ShuffleServerHandler::from_config(&config)?);
    let background = handler.spawn_background();
    let heartbeat = Heartbeater::new(
        &config.coordinators,
        Arc::clone(&handler),
        Duration::from_secs(config.heartbeat.interval_secs),
    )
    .spawn();

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(bind = %config.bind, server_id = %handler.info().id, "shuffle server listening");

    tokio::select! {
        result = skein_wire::serve(listener, Arc::clone(&handler)) => {
            result.context("serve loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, draining flush queues");
        }
    }

    handler.shutdown();
    heartbeat.abort();
    background.gc.abort();
    // Let the flush workers finish writing whatever is queued.
    for worker in background.flush_workers {
        let _ = tokio::time::timeout(Duration::from_secs(30), worker).await;
    }
    Ok(())
}
