//! Bastion daemon - Main entry point

use anyhow::Context;
use bastion_foundation::BastionConfig;
use bastion_task::{GarbageCollector, LocalDirStore, TaskEngine};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bastion - sandboxed task execution for coding agents
#[derive(Parser, Debug)]
#[command(name = "bastiond")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ~/.config/bastion/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let path = args.config.unwrap_or_else(BastionConfig::default_path);
    let config = BastionConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    let runtime = bastion_task::connect(&config.runtime)
        .await
        .context("connecting to the container runtime")?;
    let engine = TaskEngine::from_config(&config, runtime).context("building the task engine")?;

    let mut gc = engine.garbage_collector();
    if config.gc.backup_before_delete {
        let dir = snapshot_dir();
        info!(dir = %dir.display(), "Container snapshots enabled");
        gc = gc.with_backup(Arc::new(LocalDirStore::new(dir)));
    }
    let gc: Arc<GarbageCollector> = Arc::new(gc);
    let gc_handle = Arc::clone(&gc).spawn();
    let pruner = engine
        .audit()
        .spawn_pruner(config.audit.prune_interval(), config.audit.retention());

    let status = engine.status().await;
    info!(
        status = %serde_json::to_string(&status).unwrap_or_default(),
        "Bastion ready"
    );
    if !status.ready {
        warn!(runtime = %status.runtime.as_str(), "Container runtime did not answer ping");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    gc_handle.abort();
    pruner.abort();
    engine.audit().flush().await;
    Ok(())
}

fn snapshot_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bastion")
        .join("snapshots")
}
