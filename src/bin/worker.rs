//! Worker process: claims jobs from the node's queue and runs the
//! classification pipeline. Spawned and supervised by `classd-node`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use classd_node::config::NodeConfig;
use classd_node::pipeline::MediaTypeClassifier;
use classd_node::store::JobStore;
use classd_node::worker::WorkerRunner;

#[derive(Parser)]
#[command(name = "classd-worker", about = "Media-classification worker process")]
struct Args {
    /// Path to the node's TOML configuration file.
    #[arg(short, long, default_value = "cluster_config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classd_node=info,info".into()),
        )
        .init();

    let args = Args::parse();
    let config = NodeConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    let index = std::env::var("WORKER_INDEX").unwrap_or_else(|_| "0".to_string());
    let label = format!("{}-worker-{index}", config.node_name);
    info!(worker = %label, "worker starting");

    let store = JobStore::open(&config.database_path, config.busy_timeout_ms).await?;
    let runner = WorkerRunner::new(store, Arc::new(MediaTypeClassifier), label);

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;
    tokio::select! {
        _ = runner.run() => {},
        _ = sigterm.recv() => info!("SIGTERM received, exiting"),
        _ = tokio::signal::ctrl_c() => info!("interrupted, exiting"),
    }
    Ok(())
}
