//! Cluster node: HTTP API, health checker, stale-job watchdog and the
//! supervised worker pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::info;

use classd_node::api::{create_router, AppState};
use classd_node::cluster::{ClusterClient, Dispatcher, NodeRegistry};
use classd_node::config::NodeConfig;
use classd_node::store::{run_stale_watchdog, JobStore};
use classd_node::worker::supervisor::{WorkerCommand, WorkerPool};

#[derive(Parser)]
#[command(name = "classd-node", about = "Media-classification cluster node")]
struct Args {
    /// Path to the node's TOML configuration file.
    #[arg(short, long, default_value = "cluster_config.toml")]
    config: PathBuf,

    /// Worker binary to spawn. Defaults to `classd-worker` next to this
    /// executable.
    #[arg(long)]
    worker_bin: Option<PathBuf>,
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
    let config = Arc::new(
        NodeConfig::load(&args.config)
            .with_context(|| format!("loading config from {}", args.config.display()))?,
    );
    info!(node = %config.node_name, nodes = config.nodes.len(), "starting node");

    let store = JobStore::open(&config.database_path, config.busy_timeout_ms).await?;
    store.recover_on_startup().await?;

    let client = ClusterClient::new(Duration::from_secs(config.internal_timeout_secs));
    let registry = NodeRegistry::new(config.clone());
    let dispatcher = Arc::new(Dispatcher::new(config.node_order()));

    let worker_bin = match args.worker_bin {
        Some(path) => path,
        None => std::env::current_exe()
            .context("resolving own executable path")?
            .with_file_name("classd-worker"),
    };
    let workers = WorkerPool::spawn(
        WorkerCommand {
            program: worker_bin,
            args: vec![
                "--config".to_string(),
                args.config.to_string_lossy().into_owned(),
            ],
        },
        config.worker_processes,
        Duration::from_secs(config.shutdown_grace_secs),
    )?;

    tokio::spawn({
        let pool = workers.clone();
        async move { pool.monitor().await }
    });
    tokio::spawn(registry.clone().run(client.clone()));
    tokio::spawn(run_stale_watchdog(
        store.clone(),
        Duration::from_secs(config.stale_job_timeout_secs),
        Duration::from_secs(config.stale_check_interval_secs),
    ));

    let state = AppState {
        config: config.clone(),
        store,
        registry,
        dispatcher,
        client,
        workers: Some(workers.clone()),
    };
    let app = create_router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, stopping workers");
    workers.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm.recv() => {},
    }
    info!("shutdown signal received");
}
