//! convoy scheduler
//!
//! Loads a cluster fixture into the in-memory store, registers an evaluation
//! per job and runs the evaluation workers until Ctrl+C, or until there is
//! no work left when `CONVOY_EXIT_WHEN_IDLE` is set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use convoy_scheduler::{
    config::Config,
    fixture::ClusterFixture,
    worker::{spawn_workers, WorkerConfig},
    MemStore, Server, SystemClock,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const IDLE_POLL: Duration = Duration::from_millis(200);
const PROMOTE_TICK: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CONVOY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting convoy scheduler");
    info!(
        num_workers = config.num_workers,
        algorithm = ?config.scheduler_algorithm,
        exit_when_idle = config.exit_when_idle,
        "Configuration loaded"
    );

    let store = MemStore::new();
    store.set_scheduler_config(config.scheduler_configuration());
    let server = Arc::new(Server::new(
        store,
        config.nack_delivery_limit,
        Arc::new(SystemClock),
    ));

    if let Some(path) = &config.cluster_file {
        let fixture = ClusterFixture::load(path)
            .with_context(|| format!("loading cluster fixture {}", path.display()))?;
        let evals = fixture.apply(&server)?;
        info!(evals = evals.len(), "Cluster fixture registered");
    } else {
        warn!("No CONVOY_CLUSTER_FILE set, starting with an empty cluster");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let promoter_handle = tokio::spawn({
        let server = Arc::clone(&server);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            server.broker().run(PROMOTE_TICK, shutdown_rx).await;
        }
    });

    let worker_handles = spawn_workers(
        config.num_workers,
        &server,
        &WorkerConfig::default(),
        &shutdown_rx,
    );

    if config.exit_when_idle {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
            }
            _ = wait_until_idle(&server) => {
                info!("No evaluations left, shutting down");
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, promoter_handle).await {
        warn!(error = %e, "Delayed evaluation promoter did not shut down in time");
    }
    for handle in worker_handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Evaluation worker did not shut down in time");
        }
    }

    let stats = server.broker().stats();
    let blocked = server.blocked_stats();
    info!(
        ready = stats.total_ready,
        waiting = stats.total_waiting,
        failed = stats.total_failed,
        blocked = server.blocked_len(),
        total_unblocked = blocked.total_unblocked,
        "Scheduler shutdown complete"
    );
    Ok(())
}

async fn wait_until_idle(server: &Server) {
    loop {
        tokio::time::sleep(IDLE_POLL).await;
        if server.broker().is_idle() {
            return;
        }
    }
}
