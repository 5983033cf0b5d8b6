//! Queue worker binary.
//!
//! Polls the distributed backend and runs the fallback dispatcher for jobs
//! submitted while the backend was down.

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use vjob_worker::{init_tracing, Pipeline, UpstreamConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing("vjob-worker");

    info!("Starting vjob-worker");

    let pipeline = Pipeline::from_env().context("failed to build pipeline")?;
    info!("Worker config: {:?}", pipeline.worker_config);

    pipeline
        .register_http_handlers(&UpstreamConfig::from_env())
        .context("failed to register handlers")?;
    pipeline.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = pipeline.worker();
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    match worker_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Worker loop error: {}", e),
        Err(e) => error!("Worker task panicked: {}", e),
    }

    pipeline.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}
