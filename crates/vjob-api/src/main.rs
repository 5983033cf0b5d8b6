//! Axum API server binary.
//!
//! Serves the HTTP surface and, unless `API_RUN_WORKER=false`, also runs the
//! distributed worker loop in-process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use vjob_api::{create_router, metrics, ApiConfig, AppState};
use vjob_worker::{init_tracing, Pipeline, UpstreamConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Install rustls crypto provider (required for rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    init_tracing("vjob-api");
    info!("Starting vjob-api");

    let config = ApiConfig::from_env();
    info!("API config: host={}, port={}", config.host, config.port);

    let pipeline = Pipeline::from_env().context("failed to build pipeline")?;
    pipeline
        .register_http_handlers(&UpstreamConfig::from_env())
        .context("failed to register handlers")?;
    pipeline.start();
    let pipeline = Arc::new(pipeline);

    let metrics_handle = if config.metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics().context("failed to install Prometheus recorder")?)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = if config.run_worker {
        let worker = pipeline.worker();
        Some(tokio::spawn(async move { worker.run(shutdown_rx).await }))
    } else {
        // Without the worker loop, still ping the backend once so the
        // router starts on the right path.
        pipeline
            .router
            .init_backend(pipeline.worker_config.backend_init_attempts, std::time::Duration::from_secs(1))
            .await;
        None
    };

    let app = create_router(AppState::new(config.clone(), Arc::clone(&pipeline)), metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Worker loop error: {}", e),
            Err(e) => error!("Worker task panicked: {}", e),
        }
    }
    pipeline.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
}
