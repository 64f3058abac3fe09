//! Lease pool worker binary.
//!
//! Runs until Ctrl+C, then lets in-flight batches finish.

use lease_pool_worker::{Config, Worker};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lease_pool_worker=info,lease_pool_runtime=info".into()),
        )
        .with(fmt::layer())
        .init();

    let config = Config::from_env()?;
    config.validate()?;

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker = tokio::spawn(Worker::run_from_config(config, shutdown_rx));

    tokio::select! {
        result = &mut worker => {
            // Stopped before any signal: a loop failed or its stream ended.
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown signal received");
        }
    }

    // A dropped receiver only means the loops have already exited.
    let _ = shutdown_tx.send(true);
    worker.await??;
    Ok(())
}
