mod producer;
mod relay;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use queueflow_engine::{EngineConfig, EngineError, InMemoryQueueStore, WorkManager};
use tokio::sync::watch;

use crate::producer::{run_producer, ProducerConfig};
use crate::relay::relay_factory;
use crate::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - QUEUEFLOW_*: Engine settings, see EngineConfig::from_env
    // - PRODUCER_*: Synthetic load, see ProducerConfig::from_env
    // - RELAY_MAX_HOPS: Follow-ups emitted per posted item (default: 3)
    let telemetry_config = TelemetryConfig::from_env();
    init_telemetry(&telemetry_config);

    tracing::info!("queueflow-worker starting...");

    let config = EngineConfig::from_env().context("Invalid engine configuration")?;
    let max_hops = std::env::var("RELAY_MAX_HOPS")
        .ok()
        .map(|v| v.parse::<u32>())
        .transpose()
        .context("RELAY_MAX_HOPS must be a non-negative integer")?
        .unwrap_or(3);

    tracing::info!(
        min_workers = config.min_workers,
        max_workers = config.max_workers,
        handler_mode = ?config.handler_mode,
        yield_after = config.yield_after,
        max_hops,
        "Starting work manager"
    );

    let store = Arc::new(InMemoryQueueStore::new());
    let manager = WorkManager::new(store, relay_factory(max_hops), config)
        .context("Failed to create work manager")?;
    manager
        .start()
        .await
        .context("Failed to start work manager")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut producer = tokio::spawn(run_producer(
        manager.clone(),
        ProducerConfig::from_env(),
        shutdown_rx,
    ));

    tokio::select! {
        result = &mut producer => {
            match result {
                Ok(Ok(posted)) => tracing::info!(posted, "Producer finished"),
                Ok(Err(e)) => tracing::error!(error = %e, "Producer error"),
                Err(e) => tracing::error!(error = %e, "Producer task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            shutdown_tx.send_replace(true);
            if let Ok(Ok(posted)) = producer.await {
                tracing::info!(posted, "Producer finished");
            }
        }
    }

    match manager.drain_and_stop().await {
        Ok(()) => {}
        Err(EngineError::DrainTimeout { remaining }) => {
            tracing::warn!(remaining, "Stopped with unprocessed items");
        }
        Err(e) => return Err(e).context("Failed to stop work manager"),
    }

    let stats = manager.stats();
    tracing::info!(
        stats = %serde_json::to_string(&stats).unwrap_or_default(),
        "Worker shutdown complete"
    );
    Ok(())
}
