//! Synthetic producer
//!
//! Posts readings to a rotating set of `sensor-N` queues so the pool has
//! something to grow, shrink and retire against.

use std::time::Duration;

use anyhow::Result;
use queueflow_engine::{EngineError, WorkItem, WorkManager};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Producer configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Number of distinct queues to spread items over
    pub queues: usize,
    /// Delay between bursts
    pub interval: Duration,
    /// Items posted per burst
    pub burst: usize,
    /// Back-off after the engine reports a full buffer
    pub backoff: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queues: 8,
            interval: Duration::from_millis(500),
            burst: 4,
            backoff: Duration::from_secs(2),
        }
    }
}

impl ProducerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `PRODUCER_QUEUES`: Number of queues (default: 8)
    /// - `PRODUCER_INTERVAL_MS`: Delay between bursts (default: 500)
    /// - `PRODUCER_BURST`: Items per burst (default: 4)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queues: std::env::var("PRODUCER_QUEUES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.queues),
            interval: std::env::var("PRODUCER_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            burst: std::env::var("PRODUCER_BURST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.burst),
            backoff: defaults.backoff,
        }
    }
}

/// Post random readings until `shutdown` flips to `true`
///
/// Returns the number of items accepted by the engine. Stops early once the
/// engine no longer accepts posts.
pub async fn run_producer(
    manager: WorkManager,
    config: ProducerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64> {
    let mut rng = StdRng::from_entropy();
    let mut posted = 0u64;

    info!(
        queues = config.queues,
        interval_ms = config.interval.as_millis() as u64,
        burst = config.burst,
        "Producer started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut delay = config.interval;
        for _ in 0..config.burst {
            let queue = format!("sensor-{}", rng.gen_range(0..config.queues));
            let value: f64 = rng.gen_range(-20.0..40.0);
            let item = WorkItem::new(queue, json!({ "value": value }));

            match manager.post_work_item(item).await {
                Ok(()) => posted += 1,
                Err(EngineError::BufferFull { limit }) => {
                    warn!(limit, "Engine buffer full, backing off");
                    delay = config.backoff;
                    break;
                }
                Err(EngineError::Draining | EngineError::NotRunning) => {
                    debug!("Engine no longer accepts posts");
                    return Ok(posted);
                }
                Err(e) => return Err(e.into()),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(posted, "Producer stopped");
    Ok(posted)
}
