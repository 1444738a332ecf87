//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handler::HandlerMode;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value failed validation
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// An environment variable could not be parsed
    #[error("could not parse {var}={value:?}: {reason}")]
    Parse {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration for the [`WorkManager`](crate::WorkManager)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dequeue cycles a worker runs on one queue before releasing it
    pub yield_after: usize,

    /// How long a queue must stay suspected empty before it is retired
    #[serde(with = "duration_millis")]
    pub retire_empty_queue_after: Duration,

    /// Wait between lease attempts when no queue is available
    #[serde(with = "duration_millis")]
    pub no_queue_retry_interval: Duration,

    /// Upper bound on how long a paused worker waits before re-checking
    #[serde(with = "duration_millis")]
    pub pause_poll_interval: Duration,

    /// Dequeue wait used when queues outnumber workers
    #[serde(with = "duration_millis")]
    pub short_dequeue_timeout: Duration,

    /// Dequeue wait used otherwise
    #[serde(with = "duration_millis")]
    pub long_dequeue_timeout: Duration,

    pub handler_mode: HandlerMode,

    pub min_workers: usize,

    pub max_workers: usize,

    /// Posts are rejected once this many items are buffered
    pub max_buffered_items: usize,

    /// Interval of the background rebalance that replaces dead workers
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// Upper bound for `drain_and_stop`
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            yield_after: 10,
            retire_empty_queue_after: Duration::from_secs(60),
            no_queue_retry_interval: Duration::from_secs(5),
            pause_poll_interval: Duration::from_secs(5),
            short_dequeue_timeout: Duration::from_secs(2),
            long_dequeue_timeout: Duration::from_secs(20),
            handler_mode: HandlerMode::PerQueue,
            min_workers: 1,
            max_workers: 16,
            max_buffered_items: 10_000,
            health_check_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `QUEUEFLOW_*` environment variables
    ///
    /// Unset variables keep their defaults. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "QUEUEFLOW_YIELD_AFTER")? {
            config.yield_after = v;
        }
        if let Some(v) = parse_millis(&lookup, "QUEUEFLOW_RETIRE_EMPTY_QUEUE_AFTER_MS")? {
            config.retire_empty_queue_after = v;
        }
        if let Some(v) = parse_millis(&lookup, "QUEUEFLOW_NO_QUEUE_RETRY_MS")? {
            config.no_queue_retry_interval = v;
        }
        if let Some(v) = parse_millis(&lookup, "QUEUEFLOW_PAUSE_POLL_MS")? {
            config.pause_poll_interval = v;
        }
        if let Some(v) = parse_millis(&lookup, "QUEUEFLOW_SHORT_DEQUEUE_TIMEOUT_MS")? {
            config.short_dequeue_timeout = v;
        }
        if let Some(v) = parse_millis(&lookup, "QUEUEFLOW_LONG_DEQUEUE_TIMEOUT_MS")? {
            config.long_dequeue_timeout = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUEFLOW_HANDLER_MODE")? {
            config.handler_mode = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUEFLOW_MIN_WORKERS")? {
            config.min_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUEFLOW_MAX_WORKERS")? {
            config.max_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUEFLOW_MAX_BUFFERED_ITEMS")? {
            config.max_buffered_items = v;
        }
        if let Some(v) = parse_millis(&lookup, "QUEUEFLOW_HEALTH_CHECK_MS")? {
            config.health_check_interval = v;
        }
        if let Some(v) = parse_millis(&lookup, "QUEUEFLOW_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.yield_after == 0 {
            return Err(invalid("yield_after", "must be at least 1"));
        }
        if self.max_workers == 0 {
            return Err(invalid("max_workers", "must be at least 1"));
        }
        if self.min_workers > self.max_workers {
            return Err(invalid(
                "min_workers",
                format!(
                    "{} exceeds max_workers {}",
                    self.min_workers, self.max_workers
                ),
            ));
        }
        if self.short_dequeue_timeout > self.long_dequeue_timeout {
            return Err(invalid(
                "short_dequeue_timeout",
                format!(
                    "{:?} exceeds long_dequeue_timeout {:?}",
                    self.short_dequeue_timeout, self.long_dequeue_timeout
                ),
            ));
        }
        if self.max_buffered_items == 0 {
            return Err(invalid("max_buffered_items", "must be at least 1"));
        }
        Ok(())
    }

    /// Set the number of cycles per queue visit
    pub fn with_yield_after(mut self, cycles: usize) -> Self {
        self.yield_after = cycles;
        self
    }

    /// Set the retirement delay for idle queues
    pub fn with_retire_empty_queue_after(mut self, delay: Duration) -> Self {
        self.retire_empty_queue_after = delay;
        self
    }

    /// Set the retry interval when no queue can be leased
    pub fn with_no_queue_retry_interval(mut self, interval: Duration) -> Self {
        self.no_queue_retry_interval = interval;
        self
    }

    /// Set the paused re-check interval
    pub fn with_pause_poll_interval(mut self, interval: Duration) -> Self {
        self.pause_poll_interval = interval;
        self
    }

    /// Set both dequeue timeouts
    pub fn with_dequeue_timeouts(mut self, short: Duration, long: Duration) -> Self {
        self.short_dequeue_timeout = short;
        self.long_dequeue_timeout = long;
        self
    }

    /// Set the handler sharing mode
    pub fn with_handler_mode(mut self, mode: HandlerMode) -> Self {
        self.handler_mode = mode;
        self
    }

    /// Set the worker count bounds
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Set the buffered item limit
    pub fn with_max_buffered_items(mut self, max: usize) -> Self {
        self.max_buffered_items = max;
        self
    }

    /// Set the health check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => Err(ConfigError::Parse {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_millis<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<F, u64>(lookup, var)?.map(Duration::from_millis))
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
