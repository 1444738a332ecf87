// Logging setup for the worker host
//
// Console output only, filtered with `RUST_LOG` or `LOG_LEVEL`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name reported in the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "queueflow_engine=debug")
    pub log_filter: Option<String>,
    /// Include the event target in console output
    pub with_target: bool,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "queueflow-worker".to_string(),
            log_filter: None,
            with_target: true,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "queueflow-worker")
    /// - `RUST_LOG`: Full filter directive, takes precedence
    /// - `LOG_LEVEL`: Level applied to every `queueflow*` target (e.g., "debug")
    /// - `LOG_FORMAT`: "json" for JSON lines
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_filter = lookup("RUST_LOG")
            .or_else(|| lookup("LOG_LEVEL").map(|level| format!("info,queueflow={level}")));

        Self {
            service_name: lookup("SERVICE_NAME").unwrap_or_else(|| "queueflow-worker".to_string()),
            log_filter,
            with_target: true,
            json: lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global subscriber
///
/// Call once at startup, before any other tracing happens.
pub fn init_telemetry(config: &TelemetryConfig) {
    let console_layer = if config.json {
        fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_filter(config.filter())
            .boxed()
    } else {
        fmt::layer()
            .with_target(config.with_target)
            .with_filter(config.filter())
            .boxed()
    };

    tracing_subscriber::registry().with(console_layer).init();

    tracing::debug!(
        service = %config.service_name,
        filter = config.log_filter.as_deref().unwrap_or("info"),
        "Telemetry initialized"
    );
}
