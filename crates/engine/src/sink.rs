//! Trace message sink

use tracing::info;

/// Receives human-readable lifecycle messages from the engine
pub trait MessageSink: Send + Sync {
    fn trace(&self, message: &str);
}

/// Forwards messages to `tracing` at info level under target `queueflow::trace`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn trace(&self, message: &str) {
        info!(target: "queueflow::trace", "{message}");
    }
}
