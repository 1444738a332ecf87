//! Demo relay handler
//!
//! Each queue gets its own [`RelayHandler`]. A handler logs the reading it
//! receives and re-emits a smoothed copy on the same queue until the item
//! has travelled `max_hops` times.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use queueflow_engine::{HandlerError, HandlerFactory, WorkItem, WorkItemHandler};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Payload carried by relay items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    #[serde(default)]
    pub smoothed: Option<f64>,
}

pub struct RelayHandler {
    queue: String,
    max_hops: u32,
    handled: AtomicU64,
}

impl RelayHandler {
    pub fn new(queue: impl Into<String>, max_hops: u32) -> Self {
        Self {
            queue: queue.into(),
            max_hops,
            handled: AtomicU64::new(0),
        }
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WorkItemHandler for RelayHandler {
    async fn handle(&self, item: WorkItem) -> Result<Option<WorkItem>, HandlerError> {
        let reading: Reading = serde_json::from_value(item.payload.clone())?;
        let handled = self.handled.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            queue = %self.queue,
            item_id = %item.id,
            hops = item.hops,
            value = reading.value,
            handled,
            "relay item handled"
        );

        if item.hops >= self.max_hops {
            info!(
                queue = %self.queue,
                item_id = %item.id,
                value = reading.smoothed.unwrap_or(reading.value),
                "relay chain finished"
            );
            return Ok(None);
        }

        let smoothed = match reading.smoothed {
            Some(prev) => (prev + reading.value) / 2.0,
            None => reading.value,
        };
        let next = Reading {
            value: reading.value,
            smoothed: Some(smoothed),
        };
        Ok(Some(item.follow_up(serde_json::to_value(next)?)))
    }
}

/// Factory producing one relay handler per requested queue
pub fn relay_factory(max_hops: u32) -> Arc<dyn HandlerFactory> {
    Arc::new(move |queue: &str| -> Arc<dyn WorkItemHandler> {
        Arc::new(RelayHandler::new(queue, max_hops))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_relays_until_max_hops() {
        let handler = RelayHandler::new("sensor-1", 2);
        let mut item = WorkItem::new("sensor-1", json!({ "value": 4.0 }));

        let mut chain = 0;
        while let Some(next) = handler.handle(item).await.unwrap() {
            assert_eq!(next.queue, "sensor-1");
            item = next;
            chain += 1;
        }

        assert_eq!(chain, 2);
        assert_eq!(handler.handled(), 3);
    }

    #[tokio::test]
    async fn test_smooths_readings() {
        let handler = RelayHandler::new("sensor-1", 5);
        let item = WorkItem::new("sensor-1", json!({ "value": 10.0, "smoothed": 20.0 }));

        let next = handler.handle(item).await.unwrap().unwrap();
        let reading: Reading = serde_json::from_value(next.payload).unwrap();
        assert_eq!(reading.smoothed, Some(15.0));
        assert_eq!(next.hops, 1);
    }

    #[tokio::test]
    async fn test_rejects_malformed_payload() {
        let handler = RelayHandler::new("sensor-1", 1);
        let item = WorkItem::new("sensor-1", json!({ "temperature": "warm" }));

        let err = handler.handle(item).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }

    #[test]
    fn test_factory_builds_handler_per_queue() {
        let factory = relay_factory(3);
        let a = factory.create("a");
        let b = factory.create("b");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
