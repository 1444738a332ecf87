//! Work item carried through the queues

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work routed to a named queue
///
/// The payload is opaque to the engine; `queue` is the routing metadata used
/// by [`WorkManager::post_work_item`](crate::WorkManager::post_work_item) to
/// pick (or create) the queue the item lands in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// How many times this item has been re-emitted as a follow-up
    #[serde(default)]
    pub hops: u32,
}

impl WorkItem {
    /// Create a new work item for the given queue
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue: queue.into(),
            payload,
            created_at: Utc::now(),
            hops: 0,
        }
    }

    /// Derive a follow-up item that stays on the same queue
    pub fn follow_up(&self, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue: self.queue.clone(),
            payload,
            created_at: Utc::now(),
            hops: self.hops + 1,
        }
    }
}
