//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared between the pool and its workers
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub items_processed: AtomicU64,
    pub follow_ups_enqueued: AtomicU64,
    pub contention_timeouts: AtomicU64,
    pub queues_retired: AtomicU64,
    pub shrink_evaluations: AtomicU64,
    pub grow_evaluations: AtomicU64,
    pub workers_started: AtomicU64,
    pub workers_stopped: AtomicU64,
    pub workers_failed: AtomicU64,
}

impl EngineCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            items_processed: self.items_processed.load(Ordering::Relaxed),
            follow_ups_enqueued: self.follow_ups_enqueued.load(Ordering::Relaxed),
            contention_timeouts: self.contention_timeouts.load(Ordering::Relaxed),
            queues_retired: self.queues_retired.load(Ordering::Relaxed),
            shrink_evaluations: self.shrink_evaluations.load(Ordering::Relaxed),
            grow_evaluations: self.grow_evaluations.load(Ordering::Relaxed),
            workers_started: self.workers_started.load(Ordering::Relaxed),
            workers_stopped: self.workers_stopped.load(Ordering::Relaxed),
            workers_failed: self.workers_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot returned by [`WorkManager::stats`](crate::WorkManager::stats)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub items_processed: u64,
    pub follow_ups_enqueued: u64,
    pub contention_timeouts: u64,
    pub queues_retired: u64,
    pub shrink_evaluations: u64,
    pub grow_evaluations: u64,
    pub workers_started: u64,
    pub workers_stopped: u64,
    pub workers_failed: u64,
}
