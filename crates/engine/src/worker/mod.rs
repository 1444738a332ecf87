//! Workers and the pool that owns them
//!
//! This module provides:
//! - [`Worker`] - One consumption loop on its own tokio task
//! - [`WorkManager`] - Pool orchestrator and public engine surface
//! - [`desired_workers`] / [`dequeue_timeout`] - Scaling rules
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        WorkManager                            │
//! │  post_work_item ──► QueueStore (commit) ──► QueueTracker      │
//! │                                                               │
//! │  ┌──────────┐  ┌──────────┐        ┌──────────────────────┐   │
//! │  │ Worker 1 │  │ Worker 2 │  ...   │  DeferredExecutor    │   │
//! │  │ lease q1 │  │ lease q2 │ ─────► │  grow / shrink /     │   │
//! │  └──────────┘  └──────────┘ hooks  │  retire (serialized) │   │
//! │                                     └──────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A worker leases one queue at a time, runs up to `yield_after`
//! transactional cycles on it, then runs the queue exit procedure, which
//! decides between releasing the queue, marking it suspected empty, or
//! scheduling its retirement.

mod pool;
mod runner;
mod scaling;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use pool::{EngineError, WorkManager, WorkManagerStatus, WorkerFailure};
pub use runner::{PoolHooks, VisitExit, VisitOutcome, Worker, WorkerContext, WorkerError};
pub use scaling::{dequeue_timeout, desired_workers};

/// Unique worker identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Generate a new time-ordered worker id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, loop not entered yet
    Starting,
    /// Leasing and processing queues
    Running,
    /// Waiting to be resumed
    Paused,
    /// Stop requested, finishing the current transaction
    Stopping,
    /// Loop ended normally
    Stopped,
    /// Loop ended with a fatal error
    Failed,
}

impl WorkerState {
    /// Whether the loop has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}
