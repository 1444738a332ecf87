//! # Adaptive Work Processing Engine
//!
//! Consumes work items from a dynamically changing set of transactional
//! queues and hands each item to a pluggable handler.
//!
//! ## Features
//!
//! - **Adaptive pool**: one worker per active queue, bounded by min/max worker counts
//! - **Exclusive leases**: a queue is drained by at most one worker at a time
//! - **Atomic cycles**: dequeue, handling and follow-up enqueue commit together
//! - **Queue retirement**: idle queues are suspected, confirmed after a delay, then removed
//! - **Serialized resizing**: pool and queue-set changes run on a deferred executor
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkManager                           │
//! │  (owns workers, posts items, grows/shrinks the pool)        │
//! └─────────────────────────────────────────────────────────────┘
//!            │                    │                    │
//!            ▼                    ▼                    ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │  QueueTracker    │ │     Workers      │ │ DeferredExecutor │
//! │ (leases, idle    │ │ (lease, cycle,   │ │ (grow, shrink,   │
//! │  suspicion)      │ │  exit procedure) │ │  retire)         │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        QueueStore                            │
//! │  (transactional named queues; InMemoryQueueStore provided)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use queueflow_engine::prelude::*;
//!
//! let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
//! let factory: Arc<dyn HandlerFactory> = Arc::new(|queue: &str| {
//!     let queue = queue.to_string();
//!     handler_fn(move |item: WorkItem| {
//!         let queue = queue.clone();
//!         async move {
//!             tracing::info!(%queue, id = %item.id, "handled");
//!             Ok(None)
//!         }
//!     })
//! });
//!
//! let manager = WorkManager::new(store, factory, EngineConfig::from_env()?)?;
//! manager.start().await?;
//! manager.post_work_item(WorkItem::new("sensor-1", json!({"t": 21.5}))).await?;
//! manager.drain_and_stop().await?;
//! ```

pub mod config;
pub mod deferred;
pub mod handler;
pub mod sink;
pub mod stats;
pub mod store;
pub mod tracker;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, EngineConfig};
    pub use crate::handler::{
        handler_fn, HandlerError, HandlerFactory, HandlerMode, WorkItemHandler,
    };
    pub use crate::sink::{MessageSink, TracingSink};
    pub use crate::store::{InMemoryQueueStore, QueueStore, StoreError, WorkItem};
    pub use crate::worker::{EngineError, WorkManager, WorkManagerStatus};
}

// Re-export key types at crate root
pub use config::{ConfigError, EngineConfig};
pub use deferred::{DeferredError, DeferredExecutor};
pub use handler::{
    handler_fn, HandlerError, HandlerFactory, HandlerMode, HandlerResolver, WorkItemHandler,
};
pub use sink::{MessageSink, TracingSink};
pub use stats::EngineStats;
pub use store::{InMemoryQueueStore, QueueStore, StoreError, StoreTransaction, WorkItem};
pub use tracker::{QueueLease, QueueTracker};
pub use worker::{
    dequeue_timeout, desired_workers, EngineError, VisitExit, VisitOutcome, WorkManager,
    WorkManagerStatus, Worker, WorkerError, WorkerFailure, WorkerId, WorkerState,
};
