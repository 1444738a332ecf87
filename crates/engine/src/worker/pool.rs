//! Pool orchestrator
//!
//! [`WorkManager`] owns the workers, the queue tracker and the deferred
//! executor. Every change to the worker count and to the set of active
//! queues runs as a deferred task, so those mutations are serialized with
//! respect to each other and never run on a worker's hot path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::deferred::{DeferredError, DeferredExecutor};
use crate::handler::{HandlerFactory, HandlerResolver, WorkItemHandler};
use crate::sink::{MessageSink, TracingSink};
use crate::stats::{EngineCounters, EngineStats};
use crate::store::{QueueStore, StoreError, WorkItem};
use crate::tracker::{QueueLease, QueueTracker};

use super::runner::{PoolHooks, Worker, WorkerContext};
use super::scaling::desired_workers;
use super::WorkerId;

/// How often `drain_and_stop` re-checks the buffered count
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Work manager status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkManagerStatus {
    /// Created, not started
    New,
    /// Workers are processing and posts are accepted
    Running,
    /// Workers are parked; posts are still accepted
    Paused,
    /// Posts are rejected while buffered items are processed
    Draining,
    /// Workers have been joined
    Stopped,
}

impl WorkManagerStatus {
    fn accepts_posts(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    fn keeps_workers(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Draining)
    }
}

/// Work manager errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Deferred executor error
    #[error("deferred executor error: {0}")]
    Deferred(#[from] DeferredError),

    /// Operation requires a started engine
    #[error("work manager is not running")]
    NotRunning,

    /// Posts are rejected while draining
    #[error("work manager is draining")]
    Draining,

    /// Too many items are waiting to be processed
    #[error("buffered item limit of {limit} reached")]
    BufferFull { limit: usize },

    /// Operation not allowed in the current status
    #[error("work manager is {0:?}")]
    InvalidState(WorkManagerStatus),

    /// Drain did not finish within the shutdown timeout
    #[error("drain timed out with {remaining} items still buffered")]
    DrainTimeout { remaining: usize },
}

/// A worker whose loop ended with an error
#[derive(Debug, Clone, Serialize)]
pub struct WorkerFailure {
    pub worker_id: WorkerId,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Adaptive worker pool over a dynamic set of queues
///
/// # Example
///
/// ```ignore
/// use queueflow_engine::prelude::*;
///
/// let store = Arc::new(InMemoryQueueStore::new());
/// let factory = Arc::new(|_queue: &str| {
///     handler_fn(|item: WorkItem| async move {
///         println!("{}", item.payload);
///         Ok(None)
///     })
/// });
///
/// let manager = WorkManager::new(store, factory, EngineConfig::default())?;
/// manager.start().await?;
/// manager.post_work_item(WorkItem::new("orders", json!({"id": 1}))).await?;
///
/// // ... later
/// manager.drain_and_stop().await?;
/// ```
#[derive(Clone)]
pub struct WorkManager {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: Arc<EngineConfig>,
    store: Arc<dyn QueueStore>,
    tracker: Arc<QueueTracker>,
    handlers: Arc<HandlerResolver>,
    deferred: DeferredExecutor,
    hooks: Arc<dyn PoolHooks>,
    sink: Arc<dyn MessageSink>,
    workers: tokio::sync::Mutex<Vec<Worker>>,
    live_workers: Arc<AtomicUsize>,
    buffered: Arc<AtomicUsize>,
    counters: Arc<EngineCounters>,
    status: RwLock<WorkManagerStatus>,
    failures: Mutex<Vec<WorkerFailure>>,
    health_stop: watch::Sender<bool>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkManager {
    /// Create a work manager that traces lifecycle messages through `tracing`
    pub fn new(
        store: Arc<dyn QueueStore>,
        factory: Arc<dyn HandlerFactory>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        Self::with_sink(store, factory, config, Arc::new(TracingSink))
    }

    /// Create a work manager with a custom message sink
    pub fn with_sink(
        store: Arc<dyn QueueStore>,
        factory: Arc<dyn HandlerFactory>,
        config: EngineConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let handlers = Arc::new(HandlerResolver::new(config.handler_mode, factory));
        let tracker = Arc::new(QueueTracker::new());
        let deferred = DeferredExecutor::new();
        let counters = Arc::new(EngineCounters::default());
        let (health_stop, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| PoolInner {
            config: Arc::new(config),
            store,
            tracker: Arc::clone(&tracker),
            handlers,
            deferred: deferred.clone(),
            hooks: Arc::new(DeferredHooks {
                pool: weak.clone(),
                deferred,
                tracker,
                counters: Arc::clone(&counters),
            }),
            sink,
            workers: tokio::sync::Mutex::new(Vec::new()),
            live_workers: Arc::new(AtomicUsize::new(0)),
            buffered: Arc::new(AtomicUsize::new(0)),
            counters,
            status: RwLock::new(WorkManagerStatus::New),
            failures: Mutex::new(Vec::new()),
            health_stop,
            health_handle: Mutex::new(None),
        });

        Ok(Self { inner })
    }

    /// Start processing
    ///
    /// Queues already present in the store are registered, the buffered
    /// counter is seeded with their committed lengths, and the pool is grown
    /// to its desired size.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let current = *inner.status.read();
        if current != WorkManagerStatus::New {
            return Err(EngineError::InvalidState(current));
        }

        // Read everything before touching shared state so a failed start
        // leaves the manager untouched and startable again.
        let mut existing = Vec::new();
        for queue in inner.store.list_queues().await? {
            let len = inner.store.length(&queue).await?;
            existing.push((queue, len));
        }

        let mut restored = 0usize;
        {
            let mut status = inner.status.write();
            if *status != WorkManagerStatus::New {
                return Err(EngineError::InvalidState(*status));
            }
            for (queue, len) in &existing {
                inner.tracker.register_queue(queue);
                restored += len;
            }
            inner.buffered.fetch_add(restored, Ordering::AcqRel);
            *status = WorkManagerStatus::Running;
        }

        info!(
            queues = inner.tracker.queue_count(),
            restored_items = restored,
            min_workers = inner.config.min_workers,
            max_workers = inner.config.max_workers,
            "Starting work manager"
        );

        inner.deferred.start();
        inner.hooks.schedule_grow();
        inner.deferred.flush().await?;
        inner.start_health_ticker();

        inner
            .sink
            .trace(&format!("work manager started with {} workers", self.worker_count().await));
        Ok(())
    }

    /// Stop all workers and wait for them to finish
    ///
    /// Transactions that already dequeued an item run to completion. Errors
    /// of workers that failed are logged and kept in
    /// [`worker_failures`](Self::worker_failures).
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        {
            let mut status = inner.status.write();
            match *status {
                WorkManagerStatus::Stopped => return Ok(()),
                WorkManagerStatus::New => {
                    *status = WorkManagerStatus::Stopped;
                    return Ok(());
                }
                _ => *status = WorkManagerStatus::Stopped,
            }
        }

        info!("Stopping work manager");

        let _ = inner.health_stop.send(true);
        let health = inner.health_handle.lock().take();
        if let Some(handle) = health {
            let _ = handle.await;
        }

        // Let any in-flight resize finish before taking the workers away.
        if let Err(e) = inner.deferred.flush().await {
            debug!(error = %e, "deferred executor already closed");
        }

        let workers = std::mem::take(&mut *inner.workers.lock().await);
        inner.live_workers.store(0, Ordering::Release);
        for worker in &workers {
            worker.signal_stop();
        }
        for worker in workers {
            inner.finish_worker(worker).await;
        }

        inner.deferred.shutdown().await?;

        let failures = inner.failures.lock().len();
        if failures > 0 {
            warn!(failures, "work manager stopped with failed workers");
        }
        inner.sink.trace("work manager stopped");
        info!("Work manager stopped");
        Ok(())
    }

    /// Park every worker after its current transaction
    pub async fn pause(&self) -> Result<(), EngineError> {
        {
            let mut status = self.inner.status.write();
            match *status {
                WorkManagerStatus::Running => *status = WorkManagerStatus::Paused,
                WorkManagerStatus::Paused => return Ok(()),
                other => return Err(EngineError::InvalidState(other)),
            }
        }
        for worker in self.inner.workers.lock().await.iter() {
            worker.pause();
        }
        self.inner.sink.trace("work manager paused");
        Ok(())
    }

    /// Resume parked workers
    pub async fn resume(&self) -> Result<(), EngineError> {
        {
            let mut status = self.inner.status.write();
            match *status {
                WorkManagerStatus::Paused => *status = WorkManagerStatus::Running,
                WorkManagerStatus::Running => return Ok(()),
                other => return Err(EngineError::InvalidState(other)),
            }
        }
        for worker in self.inner.workers.lock().await.iter() {
            worker.resume();
        }
        self.inner.sink.trace("work manager resumed");
        Ok(())
    }

    /// Stop accepting posts, wait for buffered items to be processed, then stop
    ///
    /// Waits at most `shutdown_timeout`; the engine is stopped either way.
    #[instrument(skip(self))]
    pub async fn drain_and_stop(&self) -> Result<(), EngineError> {
        let previous = {
            let mut status = self.inner.status.write();
            let previous = *status;
            if previous.accepts_posts() {
                *status = WorkManagerStatus::Draining;
            }
            previous
        };

        match previous {
            WorkManagerStatus::New | WorkManagerStatus::Stopped => return self.stop().await,
            WorkManagerStatus::Paused => {
                for worker in self.inner.workers.lock().await.iter() {
                    worker.resume();
                }
            }
            WorkManagerStatus::Running | WorkManagerStatus::Draining => {}
        }

        info!(buffered = self.buffered_items(), "Draining work manager");

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_timeout;
        let mut remaining = self.buffered_items();
        while remaining > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "Drain timeout reached");
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            remaining = self.buffered_items();
        }

        self.stop().await?;

        if remaining > 0 {
            return Err(EngineError::DrainTimeout { remaining });
        }
        Ok(())
    }

    /// Post an item to the queue named by `item.queue`
    ///
    /// The item is committed in its own transaction. A queue seen for the
    /// first time is registered and may grow the pool.
    pub async fn post_work_item(&self, item: WorkItem) -> Result<(), EngineError> {
        let inner = &self.inner;
        match *inner.status.read() {
            status if status.accepts_posts() => {}
            WorkManagerStatus::Draining => return Err(EngineError::Draining),
            _ => return Err(EngineError::NotRunning),
        }

        let limit = inner.config.max_buffered_items;
        inner
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| EngineError::BufferFull { limit })?;

        let queue = item.queue.clone();
        if let Err(e) = inner.enqueue_committed(&queue, item).await {
            inner.buffered.fetch_sub(1, Ordering::AcqRel);
            return Err(e.into());
        }

        if inner.tracker.register_queue(&queue) {
            debug!(queue = %queue, "new queue registered");
            inner.sink.trace(&format!("queue {queue} registered"));
            inner.hooks.schedule_grow();
        }
        Ok(())
    }

    /// Grow the pool toward its desired size
    ///
    /// Normally invoked through the deferred executor. Returns the number of
    /// workers started.
    pub async fn try_increase_workers(&self) -> Result<usize, EngineError> {
        self.inner.try_increase_workers().await
    }

    /// Shrink the pool toward its desired size
    ///
    /// Normally invoked through the deferred executor. Returns the number of
    /// workers stopped.
    pub async fn try_decrease_workers(&self) -> Result<usize, EngineError> {
        self.inner.try_decrease_workers().await
    }

    /// Handler serving `queue` under the configured mode
    pub fn handler_for_queue(&self, queue: &str) -> Arc<dyn WorkItemHandler> {
        self.inner.handlers.resolve(queue)
    }

    /// Evict the cached handler for `queue`
    pub fn remove_handler_for_queue(&self, queue: &str) -> bool {
        self.inner.handlers.evict(queue)
    }

    /// Wait for every deferred task submitted so far
    pub async fn flush_deferred(&self) -> Result<(), EngineError> {
        Ok(self.inner.deferred.flush().await?)
    }

    pub fn status(&self) -> WorkManagerStatus {
        *self.inner.status.read()
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.workers.lock().await.len()
    }

    pub fn queue_count(&self) -> usize {
        self.inner.tracker.queue_count()
    }

    /// Items committed by posts or follow-ups and not yet processed
    pub fn buffered_items(&self) -> usize {
        self.inner.buffered.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.counters.snapshot()
    }

    pub fn worker_failures(&self) -> Vec<WorkerFailure> {
        self.inner.failures.lock().clone()
    }

    pub fn tracker(&self) -> &QueueTracker {
        &self.inner.tracker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl PoolInner {
    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            store: Arc::clone(&self.store),
            tracker: Arc::clone(&self.tracker),
            handlers: Arc::clone(&self.handlers),
            hooks: Arc::clone(&self.hooks),
            config: Arc::clone(&self.config),
            live_workers: Arc::clone(&self.live_workers),
            buffered: Arc::clone(&self.buffered),
            counters: Arc::clone(&self.counters),
        }
    }

    async fn enqueue_committed(&self, queue: &str, item: WorkItem) -> Result<(), StoreError> {
        let mut tx = self.store.begin_transaction().await?;
        tx.enqueue(queue, item).await?;
        tx.commit().await
    }

    fn desired(&self) -> usize {
        desired_workers(
            self.tracker.queue_count(),
            self.config.min_workers,
            self.config.max_workers,
        )
    }

    async fn try_increase_workers(&self) -> Result<usize, EngineError> {
        let status = *self.status.read();
        if !status.keeps_workers() {
            return Ok(0);
        }

        let mut workers = self.workers.lock().await;
        self.reap_finished(&mut workers).await;

        let desired = self.desired();
        let paused = status == WorkManagerStatus::Paused;
        let mut started = 0;
        while workers.len() < desired {
            let worker = Worker::spawn(self.worker_context(), paused);
            debug!(worker_id = %worker.id(), "worker spawned");
            workers.push(worker);
            started += 1;
        }
        self.live_workers.store(workers.len(), Ordering::Release);
        drop(workers);

        if started > 0 {
            self.counters
                .workers_started
                .fetch_add(started as u64, Ordering::Relaxed);
            self.sink
                .trace(&format!("started {started} workers (desired {desired})"));
        }
        Ok(started)
    }

    async fn try_decrease_workers(&self) -> Result<usize, EngineError> {
        if !self.status.read().keeps_workers() {
            return Ok(0);
        }

        let mut workers = self.workers.lock().await;
        self.reap_finished(&mut workers).await;

        let desired = self.desired();
        if workers.len() <= desired {
            self.live_workers.store(workers.len(), Ordering::Release);
            return Ok(0);
        }

        let excess = workers.len() - desired;
        let mut victims = Vec::with_capacity(excess);
        for _ in 0..excess {
            // Prefer workers that are not in the middle of a queue visit.
            let idx = workers
                .iter()
                .position(|w| !w.holds_lease())
                .unwrap_or(workers.len() - 1);
            victims.push(workers.swap_remove(idx));
        }
        self.live_workers.store(workers.len(), Ordering::Release);
        drop(workers);

        for victim in &victims {
            victim.signal_stop();
        }
        let stopped = victims.len();
        for victim in victims {
            self.finish_worker(victim).await;
        }

        self.sink
            .trace(&format!("stopped {stopped} workers (desired {desired})"));
        Ok(stopped)
    }

    /// Reap dead workers and top the pool back up
    async fn rebalance(&self) -> Result<(), EngineError> {
        self.try_increase_workers().await?;
        self.try_decrease_workers().await?;
        Ok(())
    }

    /// Unregister a confirmed-empty queue and drop it from the store
    async fn retire_queue(&self, lease: QueueLease) -> Result<(), EngineError> {
        let queue = lease.queue;
        self.tracker.remove_queue(&queue);

        match self.store.remove_queue(&queue).await {
            Ok(true) => {
                self.handlers.evict(&queue);
                EngineCounters::incr(&self.counters.queues_retired);
                info!(queue = %queue, worker_id = %lease.worker_id, "queue retired");
                self.sink.trace(&format!("queue {queue} retired"));
                Ok(())
            }
            Ok(false) => {
                debug!(queue = %queue, "queue received work before retirement, keeping it");
                self.tracker.register_queue(&queue);
                Ok(())
            }
            Err(e) => {
                self.tracker.register_queue(&queue);
                Err(e.into())
            }
        }
    }

    async fn reap_finished(&self, workers: &mut Vec<Worker>) {
        let mut i = 0;
        while i < workers.len() {
            if workers[i].is_finished() {
                let worker = workers.swap_remove(i);
                self.finish_worker(worker).await;
            } else {
                i += 1;
            }
        }
    }

    /// Join a worker and record how it ended
    async fn finish_worker(&self, mut worker: Worker) {
        let worker_id = worker.id();
        match worker.join().await {
            Ok(()) => {
                EngineCounters::incr(&self.counters.workers_stopped);
            }
            Err(e) => {
                EngineCounters::incr(&self.counters.workers_failed);
                error!(worker_id = %worker_id, error = %e, "worker failed");
                self.sink
                    .trace(&format!("{worker_id} failed: {e}"));
                self.failures.lock().push(WorkerFailure {
                    worker_id,
                    error: e.to_string(),
                    at: Utc::now(),
                });
            }
        }
    }

    fn start_health_ticker(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let mut stop_rx = self.health_stop.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let task_pool = Arc::downgrade(&pool);
                        let submitted = pool.deferred.submit("rebalance", async move {
                            match task_pool.upgrade() {
                                Some(pool) => Ok(pool.rebalance().await?),
                                None => Ok(()),
                            }
                        });
                        if submitted.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        *self.health_handle.lock() = Some(handle);
    }
}

/// [`PoolHooks`] that route worker requests through the deferred executor
struct DeferredHooks {
    pool: Weak<PoolInner>,
    deferred: DeferredExecutor,
    tracker: Arc<QueueTracker>,
    counters: Arc<EngineCounters>,
}

impl PoolHooks for DeferredHooks {
    fn schedule_grow(&self) {
        EngineCounters::incr(&self.counters.grow_evaluations);
        let pool = self.pool.clone();
        let submitted = self.deferred.submit("grow", async move {
            if let Some(pool) = pool.upgrade() {
                pool.try_increase_workers().await?;
            }
            Ok(())
        });
        if let Err(e) = submitted {
            debug!(error = %e, "grow evaluation not scheduled");
        }
    }

    fn schedule_shrink(&self) {
        EngineCounters::incr(&self.counters.shrink_evaluations);
        let pool = self.pool.clone();
        let submitted = self.deferred.submit("shrink", async move {
            if let Some(pool) = pool.upgrade() {
                pool.try_decrease_workers().await?;
            }
            Ok(())
        });
        if let Err(e) = submitted {
            debug!(error = %e, "shrink evaluation not scheduled");
        }
    }

    fn schedule_retirement(&self, lease: QueueLease) {
        let pool = self.pool.clone();
        let queue = lease.queue.clone();
        let submitted = self.deferred.submit(format!("retire:{queue}"), async move {
            if let Some(pool) = pool.upgrade() {
                pool.retire_queue(lease).await?;
            }
            Ok(())
        });
        if let Err(e) = submitted {
            // Nobody will retire it; hand the queue back.
            debug!(queue = %queue, error = %e, "retirement not scheduled");
            self.tracker.release_queue(&queue, false);
        }
    }
}
