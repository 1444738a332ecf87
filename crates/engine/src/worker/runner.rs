//! Worker consumption loop and queue exit procedure

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::handler::{HandlerError, HandlerResolver};
use crate::stats::EngineCounters;
use crate::store::{QueueStore, StoreError};
use crate::tracker::{QueueLease, QueueTracker};

use super::scaling::dequeue_timeout;
use super::{WorkerId, WorkerState};

/// Fatal worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A handler rejected an item
    #[error("handler failed on queue {queue}: {source}")]
    Handler {
        queue: String,
        #[source]
        source: HandlerError,
    },

    /// The store failed with something other than lock contention
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The worker task panicked or was aborted
    #[error("worker task panicked: {0}")]
    Panicked(String),
}

/// Callbacks a worker uses to request pool and queue-set changes
///
/// Implementations must not block: the pool defers the actual work to its
/// [`DeferredExecutor`](crate::DeferredExecutor).
pub trait PoolHooks: Send + Sync {
    /// A new queue appeared; the pool may need to grow
    fn schedule_grow(&self);

    /// A worker found nothing to do or a queue went away; the pool may shrink
    fn schedule_shrink(&self);

    /// Retire a confirmed-empty queue. The lease is still held and is
    /// dropped together with the queue's registration.
    fn schedule_retirement(&self, lease: QueueLease);
}

/// Everything a worker shares with its pool
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn QueueStore>,
    pub tracker: Arc<QueueTracker>,
    pub handlers: Arc<HandlerResolver>,
    pub hooks: Arc<dyn PoolHooks>,
    pub config: Arc<EngineConfig>,
    /// Workers currently owned by the pool
    pub live_workers: Arc<AtomicUsize>,
    /// Items committed to the store and not yet processed
    pub buffered: Arc<AtomicUsize>,
    pub counters: Arc<EngineCounters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop,
}

/// Why a worker left a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitExit {
    /// Hit `yield_after` processed items; the queue likely has more
    Yielded,
    /// The dequeue wait expired with the queue empty
    Drained,
    /// Another transaction kept the queue locked for the whole wait
    Contended,
    /// Pause or stop was requested
    Interrupted,
    /// A handler or store failure ended the visit
    Failed,
}

/// Result of one visit to a leased queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitOutcome {
    pub processed: usize,
    pub exit: VisitExit,
}

impl VisitOutcome {
    fn new(processed: usize, exit: VisitExit) -> Self {
        Self { processed, exit }
    }

    /// Whether the visit stopped only because it yielded
    pub fn more_work(&self) -> bool {
        self.exit == VisitExit::Yielded
    }
}

enum Cycle {
    Processed,
    Empty,
    Contended,
    Interrupted,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    leased: Mutex<Option<String>>,
}

/// Handle to a worker running on its own tokio task
pub struct Worker {
    id: WorkerId,
    control: watch::Sender<Control>,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("leased", &self.leased_queue())
            .finish()
    }
}

impl Worker {
    /// Spawn a worker loop, optionally starting paused
    pub fn spawn(ctx: WorkerContext, paused: bool) -> Self {
        let id = WorkerId::new();
        let initial = if paused { Control::Pause } else { Control::Run };
        let (control, control_rx) = watch::channel(initial);
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState::Starting),
            leased: Mutex::new(None),
        });

        let worker_loop = WorkerLoop {
            id,
            ctx,
            control: control_rx,
            shared: Arc::clone(&shared),
        };
        let handle = tokio::spawn(worker_loop.run());

        Self {
            id,
            control,
            shared,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Queue this worker is visiting, if any
    pub fn leased_queue(&self) -> Option<String> {
        self.shared.leased.lock().clone()
    }

    pub fn holds_lease(&self) -> bool {
        self.shared.leased.lock().is_some()
    }

    /// Whether the loop has ended (or was already joined)
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Ask the worker to pause after its current transaction
    pub fn pause(&self) {
        self.set_control(Control::Pause);
    }

    pub fn resume(&self) {
        self.set_control(Control::Run);
    }

    /// Ask the worker to stop without waiting for it
    pub fn signal_stop(&self) {
        self.control.send_replace(Control::Stop);
        let mut state = self.shared.state.lock();
        if !state.is_terminal() {
            *state = WorkerState::Stopping;
        }
    }

    /// Wait for the loop to end and return its result
    pub async fn join(&mut self) -> Result<(), WorkerError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                *self.shared.state.lock() = WorkerState::Failed;
                Err(WorkerError::Panicked(e.to_string()))
            }
        }
    }

    /// Signal stop and wait for the loop to end
    pub async fn stop(mut self) -> Result<(), WorkerError> {
        self.signal_stop();
        self.join().await
    }

    fn set_control(&self, next: Control) {
        // A stopped worker is never revived.
        self.control.send_if_modified(|current| {
            if *current == Control::Stop || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

struct WorkerLoop {
    id: WorkerId,
    ctx: WorkerContext,
    control: watch::Receiver<Control>,
    shared: Arc<WorkerShared>,
}

impl WorkerLoop {
    async fn run(mut self) -> Result<(), WorkerError> {
        debug!(worker_id = %self.id, "worker started");

        let result = self.run_loop().await;
        match &result {
            Ok(()) => {
                self.set_state(WorkerState::Stopped);
                debug!(worker_id = %self.id, "worker stopped");
            }
            Err(e) => {
                self.set_state(WorkerState::Failed);
                error!(worker_id = %self.id, error = %e, "worker terminated");
            }
        }
        result
    }

    async fn run_loop(&mut self) -> Result<(), WorkerError> {
        loop {
            match self.control() {
                Control::Stop => return Ok(()),
                Control::Pause => {
                    self.set_state(WorkerState::Paused);
                    self.wait_while_paused().await;
                    continue;
                }
                Control::Run => self.set_state(WorkerState::Running),
            }

            let Some(lease) = self.ctx.tracker.lease_queue(self.id) else {
                self.exit_queue(None, &VisitOutcome::new(0, VisitExit::Drained))
                    .await;
                self.sleep_unless_signalled(self.ctx.config.no_queue_retry_interval)
                    .await;
                continue;
            };

            trace!(worker_id = %self.id, queue = %lease.queue, "queue leased");
            *self.shared.leased.lock() = Some(lease.queue.clone());

            let (outcome, failure) = self.visit(&lease).await;
            self.exit_queue(Some(&lease), &outcome).await;
            *self.shared.leased.lock() = None;

            if let Some(e) = failure {
                return Err(e);
            }
        }
    }

    /// Run up to `yield_after` transactional cycles on a leased queue
    async fn visit(&mut self, lease: &QueueLease) -> (VisitOutcome, Option<WorkerError>) {
        let config = Arc::clone(&self.ctx.config);
        let mut processed = 0;

        while processed < config.yield_after {
            if self.control() != Control::Run {
                return (VisitOutcome::new(processed, VisitExit::Interrupted), None);
            }

            let timeout = dequeue_timeout(
                self.ctx.tracker.queue_count(),
                self.ctx.live_workers.load(Ordering::Relaxed),
                config.short_dequeue_timeout,
                config.long_dequeue_timeout,
            );

            match self.cycle(&lease.queue, timeout).await {
                Ok(Cycle::Processed) => processed += 1,
                Ok(Cycle::Empty) => {
                    return (VisitOutcome::new(processed, VisitExit::Drained), None);
                }
                Ok(Cycle::Contended) => {
                    EngineCounters::incr(&self.ctx.counters.contention_timeouts);
                    debug!(worker_id = %self.id, queue = %lease.queue, "queue contended, leaving");
                    return (VisitOutcome::new(processed, VisitExit::Contended), None);
                }
                Ok(Cycle::Interrupted) => {
                    return (VisitOutcome::new(processed, VisitExit::Interrupted), None);
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        queue = %lease.queue,
                        error = %e,
                        "work cycle failed"
                    );
                    return (VisitOutcome::new(processed, VisitExit::Failed), Some(e));
                }
            }
        }

        (VisitOutcome::new(processed, VisitExit::Yielded), None)
    }

    /// One transaction: dequeue, handle, enqueue follow-up, commit
    async fn cycle(&mut self, queue: &str, timeout: Duration) -> Result<Cycle, WorkerError> {
        let mut tx = self.ctx.store.begin_transaction().await?;

        let dequeued = tokio::select! {
            biased;
            _ = interrupted(&mut self.control) => {
                // Nothing dequeued yet; dropping the transaction rolls it back.
                return Ok(Cycle::Interrupted);
            }
            result = tx.try_dequeue(queue, timeout) => result,
        };

        let item = match dequeued {
            Ok(Some(item)) => item,
            Ok(None) => {
                tx.abort().await?;
                return Ok(Cycle::Empty);
            }
            Err(e) if e.is_timeout() => return Ok(Cycle::Contended),
            Err(e) => return Err(e.into()),
        };

        let item_id = item.id;
        let handler = self.ctx.handlers.resolve(queue);
        let follow_up = handler
            .handle(item)
            .await
            .map_err(|source| WorkerError::Handler {
                queue: queue.to_string(),
                source,
            })?;

        let mut follow_up_queue = None;
        if let Some(next) = follow_up {
            let target = next.queue.clone();
            tx.enqueue(&target, next).await?;
            follow_up_queue = Some(target);
        }
        tx.commit().await?;

        decrement(&self.ctx.buffered);
        EngineCounters::incr(&self.ctx.counters.items_processed);

        if let Some(target) = follow_up_queue {
            self.ctx.buffered.fetch_add(1, Ordering::AcqRel);
            EngineCounters::incr(&self.ctx.counters.follow_ups_enqueued);
            if target != queue && self.ctx.tracker.register_queue(&target) {
                self.ctx.hooks.schedule_grow();
            }
        }

        trace!(worker_id = %self.id, queue, item_id = %item_id, "item processed");
        Ok(Cycle::Processed)
    }

    /// Decide what happens to a queue after a visit
    ///
    /// Called exactly once per loop iteration, with `None` when no queue
    /// could be leased.
    async fn exit_queue(&self, lease: Option<&QueueLease>, outcome: &VisitOutcome) {
        let tracker = &self.ctx.tracker;

        let Some(lease) = lease else {
            trace!(worker_id = %self.id, "no queue available");
            self.ctx.hooks.schedule_shrink();
            return;
        };
        let queue = lease.queue.as_str();

        // Emptiness was not observed, so suspicion is left as it is.
        if outcome.exit == VisitExit::Interrupted {
            tracker.release_queue(queue, false);
            return;
        }

        let non_empty = match self.ctx.store.length(queue).await {
            Ok(len) => len > 0,
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    queue,
                    error = %e,
                    "queue length lookup failed, assuming work remains"
                );
                true
            }
        };

        if outcome.more_work() || non_empty {
            tracker.release_queue(queue, true);
            return;
        }

        let now = Instant::now();
        if tracker.is_confirmed_empty(queue, now, self.ctx.config.retire_empty_queue_after) {
            debug!(
                worker_id = %self.id,
                queue,
                processed = outcome.processed,
                "queue confirmed empty, scheduling retirement"
            );
            tracker.clear_suspicion(queue);
            self.ctx.hooks.schedule_retirement(lease.clone());
            self.ctx.hooks.schedule_shrink();
        } else {
            tracker.mark_suspected_empty(queue, now);
            tracker.release_queue(queue, false);
        }
    }

    fn control(&self) -> Control {
        // A dropped handle means nobody can stop us later.
        if self.control.has_changed().is_err() {
            return Control::Stop;
        }
        *self.control.borrow()
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.shared.state.lock();
        if *state == WorkerState::Stopping && !next.is_terminal() {
            return;
        }
        *state = next;
    }

    async fn wait_while_paused(&mut self) {
        let poll = self.ctx.config.pause_poll_interval;
        while self.control() == Control::Pause {
            if let Ok(Err(_)) = tokio::time::timeout(poll, self.control.changed()).await {
                return;
            }
        }
    }

    async fn sleep_unless_signalled(&mut self, duration: Duration) {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return,
                changed = self.control.changed() => {
                    if changed.is_err() || *self.control.borrow() != Control::Run {
                        return;
                    }
                }
            }
        }
    }
}

/// Resolves once the control channel leaves `Run` or its sender is dropped
async fn interrupted(control: &mut watch::Receiver<Control>) {
    loop {
        if *control.borrow_and_update() != Control::Run {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, HandlerMode, WorkItemHandler};
    use crate::store::{InMemoryQueueStore, StoreTransaction, WorkItem};
    use serde_json::json;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct RecordingHooks {
        grows: AtomicU64,
        shrinks: AtomicU64,
        retirements: Mutex<Vec<QueueLease>>,
    }

    impl PoolHooks for RecordingHooks {
        fn schedule_grow(&self) {
            self.grows.fetch_add(1, Ordering::SeqCst);
        }

        fn schedule_shrink(&self) {
            self.shrinks.fetch_add(1, Ordering::SeqCst);
        }

        fn schedule_retirement(&self, lease: QueueLease) {
            self.retirements.lock().push(lease);
        }
    }

    struct Harness {
        store: InMemoryQueueStore,
        ctx: WorkerContext,
        hooks: Arc<RecordingHooks>,
    }

    fn harness(config: EngineConfig, handler: Arc<dyn WorkItemHandler>) -> Harness {
        let store = InMemoryQueueStore::new();
        let hooks = Arc::new(RecordingHooks::default());
        let factory = Arc::new(move |_queue: &str| Arc::clone(&handler));
        let ctx = WorkerContext {
            store: Arc::new(store.clone()),
            tracker: Arc::new(QueueTracker::new()),
            handlers: Arc::new(HandlerResolver::new(HandlerMode::Singleton, factory)),
            hooks: hooks.clone(),
            config: Arc::new(config),
            live_workers: Arc::new(AtomicUsize::new(1)),
            buffered: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(EngineCounters::default()),
        };
        Harness { store, ctx, hooks }
    }

    fn noop_handler() -> Arc<dyn WorkItemHandler> {
        handler_fn(|_item: WorkItem| async { Ok(None) })
    }

    fn worker_loop(ctx: &WorkerContext) -> (watch::Sender<Control>, WorkerLoop) {
        let (control, control_rx) = watch::channel(Control::Run);
        let worker_loop = WorkerLoop {
            id: WorkerId::new(),
            ctx: ctx.clone(),
            control: control_rx,
            shared: Arc::new(WorkerShared {
                state: Mutex::new(WorkerState::Starting),
                leased: Mutex::new(None),
            }),
        };
        (control, worker_loop)
    }

    async fn seed(h: &Harness, queue: &str, count: usize) {
        let mut tx = h.ctx.store.begin_transaction().await.unwrap();
        for i in 0..count {
            tx.enqueue(queue, WorkItem::new(queue, json!({ "i": i })))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
        h.ctx.tracker.register_queue(queue);
        h.ctx.buffered.fetch_add(count, Ordering::SeqCst);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visit_stops_at_yield_after() {
        let h = harness(EngineConfig::new().with_yield_after(10), noop_handler());
        seed(&h, "q1", 25).await;

        let (_control, mut worker) = worker_loop(&h.ctx);
        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        let (outcome, failure) = worker.visit(&lease).await;

        assert!(failure.is_none());
        assert_eq!(outcome, VisitOutcome::new(10, VisitExit::Yielded));
        assert!(outcome.more_work());
        assert_eq!(h.store.peek("q1").len(), 15);
        assert_eq!(h.ctx.buffered.load(Ordering::SeqCst), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visit_drains_short_queue() {
        let h = harness(EngineConfig::new().with_yield_after(10), noop_handler());
        seed(&h, "q1", 3).await;

        let (_control, mut worker) = worker_loop(&h.ctx);
        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        let (outcome, _) = worker.visit(&lease).await;

        assert_eq!(outcome, VisitOutcome::new(3, VisitExit::Drained));
        assert_eq!(
            h.ctx.counters.snapshot().items_processed,
            3,
            "every dequeued item should be counted"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_committed_with_dequeue() {
        let relay = handler_fn(|item: WorkItem| async move {
            if item.hops < 2 {
                Ok(Some(item.follow_up(json!("again"))))
            } else {
                Ok(None)
            }
        });
        let h = harness(EngineConfig::new().with_yield_after(10), relay);
        seed(&h, "q1", 1).await;

        let (_control, mut worker) = worker_loop(&h.ctx);
        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        let (outcome, _) = worker.visit(&lease).await;

        assert_eq!(outcome.processed, 3);
        assert_eq!(h.ctx.counters.snapshot().follow_ups_enqueued, 2);
        assert_eq!(h.ctx.buffered.load(Ordering::SeqCst), 0);
        assert!(h.store.peek("q1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_to_new_queue_schedules_grow() {
        let router = handler_fn(|item: WorkItem| async move {
            if item.queue == "inbox" {
                Ok(Some(WorkItem::new("outbox", item.payload)))
            } else {
                Ok(None)
            }
        });
        let h = harness(EngineConfig::new(), router);
        seed(&h, "inbox", 1).await;

        let (_control, mut worker) = worker_loop(&h.ctx);
        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        assert_eq!(lease.queue, "inbox");
        worker.visit(&lease).await;

        assert!(h.ctx.tracker.contains("outbox"));
        assert_eq!(h.store.peek("outbox").len(), 1);
        assert_eq!(h.hooks.grows.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_failure_rolls_back_item() {
        let failing = handler_fn(|_item: WorkItem| async {
            Err(HandlerError::Failed("bad input".into()))
        });
        let h = harness(EngineConfig::new(), failing);
        seed(&h, "q1", 2).await;

        let (_control, mut worker) = worker_loop(&h.ctx);
        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        let (outcome, failure) = worker.visit(&lease).await;

        assert_eq!(outcome.exit, VisitExit::Failed);
        assert!(matches!(failure, Some(WorkerError::Handler { .. })));
        assert_eq!(h.store.peek("q1").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_marks_suspected_then_schedules_retirement() {
        let delay = Duration::from_secs(60);
        let h = harness(
            EngineConfig::new().with_retire_empty_queue_after(delay),
            noop_handler(),
        );
        h.ctx.tracker.register_queue("q1");
        let (_control, worker) = worker_loop(&h.ctx);
        let drained = VisitOutcome::new(0, VisitExit::Drained);

        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        let first_seen = Instant::now();
        worker.exit_queue(Some(&lease), &drained).await;
        assert_eq!(h.ctx.tracker.suspected_since("q1"), Some(first_seen));
        assert_eq!(h.ctx.tracker.lease_holder("q1"), None);

        tokio::time::advance(delay / 2).await;
        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        worker.exit_queue(Some(&lease), &drained).await;
        assert_eq!(h.ctx.tracker.suspected_since("q1"), Some(first_seen));
        assert!(h.hooks.retirements.lock().is_empty());

        tokio::time::advance(delay / 2).await;
        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        worker.exit_queue(Some(&lease), &drained).await;

        assert_eq!(h.hooks.retirements.lock().as_slice(), &[lease.clone()]);
        assert_eq!(h.ctx.tracker.lease_holder("q1"), Some(worker.id));
        assert!(h.ctx.tracker.suspected_since("q1").is_none());
        assert_eq!(h.hooks.shrinks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_with_work_clears_suspicion() {
        let h = harness(EngineConfig::new(), noop_handler());
        seed(&h, "q1", 1).await;
        h.ctx.tracker.mark_suspected_empty("q1", Instant::now());

        let (_control, worker) = worker_loop(&h.ctx);
        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        worker
            .exit_queue(Some(&lease), &VisitOutcome::new(0, VisitExit::Contended))
            .await;

        assert!(h.ctx.tracker.suspected_since("q1").is_none());
        assert_eq!(h.ctx.tracker.lease_holder("q1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_queue_schedules_shrink_on_every_attempt() {
        let config = EngineConfig::new().with_no_queue_retry_interval(Duration::from_secs(1));
        let h = harness(config, noop_handler());
        h.ctx.live_workers.store(2, Ordering::SeqCst);

        let a = Worker::spawn(h.ctx.clone(), false);
        let b = Worker::spawn(h.ctx.clone(), false);

        tokio::time::sleep(Duration::from_millis(3500)).await;

        // Both workers retry at 0s, 1s, 2s and 3s.
        assert_eq!(h.hooks.shrinks.load(Ordering::SeqCst), 8);
        assert!(!a.holds_lease() && !b.holds_lease());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_long_dequeue_wait() {
        let config = EngineConfig::new()
            .with_dequeue_timeouts(Duration::from_secs(600), Duration::from_secs(600));
        let h = harness(config, noop_handler());
        h.ctx.tracker.register_queue("q1");

        let worker = Worker::spawn(h.ctx.clone(), false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(worker.leased_queue().as_deref(), Some("q1"));

        let started = Instant::now();
        worker.stop().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.ctx.tracker.lease_holder("q1"), None);
        assert!(h.ctx.tracker.suspected_since("q1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_worker_does_not_lease() {
        let h = harness(EngineConfig::new(), noop_handler());
        seed(&h, "q1", 1).await;

        let mut worker = Worker::spawn(h.ctx.clone(), true);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(worker.state(), WorkerState::Paused);
        assert_eq!(h.store.peek("q1").len(), 1);

        worker.resume();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.store.peek("q1").is_empty());

        worker.signal_stop();
        worker.join().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_worker_releases_lease_and_reports() {
        let failing = handler_fn(|_item: WorkItem| async {
            Err(HandlerError::Failed("poison".into()))
        });
        let h = harness(EngineConfig::new(), failing);
        seed(&h, "q1", 1).await;

        let mut worker = Worker::spawn(h.ctx.clone(), false);
        let result = worker.join().await;

        assert!(matches!(result, Err(WorkerError::Handler { .. })));
        assert_eq!(worker.state(), WorkerState::Failed);
        assert_eq!(h.ctx.tracker.lease_holder("q1"), None);
        assert_eq!(h.store.peek("q1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_queue_ends_visit_as_contended() {
        let config = EngineConfig::new()
            .with_dequeue_timeouts(Duration::from_millis(50), Duration::from_millis(50));
        let h = harness(config, noop_handler());
        seed(&h, "q1", 2).await;

        // Another transaction holds the queue lock for the whole visit.
        let mut holder = h.store.begin_transaction().await.unwrap();
        holder
            .try_dequeue("q1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        let (_control, mut worker) = worker_loop(&h.ctx);
        let lease = h.ctx.tracker.lease_queue(worker.id).unwrap();
        let (outcome, failure) = worker.visit(&lease).await;

        assert!(failure.is_none());
        assert_eq!(outcome, VisitOutcome::new(0, VisitExit::Contended));
        assert_eq!(h.ctx.counters.snapshot().contention_timeouts, 1);

        worker.exit_queue(Some(&lease), &outcome).await;
        assert_eq!(h.ctx.tracker.lease_holder("q1"), None);
        assert!(h.ctx.tracker.suspected_since("q1").is_none());

        holder.abort().await.unwrap();
        assert_eq!(h.store.peek("q1").len(), 2);
    }

    /// Store whose transactions fail every dequeue with a backend error
    struct BrokenStore;

    struct BrokenTransaction;

    #[async_trait::async_trait]
    impl StoreTransaction for BrokenTransaction {
        async fn try_dequeue(
            &mut self,
            _queue: &str,
            _timeout: Duration,
        ) -> Result<Option<WorkItem>, StoreError> {
            Err(StoreError::Backend("disk gone".into()))
        }

        async fn enqueue(&mut self, _queue: &str, _item: WorkItem) -> Result<(), StoreError> {
            Ok(())
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            Ok(())
        }

        async fn abort(self: Box<Self>) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl QueueStore for BrokenStore {
        async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
            Ok(Box::new(BrokenTransaction))
        }

        async fn length(&self, _queue: &str) -> Result<usize, StoreError> {
            Ok(1)
        }

        async fn remove_queue(&self, _queue: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn list_queues(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_error_is_fatal_and_releases_lease() {
        let mut h = harness(EngineConfig::new(), noop_handler());
        h.ctx.store = Arc::new(BrokenStore);
        h.ctx.tracker.register_queue("q1");

        let mut worker = Worker::spawn(h.ctx.clone(), false);
        let result = worker.join().await;

        assert!(matches!(
            result,
            Err(WorkerError::Store(StoreError::Backend(_)))
        ));
        assert_eq!(worker.state(), WorkerState::Failed);
        assert_eq!(h.ctx.tracker.lease_holder("q1"), None);
        assert!(h.ctx.tracker.contains("q1"));
        assert_eq!(h.ctx.counters.snapshot().contention_timeouts, 0);
    }
}
