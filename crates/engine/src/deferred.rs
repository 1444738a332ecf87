//! Deferred task execution
//!
//! Pool resizing and queue retirement must not run on a worker's hot path,
//! and must not race each other. Workers submit them to a
//! [`DeferredExecutor`], which runs them one at a time in submission order on
//! a dedicated tokio task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// A boxed deferred task
pub type DeferredTask = BoxFuture<'static, anyhow::Result<()>>;

/// Errors from the deferred executor
#[derive(Debug, thiserror::Error)]
pub enum DeferredError {
    /// The executor has been shut down
    #[error("deferred executor is closed")]
    Closed,

    /// The runner task has not been started
    #[error("deferred executor is not running")]
    NotRunning,

    /// The runner task panicked outside of a task
    #[error("deferred executor runner failed: {0}")]
    RunnerFailed(String),
}

enum Command {
    Run { name: String, task: DeferredTask },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Serialized background task runner
///
/// Cheap to clone; every clone feeds the same runner. Tasks are accepted
/// before [`start`](Self::start) and run once the runner is spawned.
///
/// A task must not await [`flush`](Self::flush) on its own executor, since
/// the flush marker is queued behind the task itself.
#[derive(Clone)]
pub struct DeferredExecutor {
    tx: mpsc::UnboundedSender<Command>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Command>>>>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for DeferredExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredExecutor")
            .field("submitted", &self.submitted())
            .field("completed", &self.completed())
            .field("failed", &self.failed())
            .finish()
    }
}

impl Default for DeferredExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredExecutor {
    /// Create an executor whose runner is not yet spawned
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            handle: Arc::new(Mutex::new(None)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Spawn the runner task
    ///
    /// Must be called from within a tokio runtime. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let counters = Arc::clone(&self.counters);
        let handle = tokio::spawn(run(rx, counters));
        *self.handle.lock() = Some(handle);
    }

    /// Whether the runner has been spawned and has not exited
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Queue a named task for execution
    pub fn submit<F>(&self, name: impl Into<String>, task: F) -> Result<(), DeferredError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        trace!(task = %name, "deferred task submitted");
        self.tx
            .send(Command::Run {
                name,
                task: task.boxed(),
            })
            .map_err(|_| DeferredError::Closed)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait until every task submitted before this call has finished
    pub async fn flush(&self) -> Result<(), DeferredError> {
        if self.handle.lock().is_none() {
            return Err(DeferredError::NotRunning);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|_| DeferredError::Closed)?;
        done_rx.await.map_err(|_| DeferredError::Closed)
    }

    /// Run the remaining queued tasks, then stop the runner
    ///
    /// Tasks submitted after the shutdown request are not run; they are
    /// logged and counted in [`dropped`](Self::dropped). Submissions made
    /// after the runner has stopped fail with [`DeferredError::Closed`].
    pub async fn shutdown(&self) -> Result<(), DeferredError> {
        // Ignore the send error: the runner is already gone.
        let _ = self.tx.send(Command::Shutdown);

        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| DeferredError::RunnerFailed(e.to_string())),
            None => {
                // Never started: drop the receiver so later submits fail.
                self.rx.lock().take();
                Ok(())
            }
        }
    }

    /// Total tasks accepted
    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::Relaxed)
    }

    /// Tasks that ran to `Ok`
    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Tasks that returned `Err` or panicked
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Tasks accepted behind a shutdown request and never run
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, counters: Arc<Counters>) {
    debug!("deferred executor started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Run { name, task } => {
                trace!(task = %name, "running deferred task");
                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(())) => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(task = %name, error = %e, "deferred task failed");
                    }
                    Err(panic) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(task = %name, panic = %panic_message(&*panic), "deferred task panicked");
                    }
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => break,
        }
    }

    // Reject new submissions, then account for what was queued behind the
    // shutdown marker.
    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let Command::Run { name, .. } = command {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(task = %name, "deferred task dropped at shutdown");
        }
    }
    debug!("deferred executor stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
