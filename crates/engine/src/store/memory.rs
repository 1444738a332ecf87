//! In-memory implementation of QueueStore

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::item::WorkItem;
use super::store::{QueueStore, StoreError, StoreTransaction};

/// Internal queue state
#[derive(Default)]
struct QueueState {
    items: VecDeque<WorkItem>,
    /// Transaction holding the dequeue lock
    locked_by: Option<u64>,
}

struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    /// Signalled on every commit, rollback and removal
    changed: Notify,
    next_tx_id: AtomicU64,
}

/// In-memory implementation of QueueStore
///
/// Provides the same transactional semantics a durable backend must offer:
/// a dequeue takes an exclusive lock on its queue until the transaction ends,
/// enqueues are staged until commit, and a rolled-back transaction puts its
/// dequeued items back at the head of their queues. Nothing survives a
/// process restart.
///
/// # Example
///
/// ```
/// use queueflow_engine::InMemoryQueueStore;
///
/// let store = InMemoryQueueStore::new();
/// assert_eq!(store.queue_count(), 0);
/// ```
#[derive(Clone)]
pub struct InMemoryQueueStore {
    shared: Arc<Shared>,
}

impl InMemoryQueueStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                changed: Notify::new(),
                next_tx_id: AtomicU64::new(1),
            }),
        }
    }

    /// Get the number of queues
    pub fn queue_count(&self) -> usize {
        self.shared.queues.lock().len()
    }

    /// Get the number of committed items across all queues
    pub fn total_items(&self) -> usize {
        self.shared
            .queues
            .lock()
            .values()
            .map(|q| q.items.len())
            .sum()
    }

    /// Snapshot the committed items of a queue, head first
    pub fn peek(&self, queue: &str) -> Vec<WorkItem> {
        self.shared
            .queues
            .lock()
            .get(queue)
            .map(|q| q.items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the queue exists
    pub fn contains(&self, queue: &str) -> bool {
        self.shared.queues.lock().contains_key(queue)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.shared.queues.lock().clear();
        self.shared.changed.notify_waiters();
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let id = self.shared.next_tx_id.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            id,
            shared: Arc::clone(&self.shared),
            dequeued: vec![],
            staged: vec![],
            locked: HashSet::new(),
            open: true,
        }))
    }

    async fn length(&self, queue: &str) -> Result<usize, StoreError> {
        Ok(self
            .shared
            .queues
            .lock()
            .get(queue)
            .map(|q| q.items.len())
            .unwrap_or(0))
    }

    async fn remove_queue(&self, queue: &str) -> Result<bool, StoreError> {
        let mut queues = self.shared.queues.lock();
        let removable = match queues.get(queue) {
            None => return Ok(true),
            Some(state) => state.items.is_empty() && state.locked_by.is_none(),
        };

        if removable {
            queues.remove(queue);
            drop(queues);
            self.shared.changed.notify_waiters();
        }
        Ok(removable)
    }

    async fn list_queues(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.shared.queues.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Transaction over the in-memory store
struct MemoryTransaction {
    id: u64,
    shared: Arc<Shared>,
    /// Items taken from queues, in dequeue order
    dequeued: Vec<(String, WorkItem)>,
    /// Items to append on commit
    staged: Vec<(String, WorkItem)>,
    /// Queues whose dequeue lock this transaction holds
    locked: HashSet<String>,
    open: bool,
}

/// Outcome of one locked inspection of a queue
enum Attempt {
    Item(WorkItem),
    Empty,
    Locked,
}

impl MemoryTransaction {
    fn attempt_dequeue(&mut self, queue: &str) -> Attempt {
        let mut queues = self.shared.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Attempt::Empty;
        };

        match state.locked_by {
            Some(holder) if holder != self.id => Attempt::Locked,
            _ => match state.items.pop_front() {
                Some(item) => {
                    state.locked_by = Some(self.id);
                    self.locked.insert(queue.to_string());
                    self.dequeued.push((queue.to_string(), item.clone()));
                    Attempt::Item(item)
                }
                None => Attempt::Empty,
            },
        }
    }

    fn release_locks(&mut self, queues: &mut HashMap<String, QueueState>) {
        for name in self.locked.drain() {
            if let Some(state) = queues.get_mut(&name) {
                if state.locked_by == Some(self.id) {
                    state.locked_by = None;
                }
            }
        }
    }

    fn rollback(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let shared = Arc::clone(&self.shared);
        let mut queues = shared.queues.lock();
        for (name, item) in self.dequeued.drain(..).rev() {
            queues.entry(name).or_default().items.push_front(item);
        }
        self.staged.clear();
        self.release_locks(&mut queues);
        drop(queues);

        shared.changed.notify_waiters();
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn try_dequeue(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, StoreError> {
        if !self.open {
            return Err(StoreError::TransactionClosed);
        }

        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);

        loop {
            // Register for wakeups before inspecting so a commit between the
            // inspection and the wait is not missed.
            let notified = shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let locked = match self.attempt_dequeue(queue) {
                Attempt::Item(item) => return Ok(Some(item)),
                Attempt::Empty => false,
                Attempt::Locked => true,
            };

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return if locked {
                    Err(StoreError::Timeout(timeout, queue.to_string()))
                } else {
                    Ok(None)
                };
            }
        }
    }

    async fn enqueue(&mut self, queue: &str, item: WorkItem) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::TransactionClosed);
        }
        self.staged.push((queue.to_string(), item));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::TransactionClosed);
        }
        self.open = false;

        let shared = Arc::clone(&self.shared);
        let mut queues = shared.queues.lock();
        for (name, item) in self.staged.drain(..) {
            queues.entry(name).or_default().items.push_back(item);
        }
        self.dequeued.clear();
        self.release_locks(&mut queues);
        drop(queues);

        shared.changed.notify_waiters();
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<(), StoreError> {
        self.rollback();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.rollback();
    }
}
