//! QueueStore trait definition

use std::time::Duration;

use async_trait::async_trait;

use super::item::WorkItem;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The queue is locked by another transaction and the wait timed out.
    ///
    /// Distinct from an empty queue, which is reported as `Ok(None)`.
    #[error("timed out after {0:?} waiting for queue {1}")]
    Timeout(Duration, String),

    /// Queue not found
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The transaction was already committed or aborted
    #[error("transaction is no longer active")]
    TransactionClosed,

    /// Backend error
    #[error("storage error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this error signals lock contention rather than a real failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(..))
    }
}

/// An open transaction against a [`QueueStore`]
///
/// Dequeues and enqueues performed through the transaction become visible to
/// other transactions only after [`commit`](StoreTransaction::commit).
/// Dropping an uncommitted transaction rolls it back: dequeued items return to
/// the head of their queue and staged enqueues are discarded.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Dequeue one item, waiting up to `timeout` for one to arrive
    ///
    /// Returns `Ok(None)` when the queue stayed empty for the whole wait and
    /// `Err(StoreError::Timeout)` when another transaction kept the queue
    /// locked for the whole wait.
    async fn try_dequeue(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Stage an item for enqueue on commit
    async fn enqueue(&mut self, queue: &str, item: WorkItem) -> Result<(), StoreError>;

    /// Atomically apply every dequeue and enqueue in this transaction
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Roll back explicitly (equivalent to dropping the transaction)
    async fn abort(self: Box<Self>) -> Result<(), StoreError>;
}

/// Store of named transactional queues
///
/// Implementations must be thread-safe and support concurrent access.
/// Queues are created implicitly by the first committed enqueue.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Open a new transaction
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Number of committed items in a queue (0 for unknown queues)
    async fn length(&self, queue: &str) -> Result<usize, StoreError>;

    /// Remove an idle queue
    ///
    /// Returns `Ok(true)` when the queue was removed or did not exist, and
    /// `Ok(false)` when it still holds committed items or is locked by an
    /// open transaction, in which case it is left untouched.
    async fn remove_queue(&self, queue: &str) -> Result<bool, StoreError>;

    /// Names of all queues currently held by the store
    async fn list_queues(&self) -> Result<Vec<String>, StoreError>;
}
