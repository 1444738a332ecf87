//! Queue lifecycle tracking
//!
//! The [`QueueTracker`] owns the authoritative set of active queues, hands
//! out exclusive leases so a queue is worked by at most one worker at a time,
//! and keeps the registry of queues suspected to have gone idle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

use crate::worker::WorkerId;

/// Exclusive claim on one queue, held by one worker until released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLease {
    pub queue: String,
    pub worker_id: WorkerId,
}

/// Per-queue registration state
#[derive(Debug)]
struct QueueSlot {
    lease: Option<WorkerId>,
    registered_at: Instant,
}

/// Active queue set, lease table and suspected-empty registry
///
/// Every operation is safe to call concurrently from many workers. Lease
/// acquisition is a check-and-set performed under the slot's shard lock, and
/// suspicion timestamps are sticky: the first observation wins.
///
/// Lock order is `order` before any `queues` shard.
#[derive(Debug, Default)]
pub struct QueueTracker {
    queues: DashMap<String, QueueSlot>,
    /// Sorted names of `queues`, maintained on register and remove
    order: RwLock<Vec<String>>,
    suspected_empty: DashMap<String, Instant>,
    /// Rotates the starting point of lease scans
    cursor: AtomicUsize,
}

impl QueueTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queue to the active set
    ///
    /// Returns true when the queue was not registered before. Any suspicion
    /// entry is cleared, since the caller knows the queue has work.
    pub fn register_queue(&self, queue: &str) -> bool {
        self.suspected_empty.remove(queue);

        if self.queues.contains_key(queue) {
            return false;
        }

        let mut order = self.order.write();
        let mut inserted = false;
        self.queues.entry(queue.to_string()).or_insert_with(|| {
            inserted = true;
            QueueSlot {
                lease: None,
                registered_at: Instant::now(),
            }
        });
        if inserted {
            if let Err(pos) = order.binary_search_by(|name| name.as_str().cmp(queue)) {
                order.insert(pos, queue.to_string());
            }
            trace!(queue, "queue registered");
        }
        inserted
    }

    /// Lease one currently unleased queue to `worker_id`
    ///
    /// Returns `None` when no queue is registered or every queue is already
    /// leased. That is an expected condition meaning there are more workers
    /// than queues.
    pub fn lease_queue(&self, worker_id: WorkerId) -> Option<QueueLease> {
        let order = self.order.read();
        if order.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % order.len();
        let (tail, head) = order.split_at(start);

        for name in head.iter().chain(tail) {
            // get_mut holds the shard write lock, so the check and the set
            // below cannot interleave with another worker's attempt.
            if let Some(mut slot) = self.queues.get_mut(name) {
                if slot.lease.is_none() {
                    slot.lease = Some(worker_id);
                    return Some(QueueLease {
                        queue: name.clone(),
                        worker_id,
                    });
                }
            }
        }

        None
    }

    /// Clear the lease on a queue, optionally revoking its suspected-empty status
    pub fn release_queue(&self, queue: &str, clear_suspicion: bool) {
        if let Some(mut slot) = self.queues.get_mut(queue) {
            slot.lease = None;
        }
        if clear_suspicion {
            self.suspected_empty.remove(queue);
        }
    }

    /// Record `now` as the first time the queue was seen empty
    ///
    /// An existing entry is left unchanged.
    pub fn mark_suspected_empty(&self, queue: &str, now: Instant) {
        self.suspected_empty.entry(queue.to_string()).or_insert(now);
    }

    /// Whether the queue has been suspected empty for at least `retirement_delay`
    pub fn is_confirmed_empty(&self, queue: &str, now: Instant, retirement_delay: Duration) -> bool {
        self.suspected_empty
            .get(queue)
            .map(|since| now.saturating_duration_since(*since) >= retirement_delay)
            .unwrap_or(false)
    }

    /// Drop the suspected-empty entry for a queue
    pub fn clear_suspicion(&self, queue: &str) {
        self.suspected_empty.remove(queue);
    }

    /// Unregister a queue and forget any suspicion about it
    ///
    /// Idempotent: returns false if the queue was already gone.
    pub fn remove_queue(&self, queue: &str) -> bool {
        self.suspected_empty.remove(queue);

        let mut order = self.order.write();
        if let Ok(pos) = order.binary_search_by(|name| name.as_str().cmp(queue)) {
            order.remove(pos);
        }
        self.queues.remove(queue).is_some()
    }

    /// Number of registered queues
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Number of queues currently leased
    pub fn leased_count(&self) -> usize {
        self.queues.iter().filter(|e| e.lease.is_some()).count()
    }

    /// Whether the queue is registered
    pub fn contains(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    /// Worker currently holding the queue, if any
    pub fn lease_holder(&self, queue: &str) -> Option<WorkerId> {
        self.queues.get(queue).and_then(|slot| slot.lease)
    }

    /// When the queue was first suspected empty, if it is suspected
    pub fn suspected_since(&self, queue: &str) -> Option<Instant> {
        self.suspected_empty.get(queue).map(|since| *since)
    }

    /// How long the queue has been registered
    pub fn registered_for(&self, queue: &str) -> Option<Duration> {
        self.queues.get(queue).map(|slot| slot.registered_at.elapsed())
    }

    /// Sorted names of all registered queues
    pub fn queue_names(&self) -> Vec<String> {
        self.order.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_lease_none_without_queues() {
        let tracker = QueueTracker::new();
        assert!(tracker.lease_queue(WorkerId::new()).is_none());
    }

    #[test]
    fn test_lease_is_exclusive() {
        let tracker = QueueTracker::new();
        tracker.register_queue("q1");

        let first = WorkerId::new();
        let lease = tracker.lease_queue(first).unwrap();
        assert_eq!(lease.queue, "q1");
        assert_eq!(tracker.lease_holder("q1"), Some(first));

        assert!(tracker.lease_queue(WorkerId::new()).is_none());

        tracker.release_queue("q1", false);
        assert!(tracker.lease_queue(WorkerId::new()).is_some());
    }

    #[test]
    fn test_lease_rotates_across_queues() {
        let tracker = QueueTracker::new();
        tracker.register_queue("a");
        tracker.register_queue("b");

        let worker = WorkerId::new();
        let first = tracker.lease_queue(worker).unwrap();
        tracker.release_queue(&first.queue, false);
        let second = tracker.lease_queue(worker).unwrap();

        assert_ne!(first.queue, second.queue);
    }

    #[test]
    fn test_register_is_idempotent_and_clears_suspicion() {
        let tracker = QueueTracker::new();
        assert!(tracker.register_queue("q1"));
        tracker.mark_suspected_empty("q1", Instant::now());

        assert!(!tracker.register_queue("q1"));
        assert_eq!(tracker.queue_count(), 1);
        assert!(tracker.suspected_since("q1").is_none());
    }

    #[test]
    fn test_suspicion_timestamp_is_sticky() {
        let tracker = QueueTracker::new();
        tracker.register_queue("q1");

        let first = Instant::now();
        tracker.mark_suspected_empty("q1", first);
        for offset in 1..5 {
            tracker.mark_suspected_empty("q1", first + Duration::from_secs(offset));
        }

        assert_eq!(tracker.suspected_since("q1"), Some(first));
    }

    #[test]
    fn test_confirmed_empty_threshold() {
        let tracker = QueueTracker::new();
        let delay = Duration::from_secs(10);
        let t0 = Instant::now();

        assert!(!tracker.is_confirmed_empty("q1", t0 + delay, delay));

        tracker.mark_suspected_empty("q1", t0);
        assert!(!tracker.is_confirmed_empty("q1", t0, delay));
        assert!(!tracker.is_confirmed_empty("q1", t0 + delay - Duration::from_millis(1), delay));
        assert!(tracker.is_confirmed_empty("q1", t0 + delay, delay));
        assert!(tracker.is_confirmed_empty("q1", t0 + delay * 2, delay));
    }

    #[test]
    fn test_release_with_clear_revokes_suspicion() {
        let tracker = QueueTracker::new();
        let delay = Duration::from_secs(1);
        let t0 = Instant::now();
        tracker.register_queue("q1");
        tracker.lease_queue(WorkerId::new()).unwrap();

        tracker.mark_suspected_empty("q1", t0);
        tracker.release_queue("q1", false);
        assert!(tracker.is_confirmed_empty("q1", t0 + delay, delay));

        tracker.release_queue("q1", true);
        assert!(!tracker.is_confirmed_empty("q1", t0 + delay, delay));
    }

    #[test]
    fn test_remove_queue_is_idempotent() {
        let tracker = QueueTracker::new();
        tracker.register_queue("q1");
        tracker.mark_suspected_empty("q1", Instant::now());

        assert!(tracker.remove_queue("q1"));
        assert!(!tracker.contains("q1"));
        assert!(tracker.suspected_since("q1").is_none());
        assert!(!tracker.remove_queue("q1"));
    }

    #[test]
    fn test_lease_scan_tracks_registrations_and_removals() {
        let tracker = QueueTracker::new();
        for name in ["c", "a", "b"] {
            tracker.register_queue(name);
        }
        assert_eq!(tracker.queue_names(), vec!["a", "b", "c"]);

        tracker.remove_queue("b");
        assert_eq!(tracker.queue_names(), vec!["a", "c"]);

        let leased: HashSet<String> = (0..3)
            .filter_map(|_| tracker.lease_queue(WorkerId::new()))
            .map(|lease| lease.queue)
            .collect();
        assert_eq!(leased, HashSet::from(["a".to_string(), "c".to_string()]));

        tracker.register_queue("b");
        assert_eq!(tracker.queue_names(), vec!["a", "b", "c"]);
        assert_eq!(
            tracker.lease_queue(WorkerId::new()).map(|lease| lease.queue),
            Some("b".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_leases_never_overlap() {
        let tracker = Arc::new(QueueTracker::new());
        for name in ["q1", "q2", "q3"] {
            tracker.register_queue(name);
        }

        let mut handles = Vec::new();
        for _ in 0..32 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                let worker = WorkerId::new();
                let mut held = 0usize;
                for _ in 0..200 {
                    if let Some(lease) = tracker.lease_queue(worker) {
                        // Nobody else may observe this queue as ours-and-theirs.
                        assert_eq!(tracker.lease_holder(&lease.queue), Some(worker));
                        assert!(tracker.leased_count() <= 3);
                        held += 1;
                        tokio::task::yield_now().await;
                        assert_eq!(tracker.lease_holder(&lease.queue), Some(worker));
                        tracker.release_queue(&lease.queue, false);
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
                held
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert!(total > 0);
        assert_eq!(tracker.leased_count(), 0);
    }

    #[test]
    fn test_simultaneous_holders_bounded_by_queue_count() {
        let tracker = QueueTracker::new();
        tracker.register_queue("a");
        tracker.register_queue("b");

        let holders: Vec<_> = (0..5)
            .filter_map(|_| tracker.lease_queue(WorkerId::new()))
            .collect();
        let queues: HashSet<_> = holders.iter().map(|l| l.queue.clone()).collect();

        assert_eq!(holders.len(), 2);
        assert_eq!(queues.len(), 2);
    }
}
