//! Pool sizing and dequeue wait rules

use std::time::Duration;

/// Target worker count for `queue_count` active queues
///
/// One worker per queue, bounded by `[min, max]`. While any queue exists the
/// result is at least one, since `max` is validated to be non-zero.
pub fn desired_workers(queue_count: usize, min: usize, max: usize) -> usize {
    queue_count.max(min).min(max)
}

/// Dequeue wait for the next cycle
///
/// When queues outnumber workers a short wait keeps workers rotating so idle
/// queues do not starve busy ones.
pub fn dequeue_timeout(
    queue_count: usize,
    worker_count: usize,
    short: Duration,
    long: Duration,
) -> Duration {
    if queue_count > worker_count {
        short
    } else {
        long
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_workers_tracks_queue_count() {
        assert_eq!(desired_workers(0, 1, 16), 1);
        assert_eq!(desired_workers(0, 0, 16), 0);
        assert_eq!(desired_workers(3, 1, 16), 3);
        assert_eq!(desired_workers(40, 1, 16), 16);
        assert_eq!(desired_workers(2, 4, 16), 4);
    }

    #[test]
    fn test_desired_workers_floor_while_queues_exist() {
        assert_eq!(desired_workers(1, 0, 1), 1);
        assert_eq!(desired_workers(5, 0, 1), 1);
    }

    #[test]
    fn test_short_timeout_when_queues_outnumber_workers() {
        let short = Duration::from_secs(2);
        let long = Duration::from_secs(20);

        assert_eq!(dequeue_timeout(5, 2, short, long), short);
        assert_eq!(dequeue_timeout(2, 2, short, long), long);
        assert_eq!(dequeue_timeout(1, 4, short, long), long);
        assert_eq!(dequeue_timeout(0, 0, short, long), long);
    }
}
