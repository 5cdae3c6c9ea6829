//! What happens to a batch that did not commit.
//!
//! Failed records go back to the head of the queue, bounded by the requeue
//! capacity. Each record carries its own attempt count:
//!
//! - transient failures charge every record in the batch, and so does a
//!   failure to get a connection at all;
//! - a structural failure of a multi-record batch charges nobody but flags
//!   every record for isolation, so the next drains retry them one by one;
//! - a structural failure of a single record charges that record.
//!
//! A record that reaches the attempt bound is evicted and reported as data
//! loss, as is anything the requeue bound cannot take back.

use super::fanout::WriteFailure;
use crate::error::FailureClass;
use crate::metrics::{ErrorType, PerformanceRecorder};
use crate::queue::{log_data_loss, DropReason, IngestQueue, QueuedRecord};
use std::sync::Arc;
use tracing::debug;

/// What the policy did with a failed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    pub requeued: usize,
    /// Records newly flagged for single-record retry
    pub isolated: usize,
    /// Records dropped at the attempt bound
    pub evicted: usize,
    /// Records dropped at the requeue bound
    pub overflowed: usize,
}

/// Bounded retry and requeue of failed batches.
pub struct RetryRequeuePolicy {
    max_attempts: u32,
    metrics: Arc<PerformanceRecorder>,
}

impl RetryRequeuePolicy {
    pub fn new(max_attempts: u32, metrics: Arc<PerformanceRecorder>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            metrics,
        }
    }

    /// Charge, evict and requeue the records of a failed batch.
    pub fn handle(
        &self,
        queue: &IngestQueue,
        mut batch: Vec<QueuedRecord>,
        failure: &WriteFailure,
    ) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();

        match failure.class() {
            FailureClass::Transient => {
                for record in &mut batch {
                    record.attempts += 1;
                }
            }
            FailureClass::Structural if batch.len() == 1 => {
                batch[0].attempts += 1;
            }
            FailureClass::Structural => {
                for record in &mut batch {
                    if !record.isolate {
                        record.isolate = true;
                        outcome.isolated += 1;
                    }
                }
            }
        }

        let (exhausted, retry): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .partition(|r| r.attempts >= self.max_attempts);

        if !exhausted.is_empty() {
            log_data_loss(DropReason::RetryExhausted, &exhausted);
            self.metrics
                .record_dropped(DropReason::RetryExhausted, exhausted.len());
            outcome.evicted = exhausted.len();
        }

        let requeue = queue.requeue_front(retry);
        outcome.requeued = requeue.requeued;
        self.metrics.record_requeued(requeue.requeued);

        if !requeue.overflow.is_empty() {
            log_data_loss(DropReason::RequeueOverflow, &requeue.overflow);
            self.metrics
                .record_dropped(DropReason::RequeueOverflow, requeue.overflow.len());
            self.metrics.record_error(ErrorType::Exhaustion);
            outcome.overflowed = requeue.overflow.len();
        }

        debug!(
            class = failure.class().as_label(),
            requeued = outcome.requeued,
            isolated = outcome.isolated,
            evicted = outcome.evicted,
            overflowed = outcome.overflowed,
            queue_len = queue.len(),
            "Failed batch requeued"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PoolError, StoreError};
    use crate::record::{CompositeRecord, SessionId};
    use std::time::Duration;

    fn fill(queue: &IngestQueue, range: std::ops::RangeInclusive<u64>) {
        for seq in range {
            let record = CompositeRecord::builder()
                .session(SessionId(1))
                .sequence(seq)
                .capture_duration(Duration::from_millis(1))
                .build();
            queue.enqueue(record).unwrap();
        }
    }

    fn transient() -> WriteFailure {
        WriteFailure::Store(StoreError::Timeout("busy".into()))
    }

    fn structural() -> WriteFailure {
        WriteFailure::Store(StoreError::Constraint("CHECK".into()))
    }

    fn policy(max_attempts: u32) -> (RetryRequeuePolicy, Arc<PerformanceRecorder>) {
        let metrics = Arc::new(PerformanceRecorder::new());
        (RetryRequeuePolicy::new(max_attempts, Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn test_transient_failure_charges_and_requeues() {
        let queue = IngestQueue::new(100, 20);
        fill(&queue, 1..=5);
        let (policy, _) = policy(3);

        let batch = queue.drain(5);
        let outcome = policy.handle(&queue, batch, &transient());
        assert_eq!(outcome.requeued, 5);

        let again = queue.drain(5);
        assert!(again.iter().all(|r| r.attempts == 1 && !r.isolate));
        assert_eq!(again[0].sequence_number, 1);
    }

    #[test]
    fn test_acquire_failure_is_charged_until_evicted() {
        let queue = IngestQueue::new(100, 20);
        fill(&queue, 1..=3);
        let (policy, metrics) = policy(3);
        let unreachable = WriteFailure::Acquire(PoolError::Unavailable("refused".into()));

        for round in 1..=3u32 {
            let batch = queue.drain(3);
            assert!(batch.iter().all(|r| r.attempts == round - 1));
            let outcome = policy.handle(&queue, batch, &unreachable);
            if round < 3 {
                assert_eq!(outcome.requeued, 3);
            } else {
                assert_eq!(outcome.evicted, 3);
            }
        }
        assert!(queue.is_empty());
        assert_eq!(metrics.dropped_by_reason(DropReason::RetryExhausted), 3);
    }

    #[test]
    fn test_structural_failure_isolates_without_charging() {
        let queue = IngestQueue::new(100, 20);
        fill(&queue, 1..=4);
        let (policy, _) = policy(3);

        let batch = queue.drain(4);
        let outcome = policy.handle(&queue, batch, &structural());
        assert_eq!(outcome.isolated, 4);

        let single = queue.drain(4);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].attempts, 0);
        assert!(single[0].isolate);
    }

    #[test]
    fn test_poison_record_is_evicted_at_bound() {
        let queue = IngestQueue::new(100, 20);
        fill(&queue, 1..=1);
        let (policy, metrics) = policy(3);

        for attempt in 1..=3 {
            let batch = queue.drain(10);
            assert_eq!(batch.len(), 1, "attempt {attempt}");
            let outcome = policy.handle(&queue, batch, &structural());
            assert_eq!(outcome.evicted, usize::from(attempt == 3));
        }
        assert!(queue.is_empty());
        assert_eq!(metrics.dropped_by_reason(DropReason::RetryExhausted), 1);
    }

    #[test]
    fn test_overflow_is_dropped_and_counted() {
        let queue = IngestQueue::new(100, 20);
        fill(&queue, 1..=25);
        let (policy, metrics) = policy(3);

        let batch = queue.drain(10);
        let outcome = policy.handle(&queue, batch, &transient());
        assert_eq!(outcome.requeued, 5);
        assert_eq!(outcome.overflowed, 5);
        assert_eq!(queue.len(), 20);
        assert_eq!(metrics.dropped_by_reason(DropReason::RequeueOverflow), 5);
        assert_eq!(metrics.errors_by_type(ErrorType::Exhaustion), 1);
    }
}
