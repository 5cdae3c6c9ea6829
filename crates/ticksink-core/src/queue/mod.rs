//! Ingest queue between the producer and the flush worker.
//!
//! The queue is the only mutable state the producer touches. `enqueue`
//! takes one short lock and never waits on the store; `drain` hands the
//! worker a FIFO batch. Failed batches come back through `requeue_front`,
//! which is bounded separately from the producer-facing capacity.

use crate::record::{CompositeRecord, RejectReason, SessionId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Instant;
use tracing::{error, warn};

/// A validated record waiting to be flushed.
#[derive(Debug, Clone)]
pub struct QueuedRecord {
    pub record: CompositeRecord,
    pub session_id: SessionId,
    pub sequence_number: u64,
    /// Failed flush attempts charged to this record
    pub attempts: u32,
    /// Flush alone on the next drain
    pub isolate: bool,
    pub enqueued_at: Instant,
}

/// Why records were removed without being persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Requeue would exceed the requeue capacity
    RequeueOverflow,
    /// Record reached its attempt bound
    RetryExhausted,
    /// Producer submitted into a full queue
    QueueFull,
    /// Still queued when finalize or shutdown gave up
    Shutdown,
}

impl DropReason {
    /// All reasons, in metrics export order.
    pub const ALL: [DropReason; 4] = [
        DropReason::RequeueOverflow,
        DropReason::RetryExhausted,
        DropReason::QueueFull,
        DropReason::Shutdown,
    ];

    /// Label used in logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DropReason::RequeueOverflow => "requeue_overflow",
            DropReason::RetryExhausted => "retry_exhausted",
            DropReason::QueueFull => "queue_full",
            DropReason::Shutdown => "shutdown",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            DropReason::RequeueOverflow => 0,
            DropReason::RetryExhausted => 1,
            DropReason::QueueFull => 2,
            DropReason::Shutdown => 3,
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Emit the data-loss event for records that will never be persisted.
pub fn log_data_loss(reason: DropReason, records: &[QueuedRecord]) {
    if records.is_empty() {
        return;
    }
    let first = records.iter().map(|r| r.sequence_number).min().unwrap_or(0);
    let last = records.iter().map(|r| r.sequence_number).max().unwrap_or(0);
    error!(
        reason = %reason,
        count = records.len(),
        session_id = %records[0].session_id,
        first_sequence = first,
        last_sequence = last,
        "Data loss: records dropped without being persisted"
    );
}

/// Result of handing a failed batch back to the queue.
#[derive(Debug, Default)]
pub struct RequeueOutcome {
    pub requeued: usize,
    /// Records that did not fit, newest first out
    pub overflow: Vec<QueuedRecord>,
}

struct QueueState {
    records: VecDeque<QueuedRecord>,
    last_sequence: HashMap<SessionId, u64>,
    /// Sessions being finalized or finished; their records are refused
    closed: HashSet<SessionId>,
}

/// Thread-safe FIFO of validated records.
pub struct IngestQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    requeue_capacity: usize,
}

impl IngestQueue {
    /// Create a queue.
    ///
    /// `capacity` bounds producer submits; `requeue_capacity` bounds the
    /// queue length after a failed batch is handed back.
    pub fn new(capacity: usize, requeue_capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                records: VecDeque::new(),
                last_sequence: HashMap::new(),
                closed: HashSet::new(),
            }),
            capacity,
            requeue_capacity,
        }
    }

    /// Validate and append a record. Returns the queue length on success.
    pub fn enqueue(&self, record: CompositeRecord) -> Result<usize, RejectReason> {
        let (session_id, sequence_number) = match record.validate() {
            Ok(ids) => ids,
            Err(reason) => {
                warn!(
                    reason = %reason,
                    session_id = ?record.session_id(),
                    sequence = ?record.sequence_number(),
                    "Rejected record"
                );
                return Err(reason);
            }
        };

        let mut state = self.state.lock();

        if state.closed.contains(&session_id) {
            drop(state);
            warn!(
                reason = %RejectReason::InactiveSession,
                session_id = %session_id,
                sequence = sequence_number,
                "Rejected record for a closed session"
            );
            return Err(RejectReason::InactiveSession);
        }

        if let Some(&last) = state.last_sequence.get(&session_id) {
            if sequence_number <= last {
                warn!(
                    reason = %RejectReason::SequenceNotIncreasing,
                    session_id = %session_id,
                    sequence = sequence_number,
                    last_accepted = last,
                    "Rejected record"
                );
                return Err(RejectReason::SequenceNotIncreasing);
            }
        }

        if state.records.len() >= self.capacity {
            drop(state);
            warn!(
                reason = %RejectReason::QueueFull,
                session_id = %session_id,
                sequence = sequence_number,
                capacity = self.capacity,
                "Rejected record"
            );
            return Err(RejectReason::QueueFull);
        }

        state.last_sequence.insert(session_id, sequence_number);
        state.records.push_back(QueuedRecord {
            record,
            session_id,
            sequence_number,
            attempts: 0,
            isolate: false,
            enqueued_at: Instant::now(),
        });
        Ok(state.records.len())
    }

    /// Remove up to `max` records in FIFO order.
    ///
    /// An isolated record at the head comes out alone; otherwise the batch
    /// stops before the next isolated record.
    pub fn drain(&self, max: usize) -> Vec<QueuedRecord> {
        let mut state = self.state.lock();
        let mut batch = Vec::with_capacity(max.min(state.records.len()));

        if let Some(head) = state.records.front() {
            if head.isolate {
                if let Some(record) = state.records.pop_front() {
                    batch.push(record);
                }
                return batch;
            }
        }

        while batch.len() < max {
            match state.records.front() {
                Some(next) if !next.isolate => {
                    if let Some(record) = state.records.pop_front() {
                        batch.push(record);
                    }
                }
                _ => break,
            }
        }
        batch
    }

    /// Put a failed batch back at the head of the queue, preserving its order.
    ///
    /// Only as many records as keep the queue within the requeue capacity
    /// are taken back, oldest first. The rest are returned as overflow for
    /// the caller to report.
    pub fn requeue_front(&self, mut records: Vec<QueuedRecord>) -> RequeueOutcome {
        let mut state = self.state.lock();
        let room = self.requeue_capacity.saturating_sub(state.records.len());
        let overflow = if records.len() > room {
            records.split_off(room)
        } else {
            Vec::new()
        };

        let requeued = records.len();
        for record in records.into_iter().rev() {
            state.records.push_front(record);
        }

        RequeueOutcome { requeued, overflow }
    }

    /// Remove everything still queued.
    pub fn take_all(&self) -> Vec<QueuedRecord> {
        self.state.lock().records.drain(..).collect()
    }

    /// Current queue length.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Producer-facing capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum length after a requeue.
    pub fn requeue_capacity(&self) -> usize {
        self.requeue_capacity
    }

    /// Refuse further records for a session.
    ///
    /// Every record enqueued before this returns is visible to the next
    /// drain; nothing for the session is accepted after it.
    pub fn close_session(&self, session_id: SessionId) {
        self.state.lock().closed.insert(session_id);
    }

    /// Accept records for a session again after a failed finalize.
    pub fn reopen_session(&self, session_id: SessionId) {
        self.state.lock().closed.remove(&session_id);
    }

    /// Forget sequence tracking for a finished session. It stays closed.
    pub fn forget_session(&self, session_id: SessionId) {
        self.state.lock().last_sequence.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn record(seq: u64) -> CompositeRecord {
        CompositeRecord::builder()
            .session(SessionId(1))
            .sequence(seq)
            .capture_duration(Duration::from_millis(1))
            .build()
    }

    fn sequences(records: &[QueuedRecord]) -> Vec<u64> {
        records.iter().map(|r| r.sequence_number).collect()
    }

    #[test]
    fn test_enqueue_and_drain_fifo() {
        let queue = IngestQueue::new(100, 20);
        for seq in 1..=5 {
            queue.enqueue(record(seq)).unwrap();
        }
        assert_eq!(queue.len(), 5);

        let batch = queue.drain(3);
        assert_eq!(sequences(&batch), vec![1, 2, 3]);
        assert_eq!(sequences(&queue.drain(10)), vec![4, 5]);
        assert!(queue.is_empty());
        assert!(queue.drain(10).is_empty());
    }

    #[test]
    fn test_enqueue_rejects_invalid_records() {
        let queue = IngestQueue::new(100, 20);
        let missing_session = CompositeRecord::builder()
            .sequence(1)
            .capture_duration_nanos(5)
            .build();
        assert_eq!(
            queue.enqueue(missing_session),
            Err(RejectReason::MissingSessionId)
        );

        let zero_duration = CompositeRecord::builder()
            .session(SessionId(1))
            .sequence(1)
            .build();
        assert_eq!(
            queue.enqueue(zero_duration),
            Err(RejectReason::NonPositiveDuration)
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_rejects_non_increasing_sequence() {
        let queue = IngestQueue::new(100, 20);
        queue.enqueue(record(5)).unwrap();
        assert_eq!(
            queue.enqueue(record(5)),
            Err(RejectReason::SequenceNotIncreasing)
        );
        assert_eq!(
            queue.enqueue(record(4)),
            Err(RejectReason::SequenceNotIncreasing)
        );
        assert_eq!(queue.enqueue(record(6)), Ok(2));
    }

    #[test]
    fn test_enqueue_refuses_when_full() {
        let queue = IngestQueue::new(3, 3);
        for seq in 1..=3 {
            queue.enqueue(record(seq)).unwrap();
        }
        assert_eq!(queue.enqueue(record(4)), Err(RejectReason::QueueFull));
        // A refused sequence number may be submitted again later
        queue.drain(1);
        assert_eq!(queue.enqueue(record(4)), Ok(3));
    }

    #[test]
    fn test_closed_session_refuses_records() {
        let queue = IngestQueue::new(100, 20);
        queue.enqueue(record(1)).unwrap();
        queue.close_session(SessionId(1));

        assert_eq!(queue.enqueue(record(2)), Err(RejectReason::InactiveSession));
        assert_eq!(sequences(&queue.drain(10)), vec![1]);

        queue.reopen_session(SessionId(1));
        assert_eq!(queue.enqueue(record(2)), Ok(1));

        queue.close_session(SessionId(1));
        queue.forget_session(SessionId(1));
        assert_eq!(queue.enqueue(record(3)), Err(RejectReason::InactiveSession));
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let queue = IngestQueue::new(100, 20);
        for seq in 1..=6 {
            queue.enqueue(record(seq)).unwrap();
        }
        let batch = queue.drain(3);
        let outcome = queue.requeue_front(batch);
        assert_eq!(outcome.requeued, 3);
        assert!(outcome.overflow.is_empty());
        assert_eq!(sequences(&queue.drain(10)), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_requeue_front_is_bounded() {
        let queue = IngestQueue::new(100, 20);
        for seq in 1..=25 {
            queue.enqueue(record(seq)).unwrap();
        }
        let batch = queue.drain(10);
        assert_eq!(queue.len(), 15);

        let outcome = queue.requeue_front(batch);
        assert_eq!(outcome.requeued, 5);
        assert_eq!(sequences(&outcome.overflow), vec![6, 7, 8, 9, 10]);
        assert_eq!(queue.len(), 20);
        assert_eq!(sequences(&queue.drain(6)), vec![1, 2, 3, 4, 5, 11]);
    }

    #[test]
    fn test_isolated_records_drain_alone() {
        let queue = IngestQueue::new(100, 20);
        for seq in 1..=4 {
            queue.enqueue(record(seq)).unwrap();
        }
        let mut batch = queue.drain(2);
        for r in &mut batch {
            r.isolate = true;
        }
        queue.requeue_front(batch);

        assert_eq!(sequences(&queue.drain(10)), vec![1]);
        assert_eq!(sequences(&queue.drain(10)), vec![2]);
        assert_eq!(sequences(&queue.drain(10)), vec![3, 4]);
    }

    #[test]
    fn test_batch_stops_before_isolated_record() {
        let queue = IngestQueue::new(100, 20);
        for seq in 1..=3 {
            queue.enqueue(record(seq)).unwrap();
        }
        let mut all = queue.drain(3);
        all[2].isolate = true;
        queue.requeue_front(all);

        assert_eq!(sequences(&queue.drain(10)), vec![1, 2]);
        assert_eq!(sequences(&queue.drain(10)), vec![3]);
    }

    #[test]
    fn test_concurrent_producer_and_drainer() {
        let queue = Arc::new(IngestQueue::new(10_000, 20));
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for seq in 1..=1000 {
                    queue.enqueue(record(seq)).unwrap();
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 1000 {
            seen.extend(sequences(&queue.drain(64)));
            std::thread::yield_now();
        }
        producer.join().unwrap();

        assert_eq!(seen, (1..=1000).collect::<Vec<_>>());
    }
}
