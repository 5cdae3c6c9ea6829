//! Observational counters for the persistence engine.
//!
//! Everything here is lock-free atomics apart from the last-error
//! timestamp. Nothing in the engine reads these values to make a decision
//! except the health rule, which only looks at `last_error`.

use crate::queue::DropReason;
use crate::record::RejectReason;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries in milliseconds for flush duration.
pub(crate) const FLUSH_DURATION_BUCKETS_MS: [u64; 7] = [5, 10, 25, 50, 100, 250, 1000];

/// Error categories for labeled metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Connection loss, busy store, timeouts
    Transient,
    /// Constraint violations, malformed payloads
    Structural,
    /// Pool or requeue capacity exhausted
    Exhaustion,
    /// Invalid input refused at submit
    Rejected,
}

impl ErrorType {
    pub const ALL: [ErrorType; 4] = [
        ErrorType::Transient,
        ErrorType::Structural,
        ErrorType::Exhaustion,
        ErrorType::Rejected,
    ];

    /// Label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorType::Transient => "transient",
            ErrorType::Structural => "structural",
            ErrorType::Exhaustion => "exhaustion",
            ErrorType::Rejected => "rejected",
        }
    }

    fn index(&self) -> usize {
        match self {
            ErrorType::Transient => 0,
            ErrorType::Structural => 1,
            ErrorType::Exhaustion => 2,
            ErrorType::Rejected => 3,
        }
    }
}

/// Flush duration histogram data.
#[derive(Debug, Clone, Serialize)]
pub struct FlushDurationHistogram {
    pub sum_seconds: f64,
    pub count: u64,
    /// Cumulative `(le_seconds, count)` pairs
    pub buckets: Vec<(f64, u64)>,
    pub inf_bucket: u64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub persisted_records: u64,
    pub component_rows: u64,
    pub batches_committed: u64,
    pub batches_rolled_back: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub calls: u64,
    pub errors: u64,
    pub queue_depth: u64,
}

/// Engine performance counters.
pub struct PerformanceRecorder {
    submitted: AtomicU64,
    rejected: [AtomicU64; 6],
    persisted_records: AtomicU64,
    component_rows: AtomicU64,
    batches_committed: AtomicU64,
    batches_rolled_back: AtomicU64,
    requeued: AtomicU64,
    dropped: [AtomicU64; 4],

    /// Store round trips and their total time
    calls: AtomicU64,
    call_time_nanos: AtomicU64,

    errors: [AtomicU64; 4],

    flush_duration_sum_ms: AtomicU64,
    flush_duration_count: AtomicU64,
    flush_duration_buckets: [AtomicU64; 8],

    queue_depth: AtomicU64,

    started_at: Instant,
    last_error: Mutex<Option<Instant>>,
}

impl Default for PerformanceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceRecorder {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            rejected: Default::default(),
            persisted_records: AtomicU64::new(0),
            component_rows: AtomicU64::new(0),
            batches_committed: AtomicU64::new(0),
            batches_rolled_back: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            dropped: Default::default(),
            calls: AtomicU64::new(0),
            call_time_nanos: AtomicU64::new(0),
            errors: Default::default(),
            flush_duration_sum_ms: AtomicU64::new(0),
            flush_duration_count: AtomicU64::new(0),
            flush_duration_buckets: Default::default(),
            queue_depth: AtomicU64::new(0),
            started_at: Instant::now(),
            last_error: Mutex::new(None),
        }
    }

    // === RECORDING ===

    /// Record an accepted submit.
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refused submit.
    pub fn record_rejected(&self, reason: RejectReason) {
        self.rejected[reason.index()].fetch_add(1, Ordering::Relaxed);
        self.record_error(ErrorType::Rejected);
    }

    /// Record one store round trip.
    pub fn record_call(&self, duration_nanos: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.call_time_nanos
            .fetch_add(duration_nanos, Ordering::Relaxed);
    }

    /// Record a committed batch.
    pub fn record_batch_committed(&self, records: usize, rows: usize, duration: Duration) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.persisted_records
            .fetch_add(records as u64, Ordering::Relaxed);
        self.component_rows.fetch_add(rows as u64, Ordering::Relaxed);

        let duration_ms = duration.as_millis() as u64;
        self.flush_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.flush_duration_count.fetch_add(1, Ordering::Relaxed);

        // Buckets are cumulative
        for (i, &bucket_ms) in FLUSH_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.flush_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.flush_duration_buckets[7].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rolled-back batch.
    pub fn record_rollback(&self) {
        self.batches_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    /// Record records handed back to the queue.
    pub fn record_requeued(&self, count: usize) {
        self.requeued.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record records dropped without being persisted.
    pub fn record_dropped(&self, reason: DropReason, count: usize) {
        if count == 0 {
            return;
        }
        self.dropped[reason.index()].fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record an error. Everything but rejected input counts toward the
    /// recent-error health rule.
    pub fn record_error(&self, error_type: ErrorType) {
        self.errors[error_type.index()].fetch_add(1, Ordering::Relaxed);
        if error_type != ErrorType::Rejected {
            *self.last_error.lock() = Some(Instant::now());
        }
    }

    /// Update the queue depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    // === GETTERS ===

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Refused submits for one reason.
    pub fn rejected_by_reason(&self, reason: RejectReason) -> u64 {
        self.rejected[reason.index()].load(Ordering::Relaxed)
    }

    /// Refused submits across all reasons.
    pub fn rejected_total(&self) -> u64 {
        self.rejected.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn persisted_records(&self) -> u64 {
        self.persisted_records.load(Ordering::Relaxed)
    }

    pub fn component_rows(&self) -> u64 {
        self.component_rows.load(Ordering::Relaxed)
    }

    pub fn batches_committed(&self) -> u64 {
        self.batches_committed.load(Ordering::Relaxed)
    }

    pub fn batches_rolled_back(&self) -> u64 {
        self.batches_rolled_back.load(Ordering::Relaxed)
    }

    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Dropped records for one reason.
    pub fn dropped_by_reason(&self, reason: DropReason) -> u64 {
        self.dropped[reason.index()].load(Ordering::Relaxed)
    }

    /// Dropped records across all reasons.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Mean store round trip in milliseconds.
    pub fn average_call_ms(&self) -> f64 {
        let calls = self.calls();
        if calls == 0 {
            return 0.0;
        }
        self.call_time_nanos.load(Ordering::Relaxed) as f64 / calls as f64 / 1_000_000.0
    }

    /// Errors of one type.
    pub fn errors_by_type(&self, error_type: ErrorType) -> u64 {
        self.errors[error_type.index()].load(Ordering::Relaxed)
    }

    /// Errors across all types.
    pub fn errors_total(&self) -> u64 {
        self.errors.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Time since the recorder was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether a non-rejection error was recorded within `window`.
    pub fn has_error_within(&self, window: Duration) -> bool {
        self.last_error
            .lock()
            .is_some_and(|at| at.elapsed() < window)
    }

    /// Flush duration histogram data for export.
    pub fn flush_duration_histogram(&self) -> FlushDurationHistogram {
        FlushDurationHistogram {
            sum_seconds: self.flush_duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.flush_duration_count.load(Ordering::Relaxed),
            buckets: FLUSH_DURATION_BUCKETS_MS
                .iter()
                .enumerate()
                .map(|(i, &ms)| {
                    (
                        ms as f64 / 1000.0,
                        self.flush_duration_buckets[i].load(Ordering::Relaxed),
                    )
                })
                .collect(),
            inf_bucket: self.flush_duration_buckets[7].load(Ordering::Relaxed),
        }
    }

    /// Copy of the headline counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted(),
            rejected: self.rejected_total(),
            persisted_records: self.persisted_records(),
            component_rows: self.component_rows(),
            batches_committed: self.batches_committed(),
            batches_rolled_back: self.batches_rolled_back(),
            requeued: self.requeued(),
            dropped: self.dropped_total(),
            calls: self.calls(),
            errors: self.errors_total(),
            queue_depth: self.queue_depth(),
        }
    }

    /// One-line performance summary.
    pub fn summary(&self, active_connections: usize, max_connections: usize) -> String {
        format!(
            "Database Performance: {} calls, avg {:.2}ms, {} records, {} batches, pool: {}/{} connections",
            self.calls(),
            self.average_call_ms(),
            self.persisted_records(),
            self.batches_committed(),
            active_connections,
            max_connections
        )
    }
}
