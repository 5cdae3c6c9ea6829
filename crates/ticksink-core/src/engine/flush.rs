//! One flush cycle: drain, write, retry, repeat.
//!
//! A cycle works through the records queued when it started, batch by
//! batch, and stops early on the first transient failure so a struggling
//! store is not retried in a tight loop. Only one cycle runs at a time;
//! a trigger that arrives while one is running collapses into it.

use super::fanout::{FanoutWriter, WriteFailure};
use super::retry::RetryRequeuePolicy;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::FailureClass;
use crate::health::{Component, HealthCheck};
use crate::metrics::PerformanceRecorder;
use crate::queue::IngestQueue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What started a flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Queue reached the batch size threshold
    Size,
    /// Fixed-delay timer
    Timer,
    /// Operator request
    Forced,
    /// Finalize or shutdown drain
    Drain,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Forced => "forced",
            FlushTrigger::Drain => "drain",
        }
    }

    /// Forced and drain cycles run even with the breaker open.
    fn bypasses_breaker(&self) -> bool {
        matches!(self, FlushTrigger::Forced | FlushTrigger::Drain)
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one flush cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub trigger: FlushTrigger,
    pub batches_committed: usize,
    pub records_persisted: usize,
    pub batches_failed: usize,
    pub requeued: usize,
    pub dropped: usize,
    /// Class of the last failure, if any
    pub last_failure: Option<FailureClass>,
    /// Another cycle was already running
    pub collapsed: bool,
    /// The breaker was open
    pub skipped: bool,
    /// Queue length when the cycle ended
    pub remaining: usize,
}

impl CycleReport {
    fn new(trigger: FlushTrigger) -> Self {
        Self {
            trigger,
            batches_committed: 0,
            records_persisted: 0,
            batches_failed: 0,
            requeued: 0,
            dropped: 0,
            last_failure: None,
            collapsed: false,
            skipped: false,
            remaining: 0,
        }
    }

    /// Whether the cycle stopped on a failure the store may recover from.
    pub fn stalled(&self) -> bool {
        self.skipped || self.last_failure == Some(FailureClass::Transient)
    }
}

/// Runs flush cycles against the queue.
pub struct FlushCoordinator {
    queue: Arc<IngestQueue>,
    writer: FanoutWriter,
    policy: RetryRequeuePolicy,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthCheck>,
    metrics: Arc<PerformanceRecorder>,
    batch_size: usize,
    in_flight: Mutex<()>,
}

impl FlushCoordinator {
    pub fn new(
        queue: Arc<IngestQueue>,
        writer: FanoutWriter,
        policy: RetryRequeuePolicy,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthCheck>,
        metrics: Arc<PerformanceRecorder>,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            writer,
            policy,
            breaker,
            health,
            metrics,
            batch_size: batch_size.max(1),
            in_flight: Mutex::new(()),
        }
    }

    /// Run a cycle unless one is already running.
    pub fn try_cycle(&self, trigger: FlushTrigger) -> CycleReport {
        match self.in_flight.try_lock() {
            Some(_guard) => self.run_cycle(trigger),
            None => {
                debug!(trigger = %trigger, "Flush already in flight, trigger collapsed");
                let mut report = CycleReport::new(trigger);
                report.collapsed = true;
                report.remaining = self.queue.len();
                report
            }
        }
    }

    /// Run a cycle, waiting up to `timeout` for a running one to finish.
    pub fn cycle_within(&self, trigger: FlushTrigger, timeout: Duration) -> Option<CycleReport> {
        let _guard = self.in_flight.try_lock_for(timeout)?;
        Some(self.run_cycle(trigger))
    }

    fn run_cycle(&self, trigger: FlushTrigger) -> CycleReport {
        let mut report = CycleReport::new(trigger);

        if !trigger.bypasses_breaker() && !self.breaker.is_allowed() {
            report.skipped = true;
            report.remaining = self.queue.len();
            debug!(
                trigger = %trigger,
                queued = report.remaining,
                cooldown_ms = self
                    .breaker
                    .remaining_cooldown()
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                "Store circuit open, flush skipped"
            );
            return report;
        }

        let mut budget = self.queue.len();
        while budget > 0 {
            let batch = self.queue.drain(self.batch_size);
            if batch.is_empty() {
                break;
            }
            budget = budget.saturating_sub(batch.len());

            match self.writer.write(&batch) {
                Ok(write) => {
                    report.batches_committed += 1;
                    report.records_persisted += write.records;
                    self.health.mark_healthy(Component::Writer);
                    self.health.mark_healthy(Component::Store);
                    self.health.mark_healthy(Component::Pool);
                }
                Err(failure) => {
                    report.batches_failed += 1;
                    report.last_failure = Some(failure.class());
                    self.metrics.record_error(failure.error_type());
                    self.note_failure(&failure);

                    let outcome = self.policy.handle(&self.queue, batch, &failure);
                    report.requeued += outcome.requeued;
                    report.dropped += outcome.evicted + outcome.overflowed;
                    if outcome.overflowed > 0 {
                        self.health
                            .mark_degraded(Component::Queue, "requeue capacity exceeded");
                    }

                    if failure.class() == FailureClass::Transient {
                        break;
                    }
                    // Structural retries are bounded per record, so requeued
                    // records stay within this cycle
                    budget += outcome.requeued;
                }
            }
        }

        if report.stalled() {
            self.breaker.record_failure();
            if self.breaker.state() == CircuitState::Open {
                self.health
                    .mark_unhealthy(Component::Store, "circuit breaker open");
            }
        } else if report.batches_committed > 0 || report.batches_failed > 0 {
            self.breaker.record_success();
        }

        report.remaining = self.queue.len();
        self.metrics.set_queue_depth(report.remaining);
        if report.batches_committed > 0 || report.batches_failed > 0 {
            debug!(
                trigger = %trigger,
                committed = report.batches_committed,
                failed = report.batches_failed,
                records = report.records_persisted,
                remaining = report.remaining,
                "Flush cycle finished"
            );
        }
        report
    }

    fn note_failure(&self, failure: &WriteFailure) {
        match failure {
            WriteFailure::Acquire(e) => {
                self.health
                    .mark_unhealthy(Component::Pool, format!("acquire failed: {}", e));
                warn!(error = %e, "Flush could not obtain a store connection");
            }
            WriteFailure::Store(e) => {
                let reason = format!("{}: {}", e.class().as_label(), e);
                self.health.mark_degraded(Component::Writer, reason.clone());
                if e.class() == FailureClass::Transient {
                    self.health.mark_degraded(Component::Store, reason);
                }
            }
        }
    }

    /// Records left in the queue.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, PoolConfig};
    use crate::pool::ConnectionPool;
    use crate::record::{ComponentSlot, CompositeRecord, SessionId};
    use crate::store::{ComponentRegistry, ConnectionFactory, MemoryStore, NewSession};
    use chrono::Utc;
    use serde_json::json;

    struct Fixture {
        store: MemoryStore,
        queue: Arc<IngestQueue>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<PerformanceRecorder>,
        coordinator: FlushCoordinator,
        session: SessionId,
    }

    fn fixture(batch_size: usize, requeue_capacity: usize, failure_threshold: u32) -> Fixture {
        let store = MemoryStore::new();
        let session = store
            .connect()
            .unwrap()
            .create_session(&NewSession {
                uuid: uuid::Uuid::new_v4(),
                player_name: None,
                activity_type: None,
                started_at: Utc::now(),
            })
            .unwrap();

        let pool = Arc::new(
            ConnectionPool::open(
                Arc::new(store.clone()),
                PoolConfig {
                    connection_acquire_timeout_ms: 200,
                    ..PoolConfig::default()
                },
            )
            .unwrap(),
        );
        let metrics = Arc::new(PerformanceRecorder::new());
        let queue = Arc::new(IngestQueue::new(10_000, requeue_capacity));
        let breaker = Arc::new(CircuitBreaker::new(&BreakerConfig {
            failure_threshold,
            reset_timeout_ms: 60_000,
            success_threshold: 1,
        }));
        let writer = FanoutWriter::new(
            pool,
            Arc::new(ComponentRegistry::standard()),
            Arc::clone(&metrics),
        );
        let coordinator = FlushCoordinator::new(
            Arc::clone(&queue),
            writer,
            RetryRequeuePolicy::new(3, Arc::clone(&metrics)),
            Arc::clone(&breaker),
            Arc::new(HealthCheck::new()),
            Arc::clone(&metrics),
            batch_size,
        );
        Fixture {
            store,
            queue,
            breaker,
            metrics,
            coordinator,
            session,
        }
    }

    fn submit(f: &Fixture, range: std::ops::RangeInclusive<u64>) {
        for seq in range {
            let record = CompositeRecord::builder()
                .session(f.session)
                .sequence(seq)
                .capture_duration_nanos(500)
                .component(ComponentSlot::Vitals, json!({"hp": seq}))
                .build();
            f.queue.enqueue(record).unwrap();
        }
    }

    #[test]
    fn test_cycle_drains_queue_in_batches() {
        let f = fixture(10, 20, 5);
        submit(&f, 1..=25);

        let report = f.coordinator.try_cycle(FlushTrigger::Timer);
        assert_eq!(report.batches_committed, 3);
        assert_eq!(report.records_persisted, 25);
        assert_eq!(report.remaining, 0);

        let sequences: Vec<u64> = f.store.roots(f.session).iter().map(|r| r.sequence_number).collect();
        assert_eq!(sequences, (1..=25).collect::<Vec<_>>());
    }

    #[test]
    fn test_transient_failure_stops_cycle() {
        let f = fixture(5, 10, 5);
        submit(&f, 1..=10);
        f.store.fail_table("player_vitals", 1, FailureClass::Transient);

        let report = f.coordinator.try_cycle(FlushTrigger::Size);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.batches_committed, 0);
        assert_eq!(report.remaining, 10);
        assert!(report.stalled());

        let report = f.coordinator.try_cycle(FlushTrigger::Size);
        assert_eq!(report.records_persisted, 10);
        assert_eq!(f.store.roots(f.session).len(), 10);
    }

    #[test]
    fn test_structural_failure_isolates_poison_record() {
        let f = fixture(10, 20, 5);
        submit(&f, 1..=10);
        f.store.poison_sequence(4);

        let report = f.coordinator.try_cycle(FlushTrigger::Size);
        assert_eq!(report.records_persisted, 9);
        assert_eq!(report.dropped, 1);
        assert_eq!(f.store.roots(f.session).len(), 9);
        assert_eq!(f.metrics.dropped_total(), 1);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_open_breaker_skips_regular_cycles() {
        let f = fixture(5, 10, 1);
        submit(&f, 1..=5);
        f.store.fail_always(Some(FailureClass::Transient));

        f.coordinator.try_cycle(FlushTrigger::Timer);
        assert_eq!(f.breaker.state(), CircuitState::Open);

        let report = f.coordinator.try_cycle(FlushTrigger::Timer);
        assert!(report.skipped);
        assert_eq!(report.remaining, 5);

        // Forced cycles still reach the store
        f.store.fail_always(None);
        let report = f.coordinator.try_cycle(FlushTrigger::Forced);
        assert_eq!(report.records_persisted, 5);
    }

    #[test]
    fn test_concurrent_trigger_collapses() {
        let f = fixture(5, 10, 5);
        submit(&f, 1..=3);

        let _running = f.coordinator.in_flight.lock();
        let report = f.coordinator.try_cycle(FlushTrigger::Size);
        assert!(report.collapsed);
        assert_eq!(report.remaining, 3);
        assert!(f
            .coordinator
            .cycle_within(FlushTrigger::Drain, Duration::from_millis(20))
            .is_none());
    }
}
