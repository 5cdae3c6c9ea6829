//! The persistence engine: producer and administrative surface.
//!
//! `submit` is the only producer entry point. It validates, enqueues and
//! returns; backend failures never reach the producer. Everything else
//! here is administrative: sessions, forced flushes, health, metrics and
//! shutdown.

use super::fanout::FanoutWriter;
use super::flush::{CycleReport, FlushCoordinator, FlushTrigger};
use super::retry::RetryRequeuePolicy;
use super::scheduler::{BatchScheduler, SchedulerTimings};
use super::session::{FinalizeReport, SessionInfo, SessionLifecycle};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{Config, FlushMode};
use crate::error::{Error, Result};
use crate::health::{Component, ComponentStatus, HealthCheck, HealthStatus};
use crate::metrics::PerformanceRecorder;
use crate::pool::{ConnectionPool, PoolStatus};
use crate::queue::{log_data_loss, DropReason, IngestQueue, QueuedRecord};
use crate::record::{CompositeRecord, RecordBuilder, RejectReason, SessionId};
use crate::store::{ComponentRegistry, ConnectionFactory, NewSession, StoredSession};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pause between drain cycles that made no progress.
const DRAIN_BACKOFF: Duration = Duration::from_millis(50);

/// Optional metadata for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionStart {
    pub player_name: Option<String>,
    pub activity_type: Option<String>,
}

/// Outcome of [`PersistenceEngine::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// The session that was still active, finalized on the way out
    pub finalized: Option<FinalizeReport>,
    /// Records still queued when the drain gave up
    pub dropped: usize,
}

/// Health snapshot served by the operator endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub healthy: bool,
    pub components: BTreeMap<&'static str, ComponentStatus>,
    pub circuit: CircuitState,
    pub pool: PoolStatus,
    pub queue_depth: usize,
    pub session: Option<SessionInfo>,
    pub session_phase: &'static str,
    pub uptime_secs: u64,
}

/// Builder for [`PersistenceEngine`].
pub struct EngineBuilder {
    config: Config,
    factory: Arc<dyn ConnectionFactory>,
    registry: Option<Arc<ComponentRegistry>>,
}

impl EngineBuilder {
    /// Use a custom component registry instead of the standard one.
    pub fn registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Open the pool, check the schema and start flushing.
    ///
    /// Fails if the store cannot be reached at all or required tables are
    /// missing. Background flush mode must be started inside a tokio
    /// runtime.
    pub fn start(self) -> Result<PersistenceEngine> {
        let config = self.config;
        config.validate()?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ComponentRegistry::standard()));
        let health = Arc::new(HealthCheck::new());
        let metrics = Arc::new(PerformanceRecorder::new());

        info!(
            store = %self.factory.describe(),
            tables = registry.tables().len(),
            flush_mode = ?config.engine.flush_mode,
            batch_size = config.engine.batch_size_threshold,
            "Starting persistence engine"
        );

        let pool = match ConnectionPool::open(self.factory, config.pool.clone()) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                error!(error = %e, "Store unreachable, refusing to start");
                return Err(e.into());
            }
        };
        health.mark_healthy(Component::Pool);

        {
            let mut conn = pool.acquire()?;
            if config.store.provision_schema {
                let created = conn.provision_schema(&registry)?;
                if created > 0 {
                    info!(created, "Provisioned missing tables");
                }
            }
            if let Err(e) = conn.verify_schema(&registry) {
                error!(error = %e, "Schema check failed, refusing to start");
                return Err(e.into());
            }
        }
        health.mark_healthy(Component::Store);

        let queue = Arc::new(IngestQueue::new(
            config.engine.max_queue_capacity,
            config.engine.requeue_capacity(),
        ));
        health.mark_healthy(Component::Queue);

        let breaker = Arc::new(CircuitBreaker::new(&config.breaker));
        let coordinator = Arc::new(FlushCoordinator::new(
            Arc::clone(&queue),
            FanoutWriter::new(Arc::clone(&pool), Arc::clone(&registry), Arc::clone(&metrics)),
            RetryRequeuePolicy::new(config.engine.max_record_attempts, Arc::clone(&metrics)),
            Arc::clone(&breaker),
            Arc::clone(&health),
            Arc::clone(&metrics),
            config.engine.batch_size_threshold,
        ));

        let scheduler = match config.engine.flush_mode {
            FlushMode::Background => Some(BatchScheduler::spawn(
                Arc::clone(&coordinator),
                Arc::clone(&pool),
                Arc::clone(&metrics),
                SchedulerTimings {
                    flush_interval: config.engine.flush_interval(),
                    summary_interval: Duration::from_secs(
                        config.monitoring.summary_interval_secs.max(1),
                    ),
                    batch_size: config.engine.batch_size_threshold,
                },
            )?),
            FlushMode::Inline => None,
        };
        health.mark_healthy(Component::Writer);

        info!(pool = %pool.describe(), "Persistence engine started");

        Ok(PersistenceEngine {
            config,
            registry,
            pool,
            queue,
            coordinator,
            scheduler,
            breaker,
            health,
            metrics,
            lifecycle: SessionLifecycle::new(),
            session_gate: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Batching multi-table persistence engine for one recording session.
pub struct PersistenceEngine {
    config: Config,
    registry: Arc<ComponentRegistry>,
    pool: Arc<ConnectionPool>,
    queue: Arc<IngestQueue>,
    coordinator: Arc<FlushCoordinator>,
    scheduler: Option<BatchScheduler>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthCheck>,
    metrics: Arc<PerformanceRecorder>,
    lifecycle: SessionLifecycle,
    /// Serializes begin and finalize
    session_gate: Mutex<()>,
    shut_down: AtomicBool,
}

impl PersistenceEngine {
    /// Builder with the standard component registry.
    pub fn builder(config: Config, factory: Arc<dyn ConnectionFactory>) -> EngineBuilder {
        EngineBuilder {
            config,
            factory,
            registry: None,
        }
    }

    /// Start an engine with the standard component registry.
    pub fn start(config: Config, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        Self::builder(config, factory).start()
    }

    // ---- producer surface ----

    /// Submit one record. Never blocks on the store.
    ///
    /// Returns `false` when the record is rejected; the reason is logged
    /// and counted.
    pub fn submit(&self, record: CompositeRecord) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return self.reject_inactive(&record, "engine shut down");
        }
        if let Some(session_id) = record.session_id() {
            if !self.lifecycle.accepts(session_id) {
                return self.reject_inactive(&record, "session not active");
            }
        }

        match self.queue.enqueue(record) {
            Ok(depth) => {
                self.metrics.record_submitted();
                self.metrics.set_queue_depth(depth);
                if depth >= self.config.engine.batch_size_threshold {
                    match &self.scheduler {
                        Some(scheduler) => scheduler.wake(),
                        None => {
                            self.coordinator.try_cycle(FlushTrigger::Size);
                        }
                    }
                }
                true
            }
            Err(reason) => {
                self.metrics.record_rejected(reason);
                if reason == RejectReason::QueueFull {
                    self.metrics.record_dropped(DropReason::QueueFull, 1);
                    self.health.mark_degraded(Component::Queue, "queue at capacity");
                    error!(
                        reason = %DropReason::QueueFull,
                        count = 1,
                        capacity = self.queue.capacity(),
                        "Data loss: records dropped without being persisted"
                    );
                }
                false
            }
        }
    }

    fn reject_inactive(&self, record: &CompositeRecord, detail: &str) -> bool {
        warn!(
            reason = %RejectReason::InactiveSession,
            session_id = ?record.session_id(),
            sequence = ?record.sequence_number(),
            detail,
            "Rejected record"
        );
        self.metrics.record_rejected(RejectReason::InactiveSession);
        false
    }

    /// A record builder stamped with the active session, if any.
    pub fn new_record(&self, sequence_number: u64) -> RecordBuilder {
        let builder = CompositeRecord::builder().sequence(sequence_number);
        match self.lifecycle.active() {
            Some(info) => builder.session(info.id),
            None => builder,
        }
    }

    // ---- sessions ----

    /// Begin the engine's session with no metadata.
    pub fn begin_session(&self) -> Result<SessionId> {
        self.begin_session_with(SessionStart::default())
    }

    /// Begin the engine's session. An engine runs at most one.
    pub fn begin_session_with(&self, start: SessionStart) -> Result<SessionId> {
        let _gate = self.session_gate.lock();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        self.lifecycle.ensure_can_begin()?;

        let new = NewSession {
            uuid: Uuid::new_v4(),
            player_name: start.player_name,
            activity_type: start.activity_type,
            started_at: Utc::now(),
        };
        let id = match self.create_session_row(&new) {
            Ok(id) => id,
            Err(e) => {
                self.health
                    .mark_unhealthy(Component::Session, format!("begin failed: {}", e));
                error!(error = %e, "Could not begin session");
                return Err(e);
            }
        };

        self.lifecycle.activate(SessionInfo {
            id,
            uuid: new.uuid,
            player_name: new.player_name.clone(),
            activity_type: new.activity_type.clone(),
            started_at: new.started_at,
        })?;
        self.health.mark_healthy(Component::Session);
        info!(
            session_id = %id,
            session_uuid = %new.uuid,
            player = new.player_name.as_deref().unwrap_or("-"),
            activity = new.activity_type.as_deref().unwrap_or("-"),
            "Session started"
        );
        Ok(id)
    }

    fn create_session_row(&self, new: &NewSession) -> Result<SessionId> {
        let mut conn = self.pool.acquire()?;
        Ok(conn.create_session(new)?)
    }

    /// Drain everything queued, then record the verified total and end time.
    ///
    /// Blocks up to `engine.finalize_timeout_ms` for the drain. Records still
    /// queued after that are dropped and logged as data loss. The stored
    /// total counts distinct persisted sequence numbers, not submissions.
    pub fn finalize_session(&self, session_id: SessionId) -> Result<FinalizeReport> {
        self.finalize_until(session_id, Instant::now() + self.config.engine.finalize_timeout())
    }

    fn finalize_until(&self, session_id: SessionId, deadline: Instant) -> Result<FinalizeReport> {
        let _gate = self.session_gate.lock();
        let info = self.lifecycle.start_finalizing(session_id)?;
        // Records enqueued after this are refused, so the drain below is complete
        self.queue.close_session(session_id);

        info!(
            session_id = %session_id,
            queued = self.queue.len(),
            "Finalizing session"
        );

        let started = Instant::now();
        let drained = self.drain_until(deadline);
        let dropped_on_timeout = if drained {
            0
        } else {
            let lost = self.queue.take_all();
            self.record_shutdown_loss(&lost);
            warn!(
                session_id = %session_id,
                waited_ms = started.elapsed().as_millis() as u64,
                dropped = lost.len(),
                "Drain timed out"
            );
            lost.len()
        };

        let ended_at = Utc::now();
        let total_recorded = match self.complete_in_store(session_id, ended_at) {
            Ok(total) => total,
            Err(e) => {
                self.lifecycle.abort_finalizing();
                self.queue.reopen_session(session_id);
                self.health
                    .mark_unhealthy(Component::Session, format!("finalize failed: {}", e));
                error!(session_id = %session_id, error = %e, "Could not finalize session");
                return Err(e);
            }
        };

        self.lifecycle.complete(session_id);
        self.queue.forget_session(session_id);
        self.metrics.set_queue_depth(self.queue.len());
        self.health.mark_healthy(Component::Session);

        info!(
            session_id = %session_id,
            total_recorded,
            submitted = self.metrics.submitted(),
            dropped = self.metrics.dropped_total(),
            duration_secs = (ended_at - info.started_at).num_seconds(),
            "Session finalized"
        );

        Ok(FinalizeReport {
            session_id,
            total_recorded,
            dropped_on_timeout,
            drained,
            started_at: info.started_at,
            ended_at,
        })
    }

    fn complete_in_store(&self, session_id: SessionId, ended_at: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.acquire()?;
        let total = conn.count_persisted_sequences(session_id)?;
        conn.complete_session(session_id, ended_at, total)?;
        Ok(total)
    }

    /// Run drain cycles until the queue is empty or the deadline passes.
    ///
    /// Always waits out a cycle already in flight, since its batch has left
    /// the queue but is not committed yet.
    fn drain_until(&self, deadline: Instant) -> bool {
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let Some(report) = self.coordinator.cycle_within(FlushTrigger::Drain, wait) else {
                return false;
            };
            if report.remaining == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if report.last_failure.is_some() || report.batches_committed == 0 {
                std::thread::sleep(DRAIN_BACKOFF.min(deadline.saturating_duration_since(Instant::now())));
            }
        }
    }

    fn record_shutdown_loss(&self, lost: &[QueuedRecord]) {
        if lost.is_empty() {
            return;
        }
        log_data_loss(DropReason::Shutdown, lost);
        self.metrics.record_dropped(DropReason::Shutdown, lost.len());
    }

    /// The active session, if any.
    pub fn active_session(&self) -> Option<SessionInfo> {
        self.lifecycle.active()
    }

    /// Most recent sessions, newest first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<StoredSession>> {
        let mut conn = self.pool.acquire()?;
        Ok(conn.recent_sessions(limit)?)
    }

    /// Load one session row.
    pub fn load_session(&self, session_id: SessionId) -> Result<StoredSession> {
        let mut conn = self.pool.acquire()?;
        Ok(conn.load_session(session_id)?)
    }

    // ---- administration ----

    /// Flush now, bypassing the circuit breaker.
    ///
    /// Collapses into a cycle that is already running.
    pub fn force_flush(&self) -> CycleReport {
        self.coordinator.try_cycle(FlushTrigger::Forced)
    }

    /// False while shut down, once the background flush worker has died,
    /// while any component is unhealthy, while the breaker is open, or
    /// within the error window after a store error.
    pub fn is_healthy(&self) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }
        if self
            .scheduler
            .as_ref()
            .is_some_and(|scheduler| !scheduler.is_running())
        {
            return false;
        }
        if self.health.overall_status() == HealthStatus::Unhealthy {
            return false;
        }
        if self.breaker.state() == CircuitState::Open {
            return false;
        }
        let window = Duration::from_secs(self.config.monitoring.unhealthy_error_window_secs);
        !self.metrics.has_error_within(window)
    }

    /// Snapshot for health endpoints.
    pub fn health_report(&self) -> HealthReport {
        HealthReport {
            status: self.health.overall_status(),
            healthy: self.is_healthy(),
            components: self.health.all_statuses(),
            circuit: self.breaker.state(),
            pool: self.pool.status(),
            queue_depth: self.queue.len(),
            session: self.lifecycle.active(),
            session_phase: self.lifecycle.phase_name(),
            uptime_secs: self.metrics.uptime().as_secs(),
        }
    }

    /// One-line performance summary.
    pub fn metrics_summary(&self) -> String {
        let status = self.pool.status();
        self.metrics.summary(status.active, status.max)
    }

    /// Metrics in Prometheus text format.
    pub fn export_prometheus_text(&self) -> String {
        self.metrics
            .export_prometheus_text(self.pool.status(), self.pool.counters())
    }

    /// Finalize any active session, drain, stop the worker and close the pool.
    ///
    /// Idempotent. Submits are refused from the first call on.
    pub fn shutdown(&self) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        info!(queued = self.queue.len(), "Shutting down persistence engine");

        if let Some(scheduler) = &self.scheduler {
            scheduler.signal_stop();
        }

        // One budget covers the session drain and the trailing drain
        let deadline = Instant::now() + self.config.engine.finalize_timeout();
        let finalized = match self.lifecycle.active() {
            Some(info) => match self.finalize_until(info.id, deadline) {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(session_id = %info.id, error = %e, "Session left active at shutdown");
                    None
                }
            },
            None => None,
        };

        let drained = self.drain_until(deadline);
        let dropped = if drained {
            0
        } else {
            let lost = self.queue.take_all();
            self.record_shutdown_loss(&lost);
            lost.len()
        };

        if let Some(scheduler) = &self.scheduler {
            scheduler.abort();
        }
        self.pool.close();

        info!(
            dropped,
            summary = %self.metrics_summary(),
            "Persistence engine stopped"
        );
        ShutdownReport { finalized, dropped }
    }

    // ---- accessors ----

    pub fn metrics(&self) -> &Arc<PerformanceRecorder> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
