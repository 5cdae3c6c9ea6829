//! Background flush worker.
//!
//! One tokio task waits on three things: a size wake-up from `submit`, a
//! fixed-delay flush timer and the periodic summary timer. Flush cycles run
//! on the blocking pool so store I/O never stalls the runtime.

use super::flush::{FlushCoordinator, FlushTrigger};
use crate::error::{Error, Result};
use crate::metrics::PerformanceRecorder;
use crate::pool::ConnectionPool;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Timers driving the background worker.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerTimings {
    pub flush_interval: Duration,
    pub summary_interval: Duration,
    /// Queue length at which a finished cycle immediately wakes the next one
    pub batch_size: usize,
}

/// Handle to the background flush task.
pub struct BatchScheduler {
    wake: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchScheduler {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(
        coordinator: Arc<FlushCoordinator>,
        pool: Arc<ConnectionPool>,
        metrics: Arc<PerformanceRecorder>,
        timings: SchedulerTimings,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::Config("background flush mode must be started inside a tokio runtime".into())
        })?;

        let wake = Arc::new(Notify::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();

        let handle = runtime.spawn(run_worker(
            coordinator,
            pool,
            metrics,
            timings,
            Arc::clone(&wake),
            shutdown_rx,
        ));

        info!(
            flush_interval_ms = timings.flush_interval.as_millis() as u64,
            summary_interval_secs = timings.summary_interval.as_secs(),
            "Flush scheduler started"
        );

        Ok(Self {
            wake,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask for a size-triggered cycle. Coalesces with any pending wake-up.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop the worker after its current cycle.
    pub fn signal_stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Stop the worker without waiting for it.
    pub fn abort(&self) {
        self.signal_stop();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// Whether the worker task is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

async fn run_worker(
    coordinator: Arc<FlushCoordinator>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<PerformanceRecorder>,
    timings: SchedulerTimings,
    wake: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let now = Instant::now();
    let mut flush_timer = interval_at(now + timings.flush_interval, timings.flush_interval);
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut summary_timer = interval_at(now + timings.summary_interval, timings.summary_interval);
    summary_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Flush scheduler received shutdown signal");
                break;
            }
            _ = wake.notified() => FlushTrigger::Size,
            _ = flush_timer.tick() => FlushTrigger::Timer,
            _ = summary_timer.tick() => {
                log_summary(&pool, &metrics);
                continue;
            }
        };

        let cycle = Arc::clone(&coordinator);
        match tokio::task::spawn_blocking(move || cycle.try_cycle(trigger)).await {
            Ok(report) => {
                // Fixed delay: the next timer cycle starts a full interval after this one
                flush_timer.reset();
                let backlog = !report.collapsed
                    && report.last_failure.is_none()
                    && report.remaining >= timings.batch_size;
                if backlog {
                    wake.notify_one();
                }
            }
            Err(e) => {
                error!(error = %e, trigger = %trigger, "Flush cycle task failed");
            }
        }
    }

    debug!("Flush scheduler stopped");
}

fn log_summary(pool: &ConnectionPool, metrics: &PerformanceRecorder) {
    let status = pool.status();
    let counters = pool.counters();
    info!(
        queue_depth = metrics.queue_depth(),
        errors = metrics.errors_total(),
        dropped = metrics.dropped_total(),
        pool_created = counters.created,
        pool_discarded = counters.discarded,
        "{}",
        metrics.summary(status.active, status.max)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::config::{BreakerConfig, PoolConfig};
    use crate::engine::fanout::FanoutWriter;
    use crate::engine::retry::RetryRequeuePolicy;
    use crate::health::HealthCheck;
    use crate::queue::IngestQueue;
    use crate::record::{CompositeRecord, SessionId};
    use crate::store::{ComponentRegistry, ConnectionFactory, MemoryStore, NewSession};
    use chrono::Utc;

    struct Rig {
        store: MemoryStore,
        queue: Arc<IngestQueue>,
        coordinator: Arc<FlushCoordinator>,
        pool: Arc<ConnectionPool>,
        metrics: Arc<PerformanceRecorder>,
        session: SessionId,
    }

    fn rig() -> Rig {
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
            ConnectionPool::open(Arc::new(store.clone()), PoolConfig::default()).unwrap(),
        );
        let metrics = Arc::new(PerformanceRecorder::new());
        let queue = Arc::new(IngestQueue::new(1_000, 100));
        let coordinator = Arc::new(FlushCoordinator::new(
            Arc::clone(&queue),
            FanoutWriter::new(
                Arc::clone(&pool),
                Arc::new(ComponentRegistry::standard()),
                Arc::clone(&metrics),
            ),
            RetryRequeuePolicy::new(3, Arc::clone(&metrics)),
            Arc::new(CircuitBreaker::new(&BreakerConfig::default())),
            Arc::new(HealthCheck::new()),
            Arc::clone(&metrics),
            10,
        ));
        Rig {
            store,
            queue,
            coordinator,
            pool,
            metrics,
            session,
        }
    }

    fn enqueue(rig: &Rig, range: std::ops::RangeInclusive<u64>) {
        for seq in range {
            rig.queue
                .enqueue(
                    CompositeRecord::builder()
                        .session(rig.session)
                        .sequence(seq)
                        .capture_duration_nanos(100)
                        .build(),
                )
                .unwrap();
        }
    }

    async fn wait_for_roots(rig: &Rig, expected: usize) -> bool {
        for _ in 0..200 {
            if rig.store.roots(rig.session).len() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_spawn_requires_runtime() {
        let rig = rig();
        let result = BatchScheduler::spawn(
            rig.coordinator,
            rig.pool,
            rig.metrics,
            SchedulerTimings {
                flush_interval: Duration::from_secs(1),
                summary_interval: Duration::from_secs(30),
                batch_size: 10,
            },
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wake_flushes_backlog() {
        let rig = rig();
        let scheduler = BatchScheduler::spawn(
            Arc::clone(&rig.coordinator),
            Arc::clone(&rig.pool),
            Arc::clone(&rig.metrics),
            SchedulerTimings {
                flush_interval: Duration::from_secs(3600),
                summary_interval: Duration::from_secs(3600),
                batch_size: 10,
            },
        )
        .unwrap();

        enqueue(&rig, 1..=35);
        scheduler.wake();
        assert!(wait_for_roots(&rig, 35).await);
        assert!(rig.queue.is_empty());

        scheduler.abort();
        assert!(!scheduler.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timer_flushes_partial_batch() {
        let rig = rig();
        let scheduler = BatchScheduler::spawn(
            Arc::clone(&rig.coordinator),
            Arc::clone(&rig.pool),
            Arc::clone(&rig.metrics),
            SchedulerTimings {
                flush_interval: Duration::from_millis(20),
                summary_interval: Duration::from_secs(3600),
                batch_size: 10,
            },
        )
        .unwrap();

        enqueue(&rig, 1..=3);
        assert!(wait_for_roots(&rig, 3).await);
        scheduler.signal_stop();
    }
}
