//! Multi-table fan-out of one batch inside one transaction.
//!
//! Root rows go in first, one per record and in batch order, each returning
//! its own correlation key. Component tables follow in registry order. Any
//! failure rolls the whole batch back, so a record is visible in every
//! table its components populate or in none of them.

use crate::error::{FailureClass, PoolError, StoreError, StoreResult};
use crate::metrics::{ErrorType, PerformanceRecorder};
use crate::pool::ConnectionPool;
use crate::queue::QueuedRecord;
use crate::store::{ComponentRegistry, RootRow, StoreConnection};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// A committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWrite {
    pub records: usize,
    pub component_rows: usize,
    pub duration: Duration,
}

/// Why a batch did not commit.
#[derive(Debug, Error)]
pub enum WriteFailure {
    /// No connection could be obtained; nothing was attempted
    #[error("connection unavailable: {0}")]
    Acquire(#[from] PoolError),

    /// The transaction failed and was rolled back
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl WriteFailure {
    /// Retry classification. Acquire failures are transient.
    pub fn class(&self) -> FailureClass {
        match self {
            WriteFailure::Acquire(_) => FailureClass::Transient,
            WriteFailure::Store(e) => e.class(),
        }
    }

    /// Metrics label for the failure.
    pub fn error_type(&self) -> ErrorType {
        match self {
            WriteFailure::Acquire(_) => ErrorType::Exhaustion,
            WriteFailure::Store(e) => match e.class() {
                FailureClass::Transient => ErrorType::Transient,
                FailureClass::Structural => ErrorType::Structural,
            },
        }
    }
}

/// Rolls back on drop unless committed.
struct TransactionGuard<'c> {
    conn: &'c mut dyn StoreConnection,
    committed: bool,
}

impl<'c> TransactionGuard<'c> {
    fn begin(conn: &'c mut dyn StoreConnection) -> StoreResult<Self> {
        conn.begin()?;
        Ok(Self {
            conn,
            committed: false,
        })
    }

    fn conn(&mut self) -> &mut dyn StoreConnection {
        &mut *self.conn
    }

    fn commit(mut self) -> StoreResult<()> {
        self.conn.commit()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.conn.rollback() {
                warn!(error = %e, "Rollback failed");
            }
        }
    }
}

/// Writes batches across the root and component tables.
pub struct FanoutWriter {
    pool: Arc<ConnectionPool>,
    registry: Arc<ComponentRegistry>,
    metrics: Arc<PerformanceRecorder>,
}

impl FanoutWriter {
    pub fn new(
        pool: Arc<ConnectionPool>,
        registry: Arc<ComponentRegistry>,
        metrics: Arc<PerformanceRecorder>,
    ) -> Self {
        Self {
            pool,
            registry,
            metrics,
        }
    }

    /// Write one batch in one transaction.
    pub fn write(&self, batch: &[QueuedRecord]) -> Result<BatchWrite, WriteFailure> {
        if batch.is_empty() {
            return Ok(BatchWrite::default());
        }

        let started = Instant::now();
        let mut conn = self.pool.acquire()?;

        match self.write_in_transaction(&mut *conn, batch) {
            Ok(component_rows) => {
                drop(conn);
                let duration = started.elapsed();
                self.metrics
                    .record_batch_committed(batch.len(), component_rows, duration);
                debug!(
                    records = batch.len(),
                    rows = component_rows,
                    first_sequence = batch[0].sequence_number,
                    last_sequence = batch[batch.len() - 1].sequence_number,
                    duration_ms = duration.as_millis() as u64,
                    "Batch committed"
                );
                Ok(BatchWrite {
                    records: batch.len(),
                    component_rows,
                    duration,
                })
            }
            Err(e) => {
                if e.poisons_connection() {
                    conn.mark_broken();
                }
                drop(conn);
                self.metrics.record_rollback();
                warn!(
                    class = e.class().as_label(),
                    error = %e,
                    records = batch.len(),
                    first_sequence = batch[0].sequence_number,
                    "Batch rolled back"
                );
                Err(WriteFailure::Store(e))
            }
        }
    }

    fn timed<T>(&self, op: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
        let started = Instant::now();
        let result = op();
        self.metrics
            .record_call(started.elapsed().as_nanos() as u64);
        result
    }

    /// Returns the number of component rows written.
    fn write_in_transaction(
        &self,
        conn: &mut dyn StoreConnection,
        batch: &[QueuedRecord],
    ) -> StoreResult<usize> {
        let mut tx = self.timed(|| TransactionGuard::begin(conn))?;

        let roots: Vec<RootRow> = batch
            .iter()
            .map(|queued| RootRow {
                session_id: queued.session_id,
                sequence_number: queued.sequence_number,
                captured_at: queued.record.captured_at(),
                capture_duration_nanos: queued.record.capture_duration_nanos(),
                component_count: queued.record.component_count() as u32,
                processing_time_ms: queued.enqueued_at.elapsed().as_millis() as i64,
            })
            .collect();

        let keys = self.timed(|| tx.conn().insert_roots(&roots))?;
        if keys.len() != batch.len() {
            return Err(StoreError::KeyMismatch {
                expected: batch.len(),
                actual: keys.len(),
            });
        }

        let mut written = 0;
        for table in self.registry.tables() {
            let mut rows = Vec::new();
            for (queued, key) in batch.iter().zip(&keys) {
                rows.extend(table.build_rows(queued, *key)?);
            }
            if rows.is_empty() {
                continue;
            }
            written += self.timed(|| tx.conn().insert_component_rows(table, &rows))?;
        }

        self.timed(|| tx.commit())?;
        Ok(written)
    }
}
