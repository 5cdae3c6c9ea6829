//! Relational store contract and backends.
//!
//! The engine talks to the store only through [`StoreConnection`], handed
//! out by a [`ConnectionFactory`] via the connection pool. Two backends
//! are provided: [`sqlite`] for durable storage and [`memory`] for dry runs
//! and fault-injection tests.

pub mod memory;
pub mod registry;
pub mod schema;
pub mod sqlite;

pub use memory::{MemoryStore, StoredComponentRow, StoredRoot};
pub use registry::{ColumnKind, ColumnSpec, ComponentRegistry, ComponentTable, RowShape};
pub use sqlite::SqliteConnectionFactory;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::record::{CorrelationKey, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Root row written for every record of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RootRow {
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub captured_at: DateTime<Utc>,
    pub capture_duration_nanos: i64,
    pub component_count: u32,
    pub processing_time_ms: i64,
}

/// Scalar column value extracted from a component payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// One row of a component table, joinable to its root row.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRow {
    pub session_id: SessionId,
    pub key: CorrelationKey,
    pub sequence_number: u64,
    pub captured_at: DateTime<Utc>,
    /// Position within a list payload, for per-element tables
    pub element_index: Option<u32>,
    /// Values for the table's column specs, in spec order
    pub values: Vec<ColumnValue>,
    /// Full JSON sub-payload
    pub payload: String,
}

/// Session status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Completed => "COMPLETED",
        }
    }

    /// Parse a column value.
    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "ACTIVE" => Ok(SessionStatus::Active),
            "COMPLETED" => Ok(SessionStatus::Completed),
            other => Err(StoreError::Backend(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

/// Values for a new session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub uuid: Uuid,
    pub player_name: Option<String>,
    pub activity_type: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A session row as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSession {
    pub id: SessionId,
    pub uuid: Uuid,
    pub player_name: Option<String>,
    pub activity_type: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub total_recorded: u64,
}

/// One open connection to the relational store.
///
/// Implementations are used from one thread at a time; the pool moves them
/// between threads.
pub trait StoreConnection: Send {
    /// Cheap liveness probe.
    fn ping(&mut self) -> StoreResult<()>;

    /// Start a transaction.
    fn begin(&mut self) -> StoreResult<()>;

    /// Commit the open transaction.
    fn commit(&mut self) -> StoreResult<()>;

    /// Roll back the open transaction. A no-op when none is open.
    fn rollback(&mut self) -> StoreResult<()>;

    /// Insert root rows in order, returning one key per row in the same order.
    ///
    /// Each key is obtained from its own insert, never matched up afterwards.
    fn insert_roots(&mut self, rows: &[RootRow]) -> StoreResult<Vec<CorrelationKey>>;

    /// Insert rows into one component table. Returns rows written.
    fn insert_component_rows(
        &mut self,
        table: &ComponentTable,
        rows: &[ComponentRow],
    ) -> StoreResult<usize>;

    /// Insert an ACTIVE session row and return its id.
    fn create_session(&mut self, session: &NewSession) -> StoreResult<SessionId>;

    /// Distinct sequence numbers persisted for a session.
    fn count_persisted_sequences(&mut self, session_id: SessionId) -> StoreResult<u64>;

    /// Mark a session COMPLETED with its verified total.
    fn complete_session(
        &mut self,
        session_id: SessionId,
        ended_at: DateTime<Utc>,
        total_recorded: u64,
    ) -> StoreResult<()>;

    /// Load one session row.
    fn load_session(&mut self, session_id: SessionId) -> StoreResult<StoredSession>;

    /// Most recent sessions, newest first.
    fn recent_sessions(&mut self, limit: usize) -> StoreResult<Vec<StoredSession>>;

    /// Names of required tables that do not exist.
    fn missing_tables(&mut self, registry: &ComponentRegistry) -> StoreResult<Vec<String>>;

    /// Fail with [`StoreError::Schema`] naming every missing table.
    fn verify_schema(&mut self, registry: &ComponentRegistry) -> StoreResult<()> {
        let missing = self.missing_tables(registry)?;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Schema(format!(
                "missing tables: {}",
                missing.join(", ")
            )))
        }
    }

    /// Create missing tables. Returns how many were created.
    fn provision_schema(&mut self, registry: &ComponentRegistry) -> StoreResult<usize>;
}

/// Opens new store connections for the pool.
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection.
    fn connect(&self) -> StoreResult<Box<dyn StoreConnection>>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Build the connection factory selected by configuration.
pub fn open_factory(config: &StoreConfig) -> Arc<dyn ConnectionFactory> {
    match config.backend {
        StoreBackend::Sqlite => Arc::new(SqliteConnectionFactory::new(
            config.path.clone(),
            Duration::from_millis(config.busy_timeout_ms),
        )),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    }
}
