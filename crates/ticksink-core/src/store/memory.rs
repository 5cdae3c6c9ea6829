//! In-memory backend.
//!
//! Behaves like the SQLite backend as far as the engine can observe:
//! transactions buffer their writes until commit, root keys come from a
//! shared counter, and `(session, sequence)` uniqueness plus foreign keys
//! are enforced. A fault plan lets tests fail connects, pings, commits,
//! specific tables or specific sequence numbers.

use super::registry::{ComponentRegistry, ComponentTable};
use super::schema;
use super::{
    ColumnValue, ComponentRow, ConnectionFactory, NewSession, RootRow, SessionStatus,
    StoreConnection, StoredSession,
};
use crate::error::{FailureClass, StoreError, StoreResult};
use crate::record::{CorrelationKey, SessionId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// A committed root row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRoot {
    pub key: CorrelationKey,
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub captured_at: DateTime<Utc>,
    pub capture_duration_nanos: i64,
    pub component_count: u32,
    pub processing_time_ms: i64,
}

/// A committed component row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredComponentRow {
    pub table: &'static str,
    pub key: CorrelationKey,
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub element_index: Option<u32>,
    pub values: Vec<ColumnValue>,
    pub payload: String,
}

#[derive(Default)]
struct FaultPlan {
    refuse_connects: u32,
    fail_pings: u32,
    fail_commits: u32,
    tables: HashMap<String, (u32, FailureClass)>,
    poisoned: HashSet<u64>,
    always: Option<FailureClass>,
}

fn injected(class: FailureClass, what: &str) -> StoreError {
    match class {
        FailureClass::Transient => StoreError::Timeout(format!("injected fault: {}", what)),
        FailureClass::Structural => StoreError::Constraint(format!("injected fault: {}", what)),
    }
}

struct MemoryState {
    provisioned: HashSet<String>,
    sessions: BTreeMap<i64, StoredSession>,
    roots: Vec<StoredRoot>,
    rows: Vec<StoredComponentRow>,
    next_session: i64,
    next_key: i64,
    connects: u64,
    faults: FaultPlan,
}

impl MemoryState {
    fn root_exists(&self, key: CorrelationKey) -> bool {
        self.roots.iter().any(|r| r.key == key)
    }

    fn sequence_exists(&self, session_id: SessionId, sequence: u64) -> bool {
        self.roots
            .iter()
            .any(|r| r.session_id == session_id && r.sequence_number == sequence)
    }

    fn require_table(&self, table: &str) -> StoreResult<()> {
        if self.provisioned.contains(table) {
            Ok(())
        } else {
            Err(StoreError::Schema(format!("no such table: {}", table)))
        }
    }
}

/// Shared in-memory database. Clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store with every table already present.
    pub fn new() -> Self {
        let store = Self::unprovisioned();
        {
            let mut state = store.state.lock();
            for table in schema::required_tables(&ComponentRegistry::standard()) {
                state.provisioned.insert(table.to_string());
            }
        }
        store
    }

    /// A store with no tables.
    pub fn unprovisioned() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                provisioned: HashSet::new(),
                sessions: BTreeMap::new(),
                roots: Vec::new(),
                rows: Vec::new(),
                next_session: 1,
                next_key: 1,
                connects: 0,
                faults: FaultPlan::default(),
            })),
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next_connects(&self, n: u32) {
        self.state.lock().faults.refuse_connects = n;
    }

    /// Fail the next `n` liveness probes.
    pub fn fail_next_pings(&self, n: u32) {
        self.state.lock().faults.fail_pings = n;
    }

    /// Fail the next `n` commits.
    pub fn fail_next_commits(&self, n: u32) {
        self.state.lock().faults.fail_commits = n;
    }

    /// Fail the next `n` inserts into `table` with an error of `class`.
    pub fn fail_table(&self, table: &str, n: u32, class: FailureClass) {
        self.state
            .lock()
            .faults
            .tables
            .insert(table.to_string(), (n, class));
    }

    /// Reject every root insert for `sequence` with a constraint violation.
    pub fn poison_sequence(&self, sequence: u64) {
        self.state.lock().faults.poisoned.insert(sequence);
    }

    /// Fail every root insert with `class` until cleared with `None`.
    pub fn fail_always(&self, class: Option<FailureClass>) {
        self.state.lock().faults.always = class;
    }

    /// Committed root rows for a session, in key order.
    pub fn roots(&self, session_id: SessionId) -> Vec<StoredRoot> {
        self.state
            .lock()
            .roots
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Committed rows of one component table.
    pub fn rows(&self, table: &str) -> Vec<StoredComponentRow> {
        self.state
            .lock()
            .rows
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    /// Committed row count of one table, root and sessions included.
    pub fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock();
        match table {
            schema::ROOT_TABLE => state.roots.len(),
            schema::SESSIONS_TABLE => state.sessions.len(),
            _ => state.rows.iter().filter(|r| r.table == table).count(),
        }
    }

    /// Committed rows across root and component tables.
    pub fn total_rows(&self) -> usize {
        let state = self.state.lock();
        state.roots.len() + state.rows.len()
    }

    /// One session row.
    pub fn session(&self, session_id: SessionId) -> Option<StoredSession> {
        self.state.lock().sessions.get(&session_id.0).cloned()
    }

    /// Connections opened so far.
    pub fn connects(&self) -> u64 {
        self.state.lock().connects
    }
}

impl ConnectionFactory for MemoryStore {
    fn connect(&self) -> StoreResult<Box<dyn StoreConnection>> {
        let mut state = self.state.lock();
        if state.faults.refuse_connects > 0 {
            state.faults.refuse_connects -= 1;
            return Err(StoreError::ConnectionLost(
                "injected fault: connection refused".into(),
            ));
        }
        state.connects += 1;
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            pending: None,
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Default)]
struct Pending {
    roots: Vec<StoredRoot>,
    rows: Vec<StoredComponentRow>,
}

/// A connection to a [`MemoryStore`].
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    pending: Option<Pending>,
}

impl MemoryConnection {
    fn pending_root_exists(&self, key: CorrelationKey) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.roots.iter().any(|r| r.key == key))
    }

    fn pending_sequence_exists(&self, session_id: SessionId, sequence: u64) -> bool {
        self.pending.as_ref().is_some_and(|p| {
            p.roots
                .iter()
                .any(|r| r.session_id == session_id && r.sequence_number == sequence)
        })
    }

    fn apply(&mut self, roots: Vec<StoredRoot>, rows: Vec<StoredComponentRow>) {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.roots.extend(roots);
                pending.rows.extend(rows);
            }
            None => {
                let mut state = self.state.lock();
                state.roots.extend(roots);
                state.rows.extend(rows);
            }
        }
    }
}

impl StoreConnection for MemoryConnection {
    fn ping(&mut self) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.faults.fail_pings > 0 {
            state.faults.fail_pings -= 1;
            return Err(StoreError::ConnectionLost("injected fault: ping".into()));
        }
        Ok(())
    }

    fn begin(&mut self) -> StoreResult<()> {
        if self.pending.is_some() {
            return Err(StoreError::Backend(
                "cannot start a transaction within a transaction".into(),
            ));
        }
        self.pending = Some(Pending::default());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let Some(pending) = self.pending.take() else {
            return Err(StoreError::Backend("no transaction is active".into()));
        };
        let mut state = self.state.lock();
        if state.faults.fail_commits > 0 {
            state.faults.fail_commits -= 1;
            return Err(StoreError::CommitFailed("injected fault: commit".into()));
        }
        state.roots.extend(pending.roots);
        state.rows.extend(pending.rows);
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.pending = None;
        Ok(())
    }

    fn insert_roots(&mut self, rows: &[RootRow]) -> StoreResult<Vec<CorrelationKey>> {
        let mut stored = Vec::with_capacity(rows.len());
        {
            let mut state = self.state.lock();
            state.require_table(schema::ROOT_TABLE)?;
            if let Some(class) = state.faults.always {
                return Err(injected(class, "store outage"));
            }

            for row in rows {
                if state.faults.poisoned.contains(&row.sequence_number) {
                    return Err(StoreError::Constraint(format!(
                        "injected fault: sequence {} rejected",
                        row.sequence_number
                    )));
                }
                if !state.sessions.contains_key(&row.session_id.0) {
                    return Err(StoreError::Constraint(format!(
                        "FOREIGN KEY constraint failed: session {}",
                        row.session_id
                    )));
                }
                let duplicate = state.sequence_exists(row.session_id, row.sequence_number)
                    || self.pending_sequence_exists(row.session_id, row.sequence_number)
                    || stored.iter().any(|r: &StoredRoot| {
                        r.session_id == row.session_id && r.sequence_number == row.sequence_number
                    });
                if duplicate {
                    return Err(StoreError::Constraint(format!(
                        "UNIQUE constraint failed: game_ticks (session {}, tick {})",
                        row.session_id, row.sequence_number
                    )));
                }

                let key = CorrelationKey(state.next_key);
                state.next_key += 1;
                stored.push(StoredRoot {
                    key,
                    session_id: row.session_id,
                    sequence_number: row.sequence_number,
                    captured_at: row.captured_at,
                    capture_duration_nanos: row.capture_duration_nanos,
                    component_count: row.component_count,
                    processing_time_ms: row.processing_time_ms,
                });
            }
        }

        let keys = stored.iter().map(|r| r.key).collect();
        self.apply(stored, Vec::new());
        Ok(keys)
    }

    fn insert_component_rows(
        &mut self,
        table: &ComponentTable,
        rows: &[ComponentRow],
    ) -> StoreResult<usize> {
        let mut stored = Vec::with_capacity(rows.len());
        {
            let mut state = self.state.lock();
            state.require_table(table.table)?;

            if let Some((remaining, class)) = state.faults.tables.get_mut(table.table) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(injected(*class, table.table));
                }
            }

            for row in rows {
                if row.values.len() != table.columns.len() {
                    return Err(StoreError::MalformedPayload {
                        table: table.table.to_string(),
                        message: format!(
                            "expected {} column values, got {}",
                            table.columns.len(),
                            row.values.len()
                        ),
                    });
                }
                if !state.root_exists(row.key) && !self.pending_root_exists(row.key) {
                    return Err(StoreError::Constraint(format!(
                        "FOREIGN KEY constraint failed: {} references tick {}",
                        table.table, row.key
                    )));
                }
                stored.push(StoredComponentRow {
                    table: table.table,
                    key: row.key,
                    session_id: row.session_id,
                    sequence_number: row.sequence_number,
                    element_index: row.element_index,
                    values: row.values.clone(),
                    payload: row.payload.clone(),
                });
            }
        }

        let written = stored.len();
        self.apply(Vec::new(), stored);
        Ok(written)
    }

    fn create_session(&mut self, session: &NewSession) -> StoreResult<SessionId> {
        let mut state = self.state.lock();
        state.require_table(schema::SESSIONS_TABLE)?;
        if state.sessions.values().any(|s| s.uuid == session.uuid) {
            return Err(StoreError::Constraint(format!(
                "UNIQUE constraint failed: sessions.session_uuid {}",
                session.uuid
            )));
        }
        let id = SessionId(state.next_session);
        state.next_session += 1;
        state.sessions.insert(
            id.0,
            StoredSession {
                id,
                uuid: session.uuid,
                player_name: session.player_name.clone(),
                activity_type: session.activity_type.clone(),
                started_at: session.started_at,
                ended_at: None,
                status: SessionStatus::Active,
                total_recorded: 0,
            },
        );
        Ok(id)
    }

    fn count_persisted_sequences(&mut self, session_id: SessionId) -> StoreResult<u64> {
        let state = self.state.lock();
        let distinct: HashSet<u64> = state
            .roots
            .iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.sequence_number)
            .collect();
        Ok(distinct.len() as u64)
    }

    fn complete_session(
        &mut self,
        session_id: SessionId,
        ended_at: DateTime<Utc>,
        total_recorded: u64,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&session_id.0)
            .ok_or(StoreError::SessionNotFound(session_id))?;
        session.status = SessionStatus::Completed;
        session.ended_at = Some(ended_at);
        session.total_recorded = total_recorded;
        Ok(())
    }

    fn load_session(&mut self, session_id: SessionId) -> StoreResult<StoredSession> {
        self.state
            .lock()
            .sessions
            .get(&session_id.0)
            .cloned()
            .ok_or(StoreError::SessionNotFound(session_id))
    }

    fn recent_sessions(&mut self, limit: usize) -> StoreResult<Vec<StoredSession>> {
        Ok(self
            .state
            .lock()
            .sessions
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    fn missing_tables(&mut self, registry: &ComponentRegistry) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        Ok(schema::required_tables(registry)
            .into_iter()
            .filter(|t| !state.provisioned.contains(*t))
            .map(str::to_string)
            .collect())
    }

    fn provision_schema(&mut self, registry: &ComponentRegistry) -> StoreResult<usize> {
        let mut state = self.state.lock();
        let mut created = 0;
        for table in schema::required_tables(registry) {
            if state.provisioned.insert(table.to_string()) {
                created += 1;
            }
        }
        Ok(created)
    }
}
