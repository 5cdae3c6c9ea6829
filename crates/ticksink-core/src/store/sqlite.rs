//! SQLite backend.
//!
//! One `rusqlite::Connection` per pooled connection. Transactions are
//! `BEGIN IMMEDIATE` so lock contention surfaces at begin time as a
//! transient error instead of midway through a batch.

use super::registry::{ComponentRegistry, ComponentTable};
use super::schema::{self, ROOT_TABLE, SESSIONS_TABLE};
use super::{
    ColumnValue, ComponentRow, ConnectionFactory, NewSession, RootRow, SessionStatus,
    StoreConnection, StoredSession,
};
use crate::error::{StoreError, StoreResult};
use crate::record::{CorrelationKey, SessionId};
use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, ToSql};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Opens SQLite connections to one database file.
pub struct SqliteConnectionFactory {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnectionFactory {
    /// Create a factory for `path`.
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }
}

impl ConnectionFactory for SqliteConnectionFactory {
    fn connect(&self) -> StoreResult<Box<dyn StoreConnection>> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::ConnectionLost(format!("{}: {}", self.path.display(), e)))?;

        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.set_prepared_statement_cache_capacity(64);

        debug!(path = %self.path.display(), "Opened sqlite connection");
        Ok(Box::new(SqliteConnection { conn }))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

/// A pooled SQLite connection.
pub struct SqliteConnection {
    conn: Connection,
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ColumnValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            ColumnValue::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            ColumnValue::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            ColumnValue::Text(s) => ToSqlOutput::Borrowed(s.as_str().into()),
        })
    }
}

fn sequence_param(sequence: u64) -> StoreResult<i64> {
    i64::try_from(sequence).map_err(|_| StoreError::MalformedPayload {
        table: ROOT_TABLE.to_string(),
        message: format!("sequence number {} out of range", sequence),
    })
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp '{}': {}", raw, e)))
}

const SESSION_COLUMNS: &str = "session_id, session_uuid, player_name, activity_type, \
                               start_time, end_time, status, total_recorded";

type SessionRow = (
    i64,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    String,
    i64,
);

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_session(raw: SessionRow) -> StoreResult<StoredSession> {
    let (id, uuid, player_name, activity_type, start, end, status, total) = raw;
    Ok(StoredSession {
        id: SessionId(id),
        uuid: Uuid::parse_str(&uuid)
            .map_err(|e| StoreError::Backend(format!("bad session uuid: {}", e)))?,
        player_name,
        activity_type,
        started_at: parse_time(&start)?,
        ended_at: end.as_deref().map(parse_time).transpose()?,
        status: SessionStatus::parse(&status)?,
        total_recorded: u64::try_from(total).unwrap_or(0),
    })
}

impl StoreConnection for SqliteConnection {
    fn ping(&mut self) -> StoreResult<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| StoreError::ConnectionLost(e.to_string()))
    }

    fn begin(&mut self) -> StoreResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT").map_err(|e| {
            match StoreError::from(e) {
                StoreError::Constraint(msg) => StoreError::Constraint(msg),
                other => StoreError::CommitFailed(other.to_string()),
            }
        })
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn insert_roots(&mut self, rows: &[RootRow]) -> StoreResult<Vec<CorrelationKey>> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO game_ticks (session_id, tick_number, captured_at, capture_duration_ns, \
             component_count, processing_time_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             RETURNING tick_id",
        )?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let key: i64 = stmt.query_row(
                params![
                    row.session_id.0,
                    sequence_param(row.sequence_number)?,
                    row.captured_at.to_rfc3339(),
                    row.capture_duration_nanos,
                    row.component_count,
                    row.processing_time_ms,
                ],
                |r| r.get(0),
            )?;
            keys.push(CorrelationKey(key));
        }
        Ok(keys)
    }

    fn insert_component_rows(
        &mut self,
        table: &ComponentTable,
        rows: &[ComponentRow],
    ) -> StoreResult<usize> {
        let sql = schema::component_insert_sql(table);
        let mut stmt = self.conn.prepare_cached(&sql)?;

        let mut written = 0;
        for row in rows {
            let session = row.session_id.0;
            let key = row.key.0;
            let sequence = sequence_param(row.sequence_number)?;
            let captured_at = row.captured_at.to_rfc3339();
            let element_index = row.element_index.map(i64::from);

            let mut bound: Vec<&dyn ToSql> = vec![&session, &key, &sequence, &captured_at];
            if let Some(index) = element_index.as_ref() {
                bound.push(index);
            }
            for value in &row.values {
                bound.push(value);
            }
            bound.push(&row.payload);

            written += stmt
                .execute(bound.as_slice())
                .map_err(|e| match StoreError::from(e) {
                    StoreError::MalformedPayload { message, .. } => StoreError::MalformedPayload {
                        table: table.table.to_string(),
                        message,
                    },
                    other => other,
                })?;
        }
        Ok(written)
    }

    fn create_session(&mut self, session: &NewSession) -> StoreResult<SessionId> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO sessions (session_uuid, player_name, activity_type, start_time, status, \
             total_recorded) VALUES (?1, ?2, ?3, ?4, ?5, 0) RETURNING session_id",
            params![
                session.uuid.to_string(),
                session.player_name,
                session.activity_type,
                session.started_at.to_rfc3339(),
                SessionStatus::Active.as_str(),
            ],
            |row| row.get(0),
        )?;
        Ok(SessionId(id))
    }

    fn count_persisted_sequences(&mut self, session_id: SessionId) -> StoreResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT tick_number) FROM game_ticks WHERE session_id = ?1",
            params![session_id.0],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn complete_session(
        &mut self,
        session_id: SessionId,
        ended_at: DateTime<Utc>,
        total_recorded: u64,
    ) -> StoreResult<()> {
        let total = i64::try_from(total_recorded).unwrap_or(i64::MAX);
        let changed = self.conn.execute(
            "UPDATE sessions SET status = ?2, end_time = ?3, total_recorded = ?4 \
             WHERE session_id = ?1",
            params![
                session_id.0,
                SessionStatus::Completed.as_str(),
                ended_at.to_rfc3339(),
                total,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id));
        }
        Ok(())
    }

    fn load_session(&mut self, session_id: SessionId) -> StoreResult<StoredSession> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM {SESSIONS_TABLE} WHERE session_id = ?1");
        let raw = self
            .conn
            .query_row(&sql, params![session_id.0], read_session_row)
            .optional()?
            .ok_or(StoreError::SessionNotFound(session_id))?;
        into_session(raw)
    }

    fn recent_sessions(&mut self, limit: usize) -> StoreResult<Vec<StoredSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM {SESSIONS_TABLE} ORDER BY session_id DESC LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], read_session_row)?;

        let mut sessions = Vec::new();
        for raw in rows {
            sessions.push(into_session(raw?)?);
        }
        Ok(sessions)
    }

    fn missing_tables(&mut self, registry: &ComponentRegistry) -> StoreResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
        let mut missing = Vec::new();
        for table in schema::required_tables(registry) {
            if !stmt.exists(params![table])? {
                missing.push(table.to_string());
            }
        }
        Ok(missing)
    }

    fn provision_schema(&mut self, registry: &ComponentRegistry) -> StoreResult<usize> {
        let missing = self.missing_tables(registry)?.len();
        let tx = self.conn.transaction()?;
        for statement in schema::ddl_statements(registry) {
            tx.execute_batch(&statement)
                .map_err(|e| StoreError::Schema(e.to_string()))?;
        }
        tx.commit()?;
        Ok(missing)
    }
}
