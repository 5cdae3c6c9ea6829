//! Error types for the ticksink core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Backend failures carry a [`FailureClass`] so the retry policy can tell a
//! dropped connection apart from a record that will never insert.

use crate::record::SessionId;
use thiserror::Error;

/// Result type alias for ticksink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Top-level error type for ticksink.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relational store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Connection pool error
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Session lifecycle error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// How a failed write should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Connection loss, timeouts, busy backend. Retrying the same batch can succeed.
    Transient,
    /// Constraint violations and malformed payloads. Recurs deterministically.
    Structural,
}

impl FailureClass {
    /// Label used in logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Structural => "structural",
        }
    }
}

/// Relational store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection to the store was lost or could not be opened
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Store was busy or an operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Commit did not complete
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Constraint violation (unique, foreign key, check, trigger abort)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Payload could not be mapped to table columns
    #[error("Malformed payload for {table}: {message}")]
    MalformedPayload { table: String, message: String },

    /// Root insert produced a different number of keys than rows
    #[error("Correlation key mismatch: expected {expected} keys, got {actual}")]
    KeyMismatch { expected: usize, actual: usize },

    /// Required tables are missing or malformed
    #[error("Schema error: {0}")]
    Schema(String),

    /// Session row not found
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    /// Any other backend error
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Classify the error for the retry policy.
    pub fn class(&self) -> FailureClass {
        match self {
            StoreError::ConnectionLost(_)
            | StoreError::Timeout(_)
            | StoreError::CommitFailed(_) => FailureClass::Transient,
            StoreError::Constraint(_)
            | StoreError::MalformedPayload { .. }
            | StoreError::KeyMismatch { .. }
            | StoreError::Schema(_)
            | StoreError::SessionNotFound(_)
            | StoreError::Backend(_) => FailureClass::Structural,
        }
    }

    /// Whether the connection that raised this error should be discarded.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLost(_) | StoreError::CommitFailed(_)
        )
    }
}

/// Connection pool errors.
#[derive(Error, Debug)]
pub enum PoolError {
    /// No connection became available in time
    #[error("Timed out after {waited_ms}ms waiting for a connection")]
    AcquireTimeout { waited_ms: u64 },

    /// The store could not be reached at all
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Pool has been closed
    #[error("Pool closed")]
    Closed,
}

/// Session lifecycle errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// A session is already active on this engine
    #[error("Session {0} is already active")]
    AlreadyActive(SessionId),

    /// The given session is not the active one
    #[error("Session {0} is not active")]
    NotActive(SessionId),

    /// The engine has already completed its session
    #[error("Session {0} already completed")]
    AlreadyCompleted(SessionId),

    /// Drain did not finish before the finalize timeout
    #[error("Drain timed out after {timeout_ms}ms with {remaining} records queued")]
    DrainTimeout { timeout_ms: u64, remaining: usize },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation => StoreError::Constraint(err.to_string()),
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StoreError::Timeout(err.to_string())
                }
                ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::DiskFull => StoreError::ConnectionLost(err.to_string()),
                _ => StoreError::Backend(err.to_string()),
            },
            rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::InvalidParameterCount(..)
            | rusqlite::Error::ToSqlConversionFailure(_) => StoreError::MalformedPayload {
                table: "unknown".into(),
                message: err.to_string(),
            },
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let err: Error = StoreError::ConnectionLost("socket closed".into()).into();
        assert!(err.to_string().contains("Connection lost"));
    }

    #[test]
    fn test_store_error_classification() {
        assert_eq!(
            StoreError::Timeout("busy".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            StoreError::CommitFailed("io".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            StoreError::Constraint("UNIQUE".into()).class(),
            FailureClass::Structural
        );
        assert_eq!(
            StoreError::KeyMismatch {
                expected: 3,
                actual: 2
            }
            .class(),
            FailureClass::Structural
        );
    }

    #[test]
    fn test_connection_poisoning() {
        assert!(StoreError::ConnectionLost("gone".into()).poisons_connection());
        assert!(!StoreError::Constraint("check".into()).poisons_connection());
    }

    #[test]
    fn test_rusqlite_constraint_maps_to_structural() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT NOT NULL);")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t (v) VALUES (NULL)", [])
            .unwrap_err();
        let store_err = StoreError::from(err);
        assert!(matches!(store_err, StoreError::Constraint(_)));
        assert_eq!(store_err.class(), FailureClass::Structural);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::AcquireTimeout { waited_ms: 250 };
        assert_eq!(
            err.to_string(),
            "Timed out after 250ms waiting for a connection"
        );
    }
}
