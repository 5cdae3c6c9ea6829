//! Session lifecycle of one engine.
//!
//! ```text
//! NotStarted --begin--> Active --finalize--> Finalizing --> Completed
//!                          ^                     |
//!                          +------ on error -----+
//! ```
//!
//! Only an `Active` session accepts records. `Completed` is terminal; an
//! engine runs at most one session.

use crate::error::SessionError;
use crate::record::SessionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

/// The session an engine is recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub uuid: Uuid,
    pub player_name: Option<String>,
    pub activity_type: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Outcome of finalizing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    pub session_id: SessionId,
    /// Distinct sequence numbers actually persisted
    pub total_recorded: u64,
    /// Records still queued when the drain timed out
    pub dropped_on_timeout: usize,
    /// Whether the queue drained fully
    pub drained: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Active(SessionInfo),
    Finalizing(SessionInfo),
    Completed(SessionId),
}

/// Lifecycle state machine.
#[derive(Debug)]
pub struct SessionLifecycle {
    phase: Mutex<Phase>,
}

impl SessionLifecycle {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::NotStarted),
        }
    }

    /// Fail unless a new session may begin.
    pub fn ensure_can_begin(&self) -> Result<(), SessionError> {
        match &*self.phase.lock() {
            Phase::NotStarted => Ok(()),
            Phase::Active(info) | Phase::Finalizing(info) => {
                Err(SessionError::AlreadyActive(info.id))
            }
            Phase::Completed(id) => Err(SessionError::AlreadyCompleted(*id)),
        }
    }

    /// Move to `Active`.
    pub fn activate(&self, info: SessionInfo) -> Result<(), SessionError> {
        let mut phase = self.phase.lock();
        match &*phase {
            Phase::NotStarted => {
                *phase = Phase::Active(info);
                Ok(())
            }
            Phase::Active(current) | Phase::Finalizing(current) => {
                Err(SessionError::AlreadyActive(current.id))
            }
            Phase::Completed(id) => Err(SessionError::AlreadyCompleted(*id)),
        }
    }

    /// Move the given active session to `Finalizing`.
    pub fn start_finalizing(&self, id: SessionId) -> Result<SessionInfo, SessionError> {
        let mut phase = self.phase.lock();
        match &*phase {
            Phase::Active(info) if info.id == id => {
                let info = info.clone();
                *phase = Phase::Finalizing(info.clone());
                Ok(info)
            }
            Phase::Completed(done) if *done == id => Err(SessionError::AlreadyCompleted(id)),
            _ => Err(SessionError::NotActive(id)),
        }
    }

    /// Return a failed finalize to `Active`.
    pub fn abort_finalizing(&self) {
        let mut phase = self.phase.lock();
        if let Phase::Finalizing(info) = &*phase {
            *phase = Phase::Active(info.clone());
        }
    }

    /// Move to `Completed`.
    pub fn complete(&self, id: SessionId) {
        *self.phase.lock() = Phase::Completed(id);
    }

    /// Whether records for `id` are accepted.
    pub fn accepts(&self, id: SessionId) -> bool {
        matches!(&*self.phase.lock(), Phase::Active(info) if info.id == id)
    }

    /// The active session, if any.
    pub fn active(&self) -> Option<SessionInfo> {
        match &*self.phase.lock() {
            Phase::Active(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// Name of the current phase, for logs and status output.
    pub fn phase_name(&self) -> &'static str {
        match &*self.phase.lock() {
            Phase::NotStarted => "not_started",
            Phase::Active(_) => "active",
            Phase::Finalizing(_) => "finalizing",
            Phase::Completed(_) => "completed",
        }
    }
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: i64) -> SessionInfo {
        SessionInfo {
            id: SessionId(id),
            uuid: Uuid::new_v4(),
            player_name: Some("Zezima".into()),
            activity_type: None,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let lifecycle = SessionLifecycle::new();
        assert!(lifecycle.ensure_can_begin().is_ok());
        assert!(!lifecycle.accepts(SessionId(1)));

        lifecycle.activate(info(1)).unwrap();
        assert!(lifecycle.accepts(SessionId(1)));
        assert!(!lifecycle.accepts(SessionId(2)));
        assert_eq!(lifecycle.phase_name(), "active");

        lifecycle.start_finalizing(SessionId(1)).unwrap();
        assert!(!lifecycle.accepts(SessionId(1)));
        assert!(lifecycle.active().is_none());

        lifecycle.complete(SessionId(1));
        assert_eq!(lifecycle.phase_name(), "completed");
        assert_eq!(
            lifecycle.ensure_can_begin(),
            Err(SessionError::AlreadyCompleted(SessionId(1)))
        );
        assert_eq!(
            lifecycle.start_finalizing(SessionId(1)).unwrap_err(),
            SessionError::AlreadyCompleted(SessionId(1))
        );
    }

    #[test]
    fn test_second_begin_is_refused() {
        let lifecycle = SessionLifecycle::new();
        lifecycle.activate(info(7)).unwrap();
        assert_eq!(
            lifecycle.activate(info(8)),
            Err(SessionError::AlreadyActive(SessionId(7)))
        );
    }

    #[test]
    fn test_finalize_of_unknown_session() {
        let lifecycle = SessionLifecycle::new();
        assert_eq!(
            lifecycle.start_finalizing(SessionId(3)).unwrap_err(),
            SessionError::NotActive(SessionId(3))
        );
        lifecycle.activate(info(1)).unwrap();
        assert_eq!(
            lifecycle.start_finalizing(SessionId(3)).unwrap_err(),
            SessionError::NotActive(SessionId(3))
        );
    }

    #[test]
    fn test_aborted_finalize_returns_to_active() {
        let lifecycle = SessionLifecycle::new();
        lifecycle.activate(info(1)).unwrap();
        lifecycle.start_finalizing(SessionId(1)).unwrap();
        lifecycle.abort_finalizing();
        assert!(lifecycle.accepts(SessionId(1)));
    }
}
