//! Composite tick records and the component slots they carry.
//!
//! A [`CompositeRecord`] is one periodic snapshot: a session id, a sequence
//! number, capture timing and any subset of the [`ComponentSlot`]s. The
//! engine never looks inside a component payload except through the column
//! specs in [`crate::store::registry`].

mod slot;

pub use slot::{ComponentSlot, UnknownSlot};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Store-issued session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-generated surrogate id of a root row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(pub i64);

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a record was refused at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// No session id
    MissingSessionId,
    /// No sequence number
    MissingSequenceNumber,
    /// Capture duration is zero or negative
    NonPositiveDuration,
    /// Sequence number not above the last accepted one for the session
    SequenceNotIncreasing,
    /// Session id is not the engine's active session
    InactiveSession,
    /// Queue is at capacity
    QueueFull,
}

impl RejectReason {
    /// All reasons, in metrics export order.
    pub const ALL: [RejectReason; 6] = [
        RejectReason::MissingSessionId,
        RejectReason::MissingSequenceNumber,
        RejectReason::NonPositiveDuration,
        RejectReason::SequenceNotIncreasing,
        RejectReason::InactiveSession,
        RejectReason::QueueFull,
    ];

    /// Label used in logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RejectReason::MissingSessionId => "missing_session_id",
            RejectReason::MissingSequenceNumber => "missing_sequence_number",
            RejectReason::NonPositiveDuration => "non_positive_duration",
            RejectReason::SequenceNotIncreasing => "sequence_not_increasing",
            RejectReason::InactiveSession => "inactive_session",
            RejectReason::QueueFull => "queue_full",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            RejectReason::MissingSessionId => 0,
            RejectReason::MissingSequenceNumber => 1,
            RejectReason::NonPositiveDuration => 2,
            RejectReason::SequenceNotIncreasing => 3,
            RejectReason::InactiveSession => 4,
            RejectReason::QueueFull => 5,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One periodic multi-component snapshot.
///
/// Immutable once built. Session id and sequence number are optional here
/// so that malformed producer input can be represented and rejected by the
/// queue rather than failing to construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeRecord {
    session_id: Option<SessionId>,
    sequence_number: Option<u64>,
    captured_at: DateTime<Utc>,
    capture_duration_nanos: i64,
    #[serde(default)]
    components: BTreeMap<ComponentSlot, Value>,
}

impl CompositeRecord {
    /// Start building a record.
    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    /// Session the record belongs to.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Producer sequence number.
    pub fn sequence_number(&self) -> Option<u64> {
        self.sequence_number
    }

    /// Wall-clock time of capture.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Time the producer spent assembling the record.
    pub fn capture_duration_nanos(&self) -> i64 {
        self.capture_duration_nanos
    }

    /// Payload of a populated slot. JSON `null` counts as absent.
    pub fn component(&self, slot: ComponentSlot) -> Option<&Value> {
        self.components.get(&slot).filter(|v| !v.is_null())
    }

    /// Populated slots in registry order.
    pub fn populated_slots(&self) -> impl Iterator<Item = ComponentSlot> + '_ {
        self.components
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(slot, _)| *slot)
    }

    /// Number of populated slots.
    pub fn component_count(&self) -> usize {
        self.populated_slots().count()
    }

    /// Stamp a session id onto a record that arrived without one.
    pub fn or_session(mut self, session_id: SessionId) -> Self {
        self.session_id.get_or_insert(session_id);
        self
    }

    /// Check the fields every record must carry.
    pub fn validate(&self) -> Result<(SessionId, u64), RejectReason> {
        let session_id = self.session_id.ok_or(RejectReason::MissingSessionId)?;
        let sequence = self
            .sequence_number
            .ok_or(RejectReason::MissingSequenceNumber)?;
        if self.capture_duration_nanos <= 0 {
            return Err(RejectReason::NonPositiveDuration);
        }
        Ok((session_id, sequence))
    }
}

/// Builder for [`CompositeRecord`].
#[derive(Debug, Default)]
pub struct RecordBuilder {
    session_id: Option<SessionId>,
    sequence_number: Option<u64>,
    captured_at: Option<DateTime<Utc>>,
    capture_duration_nanos: i64,
    components: BTreeMap<ComponentSlot, Value>,
}

impl RecordBuilder {
    /// Set the session id.
    pub fn session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Set the sequence number.
    pub fn sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    /// Set the capture time. Defaults to now.
    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }

    /// Set the capture duration.
    pub fn capture_duration(mut self, duration: Duration) -> Self {
        self.capture_duration_nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        self
    }

    /// Set the capture duration in raw nanoseconds, including invalid values.
    pub fn capture_duration_nanos(mut self, nanos: i64) -> Self {
        self.capture_duration_nanos = nanos;
        self
    }

    /// Populate a component slot.
    pub fn component(mut self, slot: ComponentSlot, payload: Value) -> Self {
        self.components.insert(slot, payload);
        self
    }

    /// Populate several slots at once.
    pub fn components(mut self, components: impl IntoIterator<Item = (ComponentSlot, Value)>) -> Self {
        self.components.extend(components);
        self
    }

    /// Finish the record.
    pub fn build(self) -> CompositeRecord {
        CompositeRecord {
            session_id: self.session_id,
            sequence_number: self.sequence_number,
            captured_at: self.captured_at.unwrap_or_else(Utc::now),
            capture_duration_nanos: self.capture_duration_nanos,
            components: self.components,
        }
    }
}
