use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockview_core::{DomainError, EventId, StreamId};

use crate::{DecodeError, DecodeEvent, Event};

/// Position of a record in the global log.
///
/// Positions are assigned at append time, strictly increase with append order
/// and are independent of per-stream versions. `Position::ZERO` sits before the
/// first record, so a projector that has consumed nothing is "at zero".
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// An event ready to be appended to a stream (not yet assigned a position).
///
/// `expected_version` is the version this event produces once applied on top
/// of the stream's current version, i.e. "current known version + 1".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    stream_id: StreamId,
    event_type: String,
    payload: JsonValue,
    expected_version: u64,
}

impl NewEvent {
    pub fn new(
        stream_id: StreamId,
        event_type: impl Into<String>,
        payload: JsonValue,
        expected_version: u64,
    ) -> Result<Self, DomainError> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(DomainError::validation("event_type cannot be empty"));
        }
        if expected_version == 0 {
            return Err(DomainError::validation("expected_version starts at 1"));
        }
        Ok(Self {
            stream_id,
            event_type,
            payload,
            expected_version,
        })
    }

    /// Build an append request from a typed domain event.
    pub fn from_typed<E: Event>(
        stream_id: StreamId,
        expected_version: u64,
        event: &E,
    ) -> Result<Self, DomainError> {
        let payload = event
            .to_payload()
            .map_err(|e| DomainError::validation(format!("payload serialization failed: {e}")))?;
        Self::new(stream_id, event.event_type(), payload, expected_version)
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn expected_version(&self) -> u64 {
        self.expected_version
    }
}

/// An immutable fact persisted in the log.
///
/// Records are created once by the event store and never mutated or deleted.
/// `timestamp` is informational only; ordering uses `version` within a stream
/// and `position` across streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    event_id: EventId,
    stream_id: StreamId,
    event_type: String,
    payload: JsonValue,
    version: u64,
    position: Position,
    timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Seal an append request into a record at the given log position.
    pub fn committed(
        event: NewEvent,
        event_id: EventId,
        position: Position,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            stream_id: event.stream_id,
            event_type: event.event_type,
            payload: event.payload,
            version: event.expected_version,
            position,
            timestamp,
        }
    }

    /// Reassemble a record read back from storage.
    pub fn from_parts(
        event_id: EventId,
        stream_id: StreamId,
        event_type: String,
        payload: JsonValue,
        version: u64,
        position: Position,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            stream_id,
            event_type,
            payload,
            version,
            position,
            timestamp,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Decode the payload into a typed event.
    pub fn decode<E: DecodeEvent>(&self) -> Result<E, DecodeError> {
        E::decode(&self.event_type, &self.payload)
    }
}

/// A stream whose versions are not the contiguous sequence they must be.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream '{stream_id}' is not contiguous: expected version {expected}, found {found}")]
pub struct VersionGap {
    pub stream_id: StreamId,
    pub expected: u64,
    pub found: u64,
}

/// Verify that `records` hold the versions `first, first + 1, ...` in order.
///
/// Gaps or repeats indicate a corrupted log and are never skipped silently.
pub fn check_contiguous(records: &[EventRecord], first: u64) -> Result<(), VersionGap> {
    let mut expected = first;
    for record in records {
        if record.version != expected {
            return Err(VersionGap {
                stream_id: record.stream_id.clone(),
                expected,
                found: record.version,
            });
        }
        expected += 1;
    }
    Ok(())
}
