use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use stockview_core::StreamId;
use stockview_events::{EventRecord, NewEvent, Position};

/// Event store operation error.
///
/// These are infrastructure errors (concurrency, storage) as opposed to domain
/// errors (validation, invariants).
///
/// ## Error Categories
///
/// - **VersionConflict**: `(stream_id, version)` already exists. The caller
///   re-reads the stream and retries; the store never retries on its own.
/// - **VersionGap**: the requested version skips ahead of the stream.
/// - **InvalidAppend**: the request itself is unusable.
/// - **Unavailable**: transient storage failure.
/// - **Corrupt**: stored rows cannot be turned back into records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventStoreError {
    #[error("version conflict: stream '{stream_id}' already has version {version}")]
    VersionConflict { stream_id: StreamId, version: u64 },

    #[error("version gap: stream '{stream_id}' is at {current}, append requested {requested}")]
    VersionGap {
        stream_id: StreamId,
        current: u64,
        requested: u64,
    },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("event store corrupt: {0}")]
    Corrupt(String),
}

impl EventStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::VersionConflict { .. })
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EventStoreError::Unavailable(_))
    }
}

/// Append-only event log.
///
/// ## Append Semantics
///
/// `append()` persists one record with `version = expected_version`:
/// - fails with `VersionConflict` if `(stream_id, expected_version)` exists,
///   decided atomically by the storage layer
/// - fails with `VersionGap` if `expected_version > current + 1`
/// - assigns the next global `position`
///
/// ## Read Semantics
///
/// - `read_stream()` returns one stream from `from_version` on, ascending by version.
/// - `read_all()` returns records strictly after `after`, ascending by position.
///
/// Both are finite and restartable from any point.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: NewEvent) -> Result<EventRecord, EventStoreError>;

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    async fn read_all(
        &self,
        after: Position,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Highest position assigned so far (`Position::ZERO` for an empty log).
    async fn head_position(&self) -> Result<Position, EventStoreError>;

    /// Current version of a stream (0 when the stream does not exist).
    async fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError>;

    /// Change feed of the head position, when the backend can push one.
    fn watch_head(&self) -> Option<watch::Receiver<Position>> {
        None
    }
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, event: NewEvent) -> Result<EventRecord, EventStoreError> {
        (**self).append(event).await
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).read_stream(stream_id, from_version).await
    }

    async fn read_all(
        &self,
        after: Position,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).read_all(after, limit).await
    }

    async fn head_position(&self) -> Result<Position, EventStoreError> {
        (**self).head_position().await
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        (**self).stream_version(stream_id).await
    }

    fn watch_head(&self) -> Option<watch::Receiver<Position>> {
        (**self).watch_head()
    }
}
