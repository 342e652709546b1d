use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use stockview_core::{EventId, StreamId};
use stockview_events::{EventRecord, NewEvent, Position};

use super::r#trait::{EventStore, EventStoreError};

#[derive(Debug, Default)]
struct Log {
    /// Record at index `i` holds position `i + 1`.
    records: Vec<EventRecord>,
    /// Indices into `records`, in version order, per stream.
    streams: HashMap<StreamId, Vec<usize>>,
}

impl Log {
    fn current_version(&self, stream_id: &StreamId) -> u64 {
        self.streams
            .get(stream_id)
            .map(|indices| indices.len() as u64)
            .unwrap_or(0)
    }
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. The version check and the insert happen under one
/// write lock, which plays the role of the `(stream_id, version)` constraint.
#[derive(Debug)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
    head: watch::Sender<Position>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        let (head, _) = watch::channel(Position::ZERO);
        Self {
            log: RwLock::new(Log::default()),
            head,
        }
    }

    fn commit(&self, event: NewEvent) -> Result<EventRecord, EventStoreError> {
        let mut log = self
            .log
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let current = log.current_version(event.stream_id());
        let requested = event.expected_version();
        if requested <= current {
            return Err(EventStoreError::VersionConflict {
                stream_id: event.stream_id().clone(),
                version: requested,
            });
        }
        if requested > current + 1 {
            return Err(EventStoreError::VersionGap {
                stream_id: event.stream_id().clone(),
                current,
                requested,
            });
        }

        let index = log.records.len();
        let position = Position::new(index as u64 + 1);
        let stream_id = event.stream_id().clone();
        let record = EventRecord::committed(event, EventId::new(), position, Utc::now());

        log.records.push(record.clone());
        log.streams.entry(stream_id).or_default().push(index);

        // Published under the write lock so watchers never see the head move back.
        self.head.send_if_modified(|head| {
            if position > *head {
                *head = position;
                return true;
            }
            false
        });
        Ok(record)
    }

    fn collect_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let Some(indices) = log.streams.get(stream_id) else {
            return Ok(vec![]);
        };
        let skip = from_version.saturating_sub(1) as usize;
        Ok(indices
            .iter()
            .skip(skip)
            .map(|&i| log.records[i].clone())
            .collect())
    }

    fn collect_after(
        &self,
        after: Position,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let start = usize::try_from(after.value()).unwrap_or(usize::MAX);
        Ok(log
            .records
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    fn head(&self) -> Result<Position, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(Position::new(log.records.len() as u64))
    }

    fn version_of(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(log.current_version(stream_id))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: NewEvent) -> Result<EventRecord, EventStoreError> {
        self.commit(event)
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        self.collect_stream(stream_id, from_version)
    }

    async fn read_all(
        &self,
        after: Position,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        self.collect_after(after, limit)
    }

    async fn head_position(&self) -> Result<Position, EventStoreError> {
        self.head()
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        self.version_of(stream_id)
    }

    fn watch_head(&self) -> Option<watch::Receiver<Position>> {
        Some(self.head.subscribe())
    }
}
