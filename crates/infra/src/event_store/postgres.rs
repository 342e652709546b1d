//! Postgres-backed event store implementation.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | EventStoreError |
//! |------------|----------|-----------------|
//! | unique violation on `events_stream_version_key` | `23505` | `VersionConflict` |
//! | check / data exception | `23514`, `22xxx` | `InvalidAppend` |
//! | connection, pool, io, serialization | `08`, `40`, `53`, `57` classes | `Unavailable` |
//! | column decode | n/a | `Corrupt` |
//!
//! ## Ordering
//!
//! `position` is a BIGSERIAL. Sequence values are handed out at insert time but
//! become visible at commit time, so two overlapping transactions could expose
//! positions out of order to a reader. Every append takes the same
//! transaction-scoped advisory lock first, which makes commit order equal
//! position order and keeps `read_all` monotonic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use stockview_core::{EventId, StreamId};
use stockview_events::{EventRecord, NewEvent, Position};

use super::r#trait::{EventStore, EventStoreError};

/// Advisory lock key serialising appends.
const APPEND_LOCK_KEY: i64 = 0x5354_4f43_4b56_4945;

/// Name of the `(stream_id, version)` unique constraint.
pub const STREAM_VERSION_CONSTRAINT: &str = "events_stream_version_key";

/// Postgres-backed append-only event store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; each append runs in
/// its own transaction.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, event),
        fields(
            stream_id = %event.stream_id(),
            event_type = event.event_type(),
            version = event.expected_version(),
            position = tracing::field::Empty
        ),
        err
    )]
    async fn append(&self, event: NewEvent) -> Result<EventRecord, EventStoreError> {
        let requested = event.expected_version();
        let version = i64::try_from(requested)
            .map_err(|_| {
                EventStoreError::InvalidAppend(format!("version {requested} out of range"))
            })?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_lock", e))?;

        // Only gaps are checked up front; conflicts come from the constraint.
        let current: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM events WHERE stream_id = $1",
        )
        .bind(event.stream_id().as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("stream_version", e))?;

        if version > current + 1 {
            return Err(EventStoreError::VersionGap {
                stream_id: event.stream_id().clone(),
                current: current as u64,
                requested,
            });
        }

        let event_id = EventId::new();
        let row = sqlx::query(
            r#"
            INSERT INTO events (event_id, stream_id, event_type, payload, version)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING position, recorded_at
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(event.stream_id().as_str())
        .bind(event.event_type())
        .bind(event.payload())
        .bind(version)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_stream_version_violation(&e) {
                EventStoreError::VersionConflict {
                    stream_id: event.stream_id().clone(),
                    version: requested,
                }
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        let position: i64 = row
            .try_get("position")
            .map_err(|e| EventStoreError::Corrupt(format!("failed to read position: {e}")))?;
        let recorded_at: DateTime<Utc> = row
            .try_get("recorded_at")
            .map_err(|e| EventStoreError::Corrupt(format!("failed to read recorded_at: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("position", position);
        Ok(EventRecord::committed(
            event,
            event_id,
            Position::new(position as u64),
            recorded_at,
        ))
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position, event_id, stream_id, event_type, payload, version, recorded_at
            FROM events
            WHERE stream_id = $1 AND version >= $2
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id.as_str())
        .bind(clamp_i64(from_version))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_stream", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self), fields(after = %after), err)]
    async fn read_all(
        &self,
        after: Position,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position, event_id, stream_id, event_type, payload, version, recorded_at
            FROM events
            WHERE position > $1
            ORDER BY position ASC
            LIMIT $2
            "#,
        )
        .bind(clamp_i64(after.value()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_all", e))?;

        decode_rows(rows)
    }

    async fn head_position(&self) -> Result<Position, EventStoreError> {
        let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) FROM events")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("head_position", e))?;
        Ok(Position::new(unsigned("position", head)?))
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM events WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("stream_version", e))?;
        unsigned("version", version)
    }
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<EventRecord>, EventStoreError> {
    rows.iter()
        .map(|row| {
            EventRow::from_row(row)
                .map_err(|e| {
                    EventStoreError::Corrupt(format!("failed to deserialize event row: {e}"))
                })
                .and_then(EventRecord::try_from)
        })
        .collect()
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn unsigned(column: &str, value: i64) -> Result<u64, EventStoreError> {
    u64::try_from(value)
        .map_err(|_| EventStoreError::Corrupt(format!("{column} is negative: {value}")))
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            match code.get(..2) {
                Some("23") | Some("22") => EventStoreError::InvalidAppend(msg),
                Some("08") | Some("40") | Some("53") | Some("57") => {
                    EventStoreError::Unavailable(msg)
                }
                _ => EventStoreError::InvalidAppend(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => {
            EventStoreError::Corrupt(format!("{operation}: {err}"))
        }
        _ => EventStoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

/// Whether the error is the `(stream_id, version)` unique violation.
fn is_stream_version_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        let unique = db_err.code().is_some_and(|code| code.as_ref() == "23505");
        let constraint = db_err
            .constraint()
            .is_none_or(|name| name == STREAM_VERSION_CONSTRAINT);
        return unique && constraint;
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    position: i64,
    event_id: Uuid,
    stream_id: String,
    event_type: String,
    payload: JsonValue,
    version: i64,
    recorded_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            position: row.try_get("position")?,
            event_id: row.try_get("event_id")?,
            stream_id: row.try_get("stream_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            version: row.try_get("version")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl TryFrom<EventRow> for EventRecord {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let stream_id = StreamId::new(row.stream_id)
            .map_err(|e| EventStoreError::Corrupt(format!("stored stream_id: {e}")))?;
        Ok(EventRecord::from_parts(
            EventId::from_uuid(row.event_id),
            stream_id,
            row.event_type,
            row.payload,
            unsigned("version", row.version)?,
            Position::new(unsigned("position", row.position)?),
            row.recorded_at,
        ))
    }
}
