//! Projections: fold the event log into the read model.
//!
//! A projection is fed records in global position order by the projector. It
//! must be idempotent: a record at or below a row's `last_version` changes
//! nothing, which is what makes replay after a crash safe.

pub mod checkpoint_store;
pub mod inventory_stock;

use async_trait::async_trait;
use thiserror::Error;

use stockview_core::StreamId;
use stockview_events::{EventRecord, Position};

use crate::error::StorageError;

pub use checkpoint_store::{CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore};
pub use inventory_stock::StockProjection;

/// What applying one record did to the read model.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The record was folded into its row.
    Applied,
    /// The row already covered this version; nothing changed.
    Duplicate,
    /// Unknown event type: the version was recorded, the state was not touched.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// A handler could not fold this record (e.g. malformed payload).
    #[error("handler failed for {event_type} v{version} of '{stream_id}' at {position}: {reason}")]
    Handler {
        stream_id: StreamId,
        event_type: String,
        version: u64,
        position: Position,
        reason: String,
    },

    /// The stream skipped a version; the log is corrupt.
    #[error("version gap in stream '{stream_id}': expected v{expected}, found v{found}")]
    VersionGap {
        stream_id: StreamId,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ProjectionError {
    /// Per-record failures that the skip policy may step over.
    pub fn is_handler(&self) -> bool {
        matches!(self, ProjectionError::Handler { .. })
    }
}

/// A read-model builder driven by the projector.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    /// Fold one record. Records of one stream arrive in version order.
    async fn apply(&self, record: &EventRecord) -> Result<ApplyOutcome, ProjectionError>;

    /// Consume a record that failed to apply without folding it, so later
    /// versions of the stream stay contiguous.
    async fn skip(&self, record: &EventRecord) -> Result<(), ProjectionError>;

    /// Drop all derived state (rebuild support).
    async fn reset(&self) -> Result<(), ProjectionError>;
}
