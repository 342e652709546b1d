//! Command execution for the stock domain.
//!
//! ```text
//! Command
//!   ↓
//! 1. Read the product's stream
//!   ↓
//! 2. Rehydrate InventoryItem (contiguity checked)
//!   ↓
//! 3. Handle command (pure decision, one event)
//!   ↓
//! 4. Append with expected_version = version + 1
//!   ↓ VersionConflict
//! 5. Re-read and retry, up to max_conflict_retries
//! ```
//!
//! The event store never retries; this is the caller that owns the retry.

use thiserror::Error;
use tracing::{debug, instrument};

use stockview_core::{Aggregate, AggregateRoot, DomainError, StreamId};
use stockview_events::{EventRecord, NewEvent};
use stockview_inventory::{
    AddStock, InventoryCommand, InventoryItem, RehydrateError, ReleaseStock, ReserveStock,
};

use crate::event_store::{EventStore, EventStoreError};

/// Default number of re-reads after a version conflict.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Domain validation failure (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Domain invariant failure, e.g. reserving more than is available.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Optimistic concurrency kept failing.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Stored history cannot be folded into the aggregate.
    #[error("stream '{stream_id}' cannot be rehydrated: {source}")]
    Rehydrate {
        stream_id: StreamId,
        #[source]
        source: RehydrateError,
    },

    #[error(transparent)]
    Store(EventStoreError),
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                DispatchError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
        }
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::InvalidAppend(msg) => DispatchError::Validation(msg),
            other => DispatchError::Store(other),
        }
    }
}

/// Upstream writer of stock events.
#[derive(Debug)]
pub struct StockService<S> {
    store: S,
    max_conflict_retries: u32,
}

impl<S> StockService<S>
where
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rehydrate a product from its full stream.
    pub async fn load(&self, product_id: &StreamId) -> Result<InventoryItem, DispatchError> {
        let history = self.store.read_stream(product_id, 1).await?;
        InventoryItem::from_history(product_id.clone(), &history).map_err(|source| {
            DispatchError::Rehydrate {
                stream_id: product_id.clone(),
                source,
            }
        })
    }

    /// Decide and append one event, retrying on version conflicts.
    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn dispatch(
        &self,
        product_id: &StreamId,
        command: InventoryCommand,
    ) -> Result<EventRecord, DispatchError> {
        let mut conflicts = 0u32;
        loop {
            let item = self.load(product_id).await?;
            let event = item.handle(&command)?;
            let append = NewEvent::from_typed(product_id.clone(), item.next_version(), &event)?;

            match self.store.append(append).await {
                Ok(record) => {
                    debug!(
                        version = record.version(),
                        position = %record.position(),
                        event_type = record.event_type(),
                        "event appended"
                    );
                    return Ok(record);
                }
                Err(err) if err.is_conflict() => {
                    if conflicts >= self.max_conflict_retries {
                        return Err(DispatchError::Conflict(format!(
                            "stream '{product_id}' still conflicting after {} attempts",
                            conflicts + 1
                        )));
                    }
                    conflicts += 1;
                    debug!(attempt = conflicts, "version conflict, re-reading stream");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn add_stock(
        &self,
        product_id: &StreamId,
        qty: u32,
    ) -> Result<EventRecord, DispatchError> {
        self.dispatch(product_id, InventoryCommand::AddStock(AddStock { qty }))
            .await
    }

    pub async fn reserve_stock(
        &self,
        product_id: &StreamId,
        qty: u32,
    ) -> Result<EventRecord, DispatchError> {
        self.dispatch(product_id, InventoryCommand::ReserveStock(ReserveStock { qty }))
            .await
    }

    pub async fn release_stock(
        &self,
        product_id: &StreamId,
        qty: u32,
    ) -> Result<EventRecord, DispatchError> {
        self.dispatch(product_id, InventoryCommand::ReleaseStock(ReleaseStock { qty }))
            .await
    }
}
