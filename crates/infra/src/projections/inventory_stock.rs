use async_trait::async_trait;
use tracing::{debug, warn};

use stockview_events::{DecodeError, EventRecord};
use stockview_inventory::StockEvent;

use super::{ApplyOutcome, Projection, ProjectionError};
use crate::read_model::ReadModelStore;

/// Name of the stock projection.
pub const STOCK_PROJECTION: &str = "products_view";

/// Inventory stock projection.
///
/// Maintains one [`ProductView`](crate::read_model::ProductView) row per
/// product from `StockAdded` / `StockReserved` / `StockReleased` records.
/// Read models are disposable and rebuildable from the log.
#[derive(Debug)]
pub struct StockProjection<R> {
    store: R,
}

impl<R> StockProjection<R>
where
    R: ReadModelStore,
{
    pub fn new(store: R) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    /// Current stock of the record's stream, once the record is known to be
    /// the next version. `None` means the row already covers it.
    async fn next_slot(&self, record: &EventRecord) -> Result<Option<i64>, ProjectionError> {
        let (stock, last_version) = self
            .store
            .get(record.stream_id())
            .await?
            .map(|row| (row.available_stock, row.last_version))
            .unwrap_or((0, 0));

        if record.version() <= last_version {
            debug!(
                stream_id = %record.stream_id(),
                version = record.version(),
                last_version,
                "record already projected"
            );
            return Ok(None);
        }

        if record.version() != last_version + 1 {
            return Err(ProjectionError::VersionGap {
                stream_id: record.stream_id().clone(),
                expected: last_version + 1,
                found: record.version(),
            });
        }

        Ok(Some(stock))
    }
}

#[async_trait]
impl<R> Projection for StockProjection<R>
where
    R: ReadModelStore,
{
    fn name(&self) -> &str {
        STOCK_PROJECTION
    }

    async fn apply(&self, record: &EventRecord) -> Result<ApplyOutcome, ProjectionError> {
        let Some(stock) = self.next_slot(record).await? else {
            return Ok(ApplyOutcome::Duplicate);
        };

        let (next_stock, outcome) = match record.decode::<StockEvent>() {
            Ok(event) => {
                let next = stock.saturating_add(event.delta());
                if next < 0 {
                    warn!(
                        stream_id = %record.stream_id(),
                        version = record.version(),
                        available_stock = next,
                        "stock went negative"
                    );
                }
                (next, ApplyOutcome::Applied)
            }
            Err(DecodeError::UnknownType(event_type)) => {
                warn!(
                    stream_id = %record.stream_id(),
                    version = record.version(),
                    position = %record.position(),
                    event_type = %event_type,
                    "unknown event type, skipping"
                );
                (stock, ApplyOutcome::Ignored)
            }
            Err(err) => {
                return Err(ProjectionError::Handler {
                    stream_id: record.stream_id().clone(),
                    event_type: record.event_type().to_string(),
                    version: record.version(),
                    position: record.position(),
                    reason: err.to_string(),
                });
            }
        };

        let written = self
            .store
            .upsert(record.stream_id(), next_stock, record.version())
            .await?;
        if !written {
            // Another writer got there first with an equal or newer version.
            return Ok(ApplyOutcome::Duplicate);
        }
        Ok(outcome)
    }

    async fn skip(&self, record: &EventRecord) -> Result<(), ProjectionError> {
        if let Some(stock) = self.next_slot(record).await? {
            self.store
                .upsert(record.stream_id(), stock, record.version())
                .await?;
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), ProjectionError> {
        self.store.clear().await?;
        Ok(())
    }
}
