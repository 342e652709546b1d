use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stockview_core::StreamId;

use crate::error::StorageError;

/// One row of the query-optimized view: current stock per product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductView {
    pub product_id: StreamId,
    pub available_stock: i64,
    /// Highest stream version folded into this row.
    pub last_version: u64,
}

/// Disposable read-model storage, written only by the projector.
///
/// `upsert` is the idempotency guard: it writes only when `version` is newer
/// than the stored `last_version` (or no row exists) and reports whether it
/// wrote. The check and the write are one atomic step per row.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    async fn get(&self, product_id: &StreamId) -> Result<Option<ProductView>, StorageError>;

    async fn upsert(
        &self,
        product_id: &StreamId,
        available_stock: i64,
        version: u64,
    ) -> Result<bool, StorageError>;

    /// All rows, ordered by product id.
    async fn list(&self) -> Result<Vec<ProductView>, StorageError>;

    async fn delete(&self, product_id: &StreamId) -> Result<bool, StorageError>;

    /// Remove every row (rebuild support).
    async fn clear(&self) -> Result<(), StorageError>;
}

#[async_trait]
impl<S> ReadModelStore for Arc<S>
where
    S: ReadModelStore + ?Sized,
{
    async fn get(&self, product_id: &StreamId) -> Result<Option<ProductView>, StorageError> {
        (**self).get(product_id).await
    }

    async fn upsert(
        &self,
        product_id: &StreamId,
        available_stock: i64,
        version: u64,
    ) -> Result<bool, StorageError> {
        (**self).upsert(product_id, available_stock, version).await
    }

    async fn list(&self) -> Result<Vec<ProductView>, StorageError> {
        (**self).list().await
    }

    async fn delete(&self, product_id: &StreamId) -> Result<bool, StorageError> {
        (**self).delete(product_id).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        (**self).clear().await
    }
}

/// In-memory read model for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReadModelStore {
    rows: RwLock<BTreeMap<StreamId, ProductView>>,
}

impl InMemoryReadModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_guarded(
        &self,
        product_id: &StreamId,
        available_stock: i64,
        version: u64,
    ) -> Result<bool, StorageError> {
        let mut rows = self.rows.write().map_err(|_| StorageError::poisoned())?;
        if let Some(existing) = rows.get(product_id) {
            if existing.last_version >= version {
                return Ok(false);
            }
        }
        rows.insert(
            product_id.clone(),
            ProductView {
                product_id: product_id.clone(),
                available_stock,
                last_version: version,
            },
        );
        Ok(true)
    }

    fn read_one(&self, product_id: &StreamId) -> Result<Option<ProductView>, StorageError> {
        let rows = self.rows.read().map_err(|_| StorageError::poisoned())?;
        Ok(rows.get(product_id).cloned())
    }

    fn read_all(&self) -> Result<Vec<ProductView>, StorageError> {
        let rows = self.rows.read().map_err(|_| StorageError::poisoned())?;
        Ok(rows.values().cloned().collect())
    }

    fn remove(&self, product_id: Option<&StreamId>) -> Result<bool, StorageError> {
        let mut rows = self.rows.write().map_err(|_| StorageError::poisoned())?;
        match product_id {
            Some(id) => Ok(rows.remove(id).is_some()),
            None => {
                rows.clear();
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl ReadModelStore for InMemoryReadModelStore {
    async fn get(&self, product_id: &StreamId) -> Result<Option<ProductView>, StorageError> {
        self.read_one(product_id)
    }

    async fn upsert(
        &self,
        product_id: &StreamId,
        available_stock: i64,
        version: u64,
    ) -> Result<bool, StorageError> {
        self.write_guarded(product_id, available_stock, version)
    }

    async fn list(&self) -> Result<Vec<ProductView>, StorageError> {
        self.read_all()
    }

    async fn delete(&self, product_id: &StreamId) -> Result<bool, StorageError> {
        self.remove(Some(product_id))
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.remove(None).map(|_| ())
    }
}
