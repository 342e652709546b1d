//! Postgres-backed read model (`products_view` table).
//!
//! The idempotency guard lives in the upsert statement itself:
//! `ON CONFLICT ... DO UPDATE ... WHERE last_version < EXCLUDED.last_version`
//! makes the compare and the write a single row-level operation, so a stale
//! replay affects zero rows.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use stockview_core::StreamId;

use super::{ProductView, ReadModelStore};
use crate::error::{StorageError, map_sqlx_error, non_negative};

/// Postgres-backed store for [`ProductView`] rows.
#[derive(Debug, Clone)]
pub struct PostgresReadModelStore {
    pool: Arc<PgPool>,
}

impl PostgresReadModelStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn row_to_view(row: &PgRow) -> Result<ProductView, StorageError> {
    let product_id: String = row
        .try_get("product_id")
        .map_err(|e| map_sqlx_error("decode product_id", e))?;
    let available_stock: i64 = row
        .try_get("available_stock")
        .map_err(|e| map_sqlx_error("decode available_stock", e))?;
    let last_version: i64 = row
        .try_get("last_version")
        .map_err(|e| map_sqlx_error("decode last_version", e))?;

    Ok(ProductView {
        product_id: StreamId::new(product_id)
            .map_err(|e| StorageError::Corrupt(format!("stored product_id: {e}")))?,
        available_stock,
        last_version: non_negative("last_version", last_version)?,
    })
}

#[async_trait]
impl ReadModelStore for PostgresReadModelStore {
    #[instrument(skip(self), fields(product_id = %product_id), err)]
    async fn get(&self, product_id: &StreamId) -> Result<Option<ProductView>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT product_id, available_stock, last_version
            FROM products_view
            WHERE product_id = $1
            "#,
        )
        .bind(product_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_product_view", e))?;

        row.as_ref().map(row_to_view).transpose()
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    async fn upsert(
        &self,
        product_id: &StreamId,
        available_stock: i64,
        version: u64,
    ) -> Result<bool, StorageError> {
        let version = i64::try_from(version)
            .map_err(|_| StorageError::Corrupt(format!("version {version} out of range")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO products_view (product_id, available_stock, last_version)
            VALUES ($1, $2, $3)
            ON CONFLICT (product_id)
            DO UPDATE SET
                available_stock = EXCLUDED.available_stock,
                last_version = EXCLUDED.last_version,
                updated_at = NOW()
            WHERE products_view.last_version < EXCLUDED.last_version
            "#,
        )
        .bind(product_id.as_str())
        .bind(available_stock)
        .bind(version)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_product_view", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self) -> Result<Vec<ProductView>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, available_stock, last_version
            FROM products_view
            ORDER BY product_id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_product_views", e))?;

        rows.iter().map(row_to_view).collect()
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    async fn delete(&self, product_id: &StreamId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM products_view WHERE product_id = $1")
            .bind(product_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_product_view", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM products_view")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear_product_views", e))?;
        Ok(())
    }
}
