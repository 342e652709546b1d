//! Projector checkpoint persistence and single-instance leases.
//!
//! A checkpoint records the global position of the last record a projector
//! fully applied. This enables:
//! - Resume after crash (the projector continues from the stored position)
//! - Deterministic rebuilds (reset the checkpoint and replay from zero)
//!
//! The lease keeps two instances with the same projector id from advancing the
//! same checkpoint concurrently.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::instrument;
use uuid::Uuid;

use stockview_core::ProjectorId;
use stockview_events::Position;

use crate::error::{StorageError, map_sqlx_error, non_negative};

/// Durable cursor per projector, plus its leader lease.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last fully applied position (`Position::ZERO` when absent).
    async fn load(&self, projector_id: &ProjectorId) -> Result<Position, StorageError>;

    /// Durably record `position`. Must complete before the batch counts as processed.
    async fn advance(
        &self,
        projector_id: &ProjectorId,
        position: Position,
    ) -> Result<(), StorageError>;

    /// Delete the checkpoint so the next run starts from zero.
    async fn reset(&self, projector_id: &ProjectorId) -> Result<(), StorageError>;

    /// Acquire or renew the lease for `holder`. Returns false while another
    /// holder owns an unexpired lease.
    async fn try_acquire_lease(
        &self,
        projector_id: &ProjectorId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Give the lease up if `holder` still owns it.
    async fn release_lease(
        &self,
        projector_id: &ProjectorId,
        holder: Uuid,
    ) -> Result<(), StorageError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn load(&self, projector_id: &ProjectorId) -> Result<Position, StorageError> {
        (**self).load(projector_id).await
    }

    async fn advance(
        &self,
        projector_id: &ProjectorId,
        position: Position,
    ) -> Result<(), StorageError> {
        (**self).advance(projector_id, position).await
    }

    async fn reset(&self, projector_id: &ProjectorId) -> Result<(), StorageError> {
        (**self).reset(projector_id).await
    }

    async fn try_acquire_lease(
        &self,
        projector_id: &ProjectorId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        (**self).try_acquire_lease(projector_id, holder, ttl).await
    }

    async fn release_lease(
        &self,
        projector_id: &ProjectorId,
        holder: Uuid,
    ) -> Result<(), StorageError> {
        (**self).release_lease(projector_id, holder).await
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    holder: Uuid,
    expires_at: Instant,
}

/// In-memory checkpoint store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    positions: RwLock<HashMap<ProjectorId, Position>>,
    leases: RwLock<HashMap<ProjectorId, Lease>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_position(&self, projector_id: &ProjectorId) -> Result<Position, StorageError> {
        let positions = self.positions.read().map_err(|_| StorageError::poisoned())?;
        Ok(positions.get(projector_id).copied().unwrap_or(Position::ZERO))
    }

    fn write_position(
        &self,
        projector_id: &ProjectorId,
        position: Option<Position>,
    ) -> Result<(), StorageError> {
        let mut positions = self.positions.write().map_err(|_| StorageError::poisoned())?;
        match position {
            Some(p) => positions.insert(projector_id.clone(), p),
            None => positions.remove(projector_id),
        };
        Ok(())
    }

    fn claim(
        &self,
        projector_id: &ProjectorId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut leases = self.leases.write().map_err(|_| StorageError::poisoned())?;
        let now = Instant::now();
        if let Some(lease) = leases.get(projector_id) {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            projector_id.clone(),
            Lease {
                holder,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn unclaim(&self, projector_id: &ProjectorId, holder: Uuid) -> Result<(), StorageError> {
        let mut leases = self.leases.write().map_err(|_| StorageError::poisoned())?;
        if leases.get(projector_id).is_some_and(|l| l.holder == holder) {
            leases.remove(projector_id);
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, projector_id: &ProjectorId) -> Result<Position, StorageError> {
        self.read_position(projector_id)
    }

    async fn advance(
        &self,
        projector_id: &ProjectorId,
        position: Position,
    ) -> Result<(), StorageError> {
        self.write_position(projector_id, Some(position))
    }

    async fn reset(&self, projector_id: &ProjectorId) -> Result<(), StorageError> {
        self.write_position(projector_id, None)
    }

    async fn try_acquire_lease(
        &self,
        projector_id: &ProjectorId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        self.claim(projector_id, holder, ttl)
    }

    async fn release_lease(
        &self,
        projector_id: &ProjectorId,
        holder: Uuid,
    ) -> Result<(), StorageError> {
        self.unclaim(projector_id, holder)
    }
}

/// Postgres-backed checkpoint store (`checkpoints` and `projector_leases` tables).
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self), fields(projector_id = %projector_id), err)]
    async fn load(&self, projector_id: &ProjectorId) -> Result<Position, StorageError> {
        let position: Option<i64> =
            sqlx::query_scalar("SELECT position FROM checkpoints WHERE projector_id = $1")
                .bind(projector_id.as_str())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_checkpoint", e))?;

        match position {
            Some(p) => Ok(Position::new(non_negative("position", p)?)),
            None => Ok(Position::ZERO),
        }
    }

    #[instrument(skip(self), fields(projector_id = %projector_id, position = %position), err)]
    async fn advance(
        &self,
        projector_id: &ProjectorId,
        position: Position,
    ) -> Result<(), StorageError> {
        let value = i64::try_from(position.value())
            .map_err(|_| StorageError::Corrupt(format!("position {position} out of range")))?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (projector_id, position)
            VALUES ($1, $2)
            ON CONFLICT (projector_id)
            DO UPDATE SET
                position = EXCLUDED.position,
                updated_at = NOW()
            "#,
        )
        .bind(projector_id.as_str())
        .bind(value)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("advance_checkpoint", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(projector_id = %projector_id), err)]
    async fn reset(&self, projector_id: &ProjectorId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM checkpoints WHERE projector_id = $1")
            .bind(projector_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_checkpoint", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(projector_id = %projector_id, holder = %holder), err)]
    async fn try_acquire_lease(
        &self,
        projector_id: &ProjectorId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO projector_leases (projector_id, holder, expires_at)
            VALUES ($1, $2, NOW() + ($3::float8 * INTERVAL '1 millisecond'))
            ON CONFLICT (projector_id)
            DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE projector_leases.holder = EXCLUDED.holder
               OR projector_leases.expires_at < NOW()
            "#,
        )
        .bind(projector_id.as_str())
        .bind(holder)
        .bind(ttl.as_millis() as f64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquire_lease", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(projector_id = %projector_id, holder = %holder), err)]
    async fn release_lease(
        &self,
        projector_id: &ProjectorId,
        holder: Uuid,
    ) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM projector_leases WHERE projector_id = $1 AND holder = $2")
            .bind(projector_id.as_str())
            .bind(holder)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_lease", e))?;
        Ok(())
    }
}
