//! Database schema for the event log, read model, checkpoints and leases.
//!
//! Every statement is idempotent (`IF NOT EXISTS`), so provisioning may run on
//! each deployment.

use sqlx::PgPool;
use tracing::info;

use crate::error::{StorageError, map_sqlx_error};

/// SQL to create the append-only event log.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    position    BIGSERIAL PRIMARY KEY,
    event_id    UUID NOT NULL UNIQUE,
    stream_id   TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    payload     JSONB NOT NULL,
    version     BIGINT NOT NULL CHECK (version > 0),
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT events_stream_version_key UNIQUE (stream_id, version)
);
";

/// SQL to create the product read model.
pub const CREATE_PRODUCTS_VIEW_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS products_view (
    product_id      TEXT PRIMARY KEY,
    available_stock BIGINT NOT NULL,
    last_version    BIGINT NOT NULL CHECK (last_version >= 0),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
";

/// SQL to create projector checkpoints and leases.
pub const CREATE_CHECKPOINT_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS checkpoints (
    projector_id TEXT PRIMARY KEY,
    position     BIGINT NOT NULL CHECK (position >= 0),
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS projector_leases (
    projector_id TEXT PRIMARY KEY,
    holder       UUID NOT NULL,
    expires_at   TIMESTAMPTZ NOT NULL
);
";

/// Every schema statement, in creation order.
pub const SCHEMA: [&str; 3] = [
    CREATE_EVENTS_TABLE,
    CREATE_PRODUCTS_VIEW_TABLE,
    CREATE_CHECKPOINT_TABLES,
];

/// Apply [`SCHEMA`] to the database.
pub async fn provision(pool: &PgPool) -> Result<(), StorageError> {
    for statement in SCHEMA {
        sqlx::raw_sql(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("provision_schema", e))?;
    }
    info!(tables = 4, "schema provisioned");
    Ok(())
}
