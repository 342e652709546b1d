//! Projector process: keeps `products_view` in step with the event log.
//!
//! ```text
//! stockview-projector            run until SIGINT
//! stockview-projector rebuild    drop the view and checkpoint, replay, exit
//! ```

use anyhow::{Context, bail};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use stockview_infra::config::Settings;
use stockview_infra::event_store::PostgresEventStore;
use stockview_infra::projections::{PostgresCheckpointStore, StockProjection};
use stockview_infra::read_model::PostgresReadModelStore;
use stockview_infra::schema;
use stockview_infra::workers::{Projector, ProjectorState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockview_observability::init();

    let rebuild = match std::env::args().nth(1).as_deref() {
        None | Some("run") => false,
        Some("rebuild") => true,
        Some(other) => bail!("unknown command '{other}' (expected 'run' or 'rebuild')"),
    };

    let settings = Settings::from_env().context("invalid configuration")?;
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;

    if settings.provision_schema {
        schema::provision(&pool).await.context("schema provisioning failed")?;
    }

    let projector = Projector::new(
        PostgresEventStore::new(pool.clone()),
        PostgresCheckpointStore::new(pool.clone()),
        StockProjection::new(PostgresReadModelStore::new(pool.clone())),
        settings.projector,
    );

    if rebuild {
        let report = projector.rebuild().await?;
        info!(
            processed = report.processed,
            skipped_with_error = report.skipped_with_error,
            checkpoint = %report.checkpoint,
            "rebuild finished"
        );
        pool.close().await;
        return Ok(());
    }

    let mut handle = projector.spawn();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
        }
        state = handle.stopped() => {
            if let ProjectorState::Failed(reason) = &state {
                warn!(%reason, "projector exited");
            }
        }
    }

    let result = handle.shutdown().await;
    pool.close().await;
    result?;
    Ok(())
}
