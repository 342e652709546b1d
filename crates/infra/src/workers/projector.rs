//! The projector: a single sequential consumer of the log per projector id.
//!
//! Each batch loads the checkpoint, reads the records after it, applies them
//! through a [`Projection`] in position order and advances the checkpoint once
//! at the end. A crash between applying and advancing replays the batch, which
//! the projection's `last_version` guard turns into no-ops.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stockview_core::ProjectorId;
use stockview_events::Position;

use crate::error::StorageError;
use crate::event_store::{EventStore, EventStoreError};
use crate::projections::{ApplyOutcome, CheckpointStore, Projection, ProjectionError};
use crate::retry::RetryPolicy;

/// What to do when a handler fails on one record.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the incident, mark the record consumed and keep going.
    #[default]
    SkipAndContinue,
    /// Stop without advancing the checkpoint; an operator must intervene.
    HaltAndAlert,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown failure policy '{0}' (expected 'skip' or 'halt')")]
pub struct UnknownFailurePolicy(pub String);

impl FromStr for FailurePolicy {
    type Err = UnknownFailurePolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" | "skip-and-continue" => Ok(FailurePolicy::SkipAndContinue),
            "halt" | "halt-and-alert" => Ok(FailurePolicy::HaltAndAlert),
            other => Err(UnknownFailurePolicy(other.to_string())),
        }
    }
}

impl core::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FailurePolicy::SkipAndContinue => f.write_str("skip"),
            FailurePolicy::HaltAndAlert => f.write_str("halt"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    pub projector_id: ProjectorId,
    /// Maximum records per batch (and per checkpoint write).
    pub batch_size: usize,
    /// Upper bound on the idle wait when the store cannot push head changes.
    pub poll_interval: Duration,
    pub failure_policy: FailurePolicy,
    /// Backoff for transient storage failures.
    pub retry: RetryPolicy,
    /// Lease duration; renewed before every batch.
    pub lease_ttl: Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            projector_id: ProjectorId::default(),
            batch_size: 256,
            poll_interval: Duration::from_secs(1),
            failure_policy: FailurePolicy::default(),
            retry: RetryPolicy::default(),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectorState {
    Starting,
    Idle,
    CatchingUp,
    Failed(String),
    Stopped,
}

impl ProjectorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectorState::Failed(_) | ProjectorState::Stopped)
    }
}

/// Observable progress of a projector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectorStatus {
    pub state: ProjectorState,
    /// Last checkpointed position.
    pub position: Position,
    pub batches: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub skipped_with_error: u64,
}

impl Default for ProjectorStatus {
    fn default() -> Self {
        Self {
            state: ProjectorState::Starting,
            position: Position::ZERO,
            batches: 0,
            applied: 0,
            duplicates: 0,
            ignored: 0,
            skipped_with_error: 0,
        }
    }
}

/// Outcome of one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub skipped_with_error: usize,
    /// Checkpoint after the batch.
    pub checkpoint: Position,
}

impl BatchReport {
    fn starting_at(checkpoint: Position) -> Self {
        Self {
            checkpoint,
            ..Self::default()
        }
    }

    fn merge(&mut self, other: &BatchReport) {
        self.processed += other.processed;
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.ignored += other.ignored;
        self.skipped_with_error += other.skipped_with_error;
        self.checkpoint = other.checkpoint;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectorError {
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Projection(ProjectionError),

    /// The checkpoint points past anything the log holds.
    #[error(
        "checkpoint of '{projector_id}' is at {checkpoint}, past log head {head}; rebuild required"
    )]
    CheckpointCorruption {
        projector_id: ProjectorId,
        checkpoint: Position,
        head: Position,
    },

    #[error("projector '{0}' is already running elsewhere")]
    LeaseUnavailable(ProjectorId),

    #[error("projector '{0}' lost its lease")]
    LeaseLost(ProjectorId),

    #[error("projector task aborted: {0}")]
    Aborted(String),
}

impl From<ProjectionError> for ProjectorError {
    fn from(value: ProjectionError) -> Self {
        match value {
            ProjectionError::Storage(e) => ProjectorError::Storage(e),
            other => ProjectorError::Projection(other),
        }
    }
}

impl ProjectorError {
    /// Whether a later retry may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            ProjectorError::EventStore(e) => e.is_transient(),
            ProjectorError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Drives one [`Projection`] over an [`EventStore`], persisting progress in a
/// [`CheckpointStore`].
pub struct Projector<S, C, P> {
    store: S,
    checkpoints: C,
    projection: P,
    config: ProjectorConfig,
    holder: Uuid,
    status: watch::Sender<ProjectorStatus>,
}

impl<S, C, P> core::fmt::Debug for Projector<S, C, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Projector")
            .field("projector_id", &self.config.projector_id)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl<S, C, P> Projector<S, C, P>
where
    S: EventStore,
    C: CheckpointStore,
    P: Projection,
{
    pub fn new(store: S, checkpoints: C, projection: P, config: ProjectorConfig) -> Self {
        let (status, _) = watch::channel(ProjectorStatus::default());
        Self {
            store,
            checkpoints,
            projection,
            config,
            holder: Uuid::now_v7(),
            status,
        }
    }

    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    /// Identity used for the lease.
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    pub fn status(&self) -> ProjectorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProjectorStatus> {
        self.status.subscribe()
    }

    /// Process one batch and advance the checkpoint once, at its end.
    ///
    /// Under [`FailurePolicy::HaltAndAlert`] a handler error returns before the
    /// checkpoint moves, so the whole batch is replayed on the next run.
    pub async fn run_once(&self) -> Result<BatchReport, ProjectorError> {
        let projector_id = &self.config.projector_id;
        let checkpoint = self.checkpoints.load(projector_id).await?;
        let records = self
            .store
            .read_all(checkpoint, self.config.batch_size.max(1))
            .await?;

        let mut report = BatchReport::starting_at(checkpoint);
        if records.is_empty() {
            let head = self.store.head_position().await?;
            if checkpoint > head {
                return Err(ProjectorError::CheckpointCorruption {
                    projector_id: projector_id.clone(),
                    checkpoint,
                    head,
                });
            }
            return Ok(report);
        }

        let mut last = checkpoint;
        for record in &records {
            if record.position() <= last {
                return Err(EventStoreError::Corrupt(format!(
                    "read_all returned position {} after {}",
                    record.position(),
                    last
                ))
                .into());
            }

            match self.projection.apply(record).await {
                Ok(ApplyOutcome::Applied) => report.applied += 1,
                Ok(ApplyOutcome::Duplicate) => report.duplicates += 1,
                Ok(ApplyOutcome::Ignored) => report.ignored += 1,
                Err(err)
                    if err.is_handler()
                        && self.config.failure_policy == FailurePolicy::SkipAndContinue =>
                {
                    error!(
                        projector_id = %projector_id,
                        projection = self.projection.name(),
                        position = %record.position(),
                        stream_id = %record.stream_id(),
                        version = record.version(),
                        error = %err,
                        "handler failed, record skipped"
                    );
                    self.projection.skip(record).await?;
                    report.skipped_with_error += 1;
                }
                Err(err) => return Err(err.into()),
            }
            last = record.position();
            report.processed += 1;
        }

        self.checkpoints.advance(projector_id, last).await?;
        report.checkpoint = last;

        debug!(
            projector_id = %projector_id,
            processed = report.processed,
            checkpoint = %last,
            "batch checkpointed"
        );
        self.record_batch(&report);
        Ok(report)
    }

    /// Run batches until a read comes back short of a full batch.
    pub async fn catch_up(&self) -> Result<BatchReport, ProjectorError> {
        let mut total = BatchReport::default();
        loop {
            let batch = self.run_once().await?;
            total.merge(&batch);
            if batch.processed < self.config.batch_size.max(1) {
                return Ok(total);
            }
        }
    }

    /// Drop the read model and the checkpoint, then replay the log from zero.
    ///
    /// Takes the lease for the duration so it cannot race a running instance.
    pub async fn rebuild(&self) -> Result<BatchReport, ProjectorError> {
        let projector_id = &self.config.projector_id;
        if !self
            .checkpoints
            .try_acquire_lease(projector_id, self.holder, self.config.lease_ttl)
            .await?
        {
            return Err(ProjectorError::LeaseUnavailable(projector_id.clone()));
        }

        info!(projector_id = %projector_id, projection = self.projection.name(), "rebuilding");
        let result = self.reset_and_replay().await;
        self.release_lease().await;
        result
    }

    async fn reset_and_replay(&self) -> Result<BatchReport, ProjectorError> {
        self.projection.reset().await?;
        self.checkpoints.reset(&self.config.projector_id).await?;
        self.status.send_modify(|s| s.position = Position::ZERO);
        self.catch_up().await
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Returns `Ok(())` on shutdown; any error leaves the projector `Failed`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProjectorError> {
        let projector_id = &self.config.projector_id;
        let acquired = match self
            .checkpoints
            .try_acquire_lease(projector_id, self.holder, self.config.lease_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => return self.finish(Err(e.into())),
        };
        if !acquired {
            return self.finish(Err(ProjectorError::LeaseUnavailable(projector_id.clone())));
        }

        info!(
            projector_id = %projector_id,
            holder = %self.holder,
            projection = self.projection.name(),
            failure_policy = %self.config.failure_policy,
            "projector started"
        );

        let result = self.drive(&mut shutdown).await;
        self.release_lease().await;
        self.finish(result)
    }

    async fn drive(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ProjectorError> {
        let mut head = self.store.watch_head();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let Some(batch) = self.step_with_retry(shutdown).await? else {
                return Ok(());
            };

            if batch.processed > 0 {
                self.set_state(ProjectorState::CatchingUp);
                continue;
            }

            self.set_state(ProjectorState::Idle);
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = head_changed(&mut head) => {}
            }
        }
    }

    /// Renew the lease and run one batch, retrying transient failures.
    ///
    /// `None` means shutdown was requested during a backoff pause.
    async fn step_with_retry(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<BatchReport>, ProjectorError> {
        let mut attempt = 0;
        loop {
            match self.step().await {
                Ok(batch) => return Ok(Some(batch)),
                Err(err) if err.is_transient() && self.config.retry.should_retry(attempt) => {
                    attempt += 1;
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        projector_id = %self.config.projector_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn step(&self) -> Result<BatchReport, ProjectorError> {
        let projector_id = &self.config.projector_id;
        if !self
            .checkpoints
            .try_acquire_lease(projector_id, self.holder, self.config.lease_ttl)
            .await?
        {
            return Err(ProjectorError::LeaseLost(projector_id.clone()));
        }
        self.run_once().await
    }

    async fn release_lease(&self) {
        if let Err(e) = self
            .checkpoints
            .release_lease(&self.config.projector_id, self.holder)
            .await
        {
            warn!(projector_id = %self.config.projector_id, error = %e, "failed to release lease");
        }
    }

    fn finish(&self, result: Result<(), ProjectorError>) -> Result<(), ProjectorError> {
        match &result {
            Ok(()) => {
                info!(projector_id = %self.config.projector_id, "projector stopped");
                self.set_state(ProjectorState::Stopped);
            }
            Err(e) => {
                error!(projector_id = %self.config.projector_id, error = %e, "projector failed");
                self.set_state(ProjectorState::Failed(e.to_string()));
            }
        }
        result
    }

    fn set_state(&self, state: ProjectorState) {
        self.status.send_if_modified(|s| {
            if s.state == state {
                return false;
            }
            s.state = state;
            true
        });
    }

    fn record_batch(&self, report: &BatchReport) {
        self.status.send_modify(|s| {
            s.position = report.checkpoint;
            s.batches += 1;
            s.applied += report.applied as u64;
            s.duplicates += report.duplicates as u64;
            s.ignored += report.ignored as u64;
            s.skipped_with_error += report.skipped_with_error as u64;
        });
    }
}

impl<S, C, P> Projector<S, C, P>
where
    S: EventStore + 'static,
    C: CheckpointStore + 'static,
    P: Projection + 'static,
{
    /// Run the projector on the tokio runtime.
    pub fn spawn(self) -> ProjectorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = self.subscribe();
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        ProjectorHandle {
            shutdown: shutdown_tx,
            status,
            join,
        }
    }
}

/// Resolves when the head moves; never resolves without a head feed.
async fn head_changed(head: &mut Option<watch::Receiver<Position>>) {
    match head {
        Some(rx) => {
            if rx.changed().await.is_err() {
                *head = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Handle to observe and stop a spawned projector.
#[derive(Debug)]
pub struct ProjectorHandle {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<ProjectorStatus>,
    join: JoinHandle<Result<(), ProjectorError>>,
}

impl ProjectorHandle {
    pub fn status(&self) -> ProjectorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProjectorStatus> {
        self.status.clone()
    }

    /// Wait until the projector reaches `Stopped` or `Failed`.
    pub async fn stopped(&mut self) -> ProjectorState {
        if let Ok(status) = self.status.wait_for(|s| s.state.is_terminal()).await {
            return status.state.clone();
        }
        self.status.borrow().state.clone()
    }

    /// Request graceful shutdown and wait for the task to finish.
    pub async fn shutdown(self) -> Result<(), ProjectorError> {
        let _ = self.shutdown.send(true);
        self.join
            .await
            .map_err(|e| ProjectorError::Aborted(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_policy_parses_short_and_long_names() {
        assert_eq!("skip".parse::<FailurePolicy>().unwrap(), FailurePolicy::SkipAndContinue);
        assert_eq!(" HALT ".parse::<FailurePolicy>().unwrap(), FailurePolicy::HaltAndAlert);
        assert_eq!(
            "halt-and-alert".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::HaltAndAlert
        );
        assert!("retry".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::HaltAndAlert.to_string(), "halt");
    }

    #[test]
    fn storage_errors_inside_projection_errors_stay_transient() {
        let err: ProjectorError =
            ProjectionError::Storage(StorageError::Unavailable("down".into())).into();
        assert!(err.is_transient());

        let gap: ProjectorError = ProjectionError::VersionGap {
            stream_id: "sku".parse().unwrap(),
            expected: 2,
            found: 3,
        }
        .into();
        assert!(!gap.is_transient());
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ProjectorConfig::default();
        assert_eq!(config.projector_id.as_str(), "main_projector");
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.failure_policy, FailurePolicy::SkipAndContinue);
    }
}
