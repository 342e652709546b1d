//! Integration tests for the full event-sourced pipeline.
//!
//! Tests: StockService → EventStore → Projector → StockProjection → ReadModel
//!
//! Verifies:
//! - Stock movements converge to the expected rows
//! - Replays (cold checkpoint, crash before checkpoint) never double-count
//! - Rebuilds reproduce identical rows
//! - Gaps and bad checkpoints are reported, not skipped
//! - Failure policies, leases, wake-up and shutdown of the running loop

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value as JsonValue, json};
    use tokio::sync::watch;
    use uuid::Uuid;

    use stockview_core::{EventId, ProjectorId, StreamId};
    use stockview_events::{EventRecord, NewEvent, Position};

    use crate::error::StorageError;
    use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore};
    use crate::projections::{
        CheckpointStore, InMemoryCheckpointStore, ProjectionError, StockProjection,
    };
    use crate::read_model::{InMemoryReadModelStore, ProductView, ReadModelStore};
    use crate::retry::RetryPolicy;
    use crate::stock_service::StockService;
    use crate::workers::{
        FailurePolicy, Projector, ProjectorConfig, ProjectorError, ProjectorState, ProjectorStatus,
    };

    type Rows = Arc<InMemoryReadModelStore>;

    fn sku(s: &str) -> StreamId {
        StreamId::new(s).unwrap()
    }

    fn config(policy: FailurePolicy) -> ProjectorConfig {
        ProjectorConfig {
            projector_id: ProjectorId::default(),
            batch_size: 2,
            poll_interval: Duration::from_millis(50),
            failure_policy: policy,
            retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            lease_ttl: Duration::from_secs(5),
        }
    }

    struct Pipeline {
        store: Arc<InMemoryEventStore>,
        rows: Rows,
        checkpoints: Arc<InMemoryCheckpointStore>,
        service: StockService<Arc<InMemoryEventStore>>,
    }

    impl Pipeline {
        fn new() -> Self {
            let store = Arc::new(InMemoryEventStore::new());
            Self {
                service: StockService::new(store.clone()),
                store,
                rows: Arc::new(InMemoryReadModelStore::new()),
                checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            }
        }

        fn projector(
            &self,
            config: ProjectorConfig,
        ) -> Projector<Arc<InMemoryEventStore>, Arc<InMemoryCheckpointStore>, StockProjection<Rows>>
        {
            Projector::new(
                self.store.clone(),
                self.checkpoints.clone(),
                StockProjection::new(self.rows.clone()),
                config,
            )
        }

        async fn row(&self, s: &str) -> Option<ProductView> {
            self.rows.get(&sku(s)).await.unwrap()
        }

        async fn checkpoint(&self) -> Position {
            self.checkpoints.load(&ProjectorId::default()).await.unwrap()
        }

        async fn append_raw(&self, s: &str, event_type: &str, payload: JsonValue) {
            let version = self.store.stream_version(&sku(s)).await.unwrap() + 1;
            let event = NewEvent::new(sku(s), event_type, payload, version).unwrap();
            self.store.append(event).await.unwrap();
        }
    }

    async fn wait_for_status(
        rx: &mut watch::Receiver<ProjectorStatus>,
        condition: impl Fn(&ProjectorStatus) -> bool,
    ) -> ProjectorStatus {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| condition(s)))
            .await
            .expect("timed out waiting for projector status")
            .expect("projector status channel closed")
            .clone()
    }

    #[tokio::test]
    async fn stock_added_twice_converges_to_sum() {
        let p = Pipeline::new();
        p.service.add_stock(&sku("iphone-15"), 100).await.unwrap();
        p.service.add_stock(&sku("iphone-15"), 50).await.unwrap();

        let report = p.projector(config(FailurePolicy::SkipAndContinue)).catch_up().await.unwrap();
        assert_eq!(report.applied, 2);

        let row = p.row("iphone-15").await.unwrap();
        assert_eq!((row.available_stock, row.last_version), (150, 2));
        assert_eq!(p.checkpoint().await, Position::new(2));
    }

    #[tokio::test]
    async fn interleaved_streams_project_independently() {
        let p = Pipeline::new();
        p.service.add_stock(&sku("iphone-15"), 10).await.unwrap();
        p.service.add_stock(&sku("ipad"), 4).await.unwrap();
        p.service.reserve_stock(&sku("iphone-15"), 3).await.unwrap();
        p.service.release_stock(&sku("iphone-15"), 1).await.unwrap();
        p.service.reserve_stock(&sku("ipad"), 4).await.unwrap();

        let projector = p.projector(config(FailurePolicy::SkipAndContinue));
        let report = projector.catch_up().await.unwrap();
        assert_eq!(report.processed, 5);
        assert_eq!(projector.status().batches, 3);

        assert_eq!(p.row("iphone-15").await.unwrap().available_stock, 8);
        let ipad = p.row("ipad").await.unwrap();
        assert_eq!((ipad.available_stock, ipad.last_version), (0, 2));
    }

    #[tokio::test]
    async fn running_twice_from_a_cold_checkpoint_is_idempotent() {
        let p = Pipeline::new();
        for qty in [5, 7, 11] {
            p.service.add_stock(&sku("macbook"), qty).await.unwrap();
        }
        p.service.reserve_stock(&sku("macbook"), 3).await.unwrap();

        let projector = p.projector(config(FailurePolicy::SkipAndContinue));
        projector.catch_up().await.unwrap();
        let once = p.rows.list().await.unwrap();

        p.checkpoints.reset(&ProjectorId::default()).await.unwrap();
        let again = projector.catch_up().await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.duplicates, 4);
        assert_eq!(p.rows.list().await.unwrap(), once);
    }

    /// Checkpoint store whose first `advance` calls fail, as if the process
    /// died after applying a batch but before recording it.
    struct FailingAdvance {
        inner: InMemoryCheckpointStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl CheckpointStore for FailingAdvance {
        async fn load(&self, projector_id: &ProjectorId) -> Result<Position, StorageError> {
            self.inner.load(projector_id).await
        }

        async fn advance(
            &self,
            projector_id: &ProjectorId,
            position: Position,
        ) -> Result<(), StorageError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StorageError::Unavailable("connection reset".into()));
            }
            self.inner.advance(projector_id, position).await
        }

        async fn reset(&self, projector_id: &ProjectorId) -> Result<(), StorageError> {
            self.inner.reset(projector_id).await
        }

        async fn try_acquire_lease(
            &self,
            projector_id: &ProjectorId,
            holder: Uuid,
            ttl: Duration,
        ) -> Result<bool, StorageError> {
            self.inner.try_acquire_lease(projector_id, holder, ttl).await
        }

        async fn release_lease(
            &self,
            projector_id: &ProjectorId,
            holder: Uuid,
        ) -> Result<(), StorageError> {
            self.inner.release_lease(projector_id, holder).await
        }
    }

    #[tokio::test]
    async fn crash_before_checkpoint_replays_without_double_counting() {
        let p = Pipeline::new();
        p.service.add_stock(&sku("iphone-15"), 100).await.unwrap();
        p.service.add_stock(&sku("iphone-15"), 50).await.unwrap();

        let checkpoints = Arc::new(FailingAdvance {
            inner: InMemoryCheckpointStore::new(),
            failures_left: AtomicU32::new(1),
        });
        let projector = Projector::new(
            p.store.clone(),
            checkpoints.clone(),
            StockProjection::new(p.rows.clone()),
            config(FailurePolicy::SkipAndContinue),
        );

        let err = projector.run_once().await.unwrap_err();
        assert!(err.is_transient());
        // Applied, but not checkpointed.
        assert_eq!(p.row("iphone-15").await.unwrap().available_stock, 150);
        assert_eq!(checkpoints.load(&ProjectorId::default()).await.unwrap(), Position::ZERO);

        let replay = projector.run_once().await.unwrap();
        assert_eq!(replay.duplicates, 2);
        assert_eq!(replay.applied, 0);

        let row = p.row("iphone-15").await.unwrap();
        assert_eq!((row.available_stock, row.last_version), (150, 2));
        assert_eq!(checkpoints.load(&ProjectorId::default()).await.unwrap(), Position::new(2));
    }

    #[tokio::test]
    async fn rebuild_from_zero_reproduces_identical_rows() {
        let p = Pipeline::new();
        p.service.add_stock(&sku("iphone-15"), 100).await.unwrap();
        p.service.add_stock(&sku("ipad"), 20).await.unwrap();
        p.service.reserve_stock(&sku("iphone-15"), 40).await.unwrap();
        p.append_raw("ipad", "PriceChanged", json!({ "price": 999 })).await;

        let projector = p.projector(config(FailurePolicy::SkipAndContinue));
        projector.catch_up().await.unwrap();
        let before = p.rows.list().await.unwrap();

        p.rows.delete(&sku("iphone-15")).await.unwrap();
        let report = projector.rebuild().await.unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.ignored, 1);
        assert_eq!(p.rows.list().await.unwrap(), before);
        assert_eq!(p.checkpoint().await, Position::new(4));
    }

    #[tokio::test]
    async fn deleting_checkpoint_and_row_rebuilds_that_row() {
        let p = Pipeline::new();
        p.service.add_stock(&sku("iphone-15"), 100).await.unwrap();
        p.service.reserve_stock(&sku("iphone-15"), 1).await.unwrap();

        let projector = p.projector(config(FailurePolicy::SkipAndContinue));
        projector.catch_up().await.unwrap();
        let before = p.row("iphone-15").await.unwrap();

        p.rows.delete(&sku("iphone-15")).await.unwrap();
        p.checkpoints.reset(&ProjectorId::default()).await.unwrap();
        projector.catch_up().await.unwrap();
        assert_eq!(p.row("iphone-15").await.unwrap(), before);
    }

    /// A log handed over verbatim, including records a real store would reject.
    struct FixedLog {
        records: Vec<EventRecord>,
    }

    impl FixedLog {
        fn new(entries: &[(&str, u64, JsonValue)]) -> Self {
            let records = entries
                .iter()
                .enumerate()
                .map(|(i, (stream, version, payload))| {
                    let event = NewEvent::new(sku(stream), "StockAdded", payload.clone(), *version)
                        .unwrap();
                    EventRecord::committed(
                        event,
                        EventId::new(),
                        Position::new(i as u64 + 1),
                        Utc::now(),
                    )
                })
                .collect();
            Self { records }
        }
    }

    #[async_trait]
    impl EventStore for FixedLog {
        async fn append(&self, _event: NewEvent) -> Result<EventRecord, EventStoreError> {
            Err(EventStoreError::InvalidAppend("read-only log".into()))
        }

        async fn read_stream(
            &self,
            stream_id: &StreamId,
            from_version: u64,
        ) -> Result<Vec<EventRecord>, EventStoreError> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.stream_id() == stream_id && r.version() >= from_version)
                .cloned()
                .collect())
        }

        async fn read_all(
            &self,
            after: Position,
            limit: usize,
        ) -> Result<Vec<EventRecord>, EventStoreError> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.position() > after)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn head_position(&self) -> Result<Position, EventStoreError> {
            Ok(self.records.last().map(|r| r.position()).unwrap_or(Position::ZERO))
        }

        async fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.stream_id() == stream_id)
                .map(|r| r.version())
                .max()
                .unwrap_or(0))
        }
    }

    #[tokio::test]
    async fn missing_version_in_log_is_flagged_as_corruption() {
        let log = FixedLog::new(&[
            ("iphone-15", 1, json!({ "qty": 10 })),
            ("iphone-15", 3, json!({ "qty": 10 })),
        ]);
        let rows: Rows = Arc::new(InMemoryReadModelStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let projector = Projector::new(
            log,
            checkpoints.clone(),
            StockProjection::new(rows.clone()),
            config(FailurePolicy::SkipAndContinue),
        );

        let err = projector.run_once().await.unwrap_err();
        assert!(matches!(
            err,
            ProjectorError::Projection(ProjectionError::VersionGap { expected: 2, found: 3, .. })
        ));
        assert_eq!(checkpoints.load(&ProjectorId::default()).await.unwrap(), Position::ZERO);
        assert_eq!(rows.get(&sku("iphone-15")).await.unwrap().unwrap().last_version, 1);
    }

    async fn log_with_poison_pill(p: &Pipeline) {
        p.service.add_stock(&sku("ipad"), 10).await.unwrap();
        p.append_raw("ipad", "StockAdded", json!({ "qty": -5 })).await;
        p.service.add_stock(&sku("ipad"), 1).await.unwrap();
    }

    #[tokio::test]
    async fn skip_policy_steps_over_a_failing_record() {
        let p = Pipeline::new();
        log_with_poison_pill(&p).await;

        let projector = p.projector(config(FailurePolicy::SkipAndContinue));
        let report = projector.catch_up().await.unwrap();
        assert_eq!(report.skipped_with_error, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(projector.status().skipped_with_error, 1);

        let row = p.row("ipad").await.unwrap();
        assert_eq!((row.available_stock, row.last_version), (11, 3));
        assert_eq!(p.checkpoint().await, Position::new(3));
    }

    #[tokio::test]
    async fn halt_policy_stops_without_advancing_the_checkpoint() {
        let p = Pipeline::new();
        log_with_poison_pill(&p).await;

        let projector = p.projector(config(FailurePolicy::HaltAndAlert));
        for _ in 0..2 {
            let err = projector.run_once().await.unwrap_err();
            assert!(matches!(
                err,
                ProjectorError::Projection(ProjectionError::Handler { version: 2, .. })
            ));
            assert_eq!(p.checkpoint().await, Position::ZERO);
        }
        assert_eq!(p.row("ipad").await.unwrap().last_version, 1);
    }

    #[tokio::test]
    async fn halt_policy_fails_the_running_loop() {
        let p = Pipeline::new();
        log_with_poison_pill(&p).await;

        let mut handle = p.projector(config(FailurePolicy::HaltAndAlert)).spawn();
        let state = tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .unwrap();
        assert!(matches!(state, ProjectorState::Failed(_)));

        let err = handle.shutdown().await.unwrap_err();
        assert!(matches!(err, ProjectorError::Projection(_)));
    }

    #[tokio::test]
    async fn checkpoint_beyond_the_log_is_refused() {
        let p = Pipeline::new();
        p.service.add_stock(&sku("ipad"), 1).await.unwrap();
        p.checkpoints.advance(&ProjectorId::default(), Position::new(10)).await.unwrap();

        let err = p
            .projector(config(FailurePolicy::SkipAndContinue))
            .run_once()
            .await
            .unwrap_err();
        match err {
            ProjectorError::CheckpointCorruption { checkpoint, head, .. } => {
                assert_eq!(checkpoint, Position::new(10));
                assert_eq!(head, Position::new(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_all_land_and_project() {
        let p = Pipeline::new();
        let writers = 8u32;

        let mut tasks = Vec::new();
        for _ in 0..writers {
            let store = p.store.clone();
            tasks.push(tokio::spawn(async move {
                StockService::new(store)
                    .with_max_conflict_retries(64)
                    .add_stock(&sku("iphone-15"), 10)
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let versions: Vec<_> = p
            .store
            .read_stream(&sku("iphone-15"), 1)
            .await
            .unwrap()
            .iter()
            .map(|r| r.version())
            .collect();
        assert_eq!(versions, (1..=u64::from(writers)).collect::<Vec<_>>());

        p.projector(config(FailurePolicy::SkipAndContinue)).catch_up().await.unwrap();
        let row = p.row("iphone-15").await.unwrap();
        assert_eq!((row.available_stock, row.last_version), (80, 8));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn projector_keeps_up_with_live_writers_without_false_corruption() {
        let p = Pipeline::new();
        let writers = 4usize;
        let per_writer = 500u64;

        let mut tasks = Vec::new();
        for w in 0..writers {
            let store = p.store.clone();
            tasks.push(tokio::spawn(async move {
                let stream = sku(&format!("sku-{w}"));
                for v in 1..=per_writer {
                    let event = NewEvent::new(stream.clone(), "StockAdded", json!({ "qty": 1 }), v)
                        .unwrap();
                    store.append(event).await.unwrap();
                }
            }));
        }

        let mut live = config(FailurePolicy::HaltAndAlert);
        live.batch_size = 16;
        let projector = p.projector(live);
        let total = Position::new(writers as u64 * per_writer);
        while p.checkpoint().await < total {
            if let Err(err) = projector.run_once().await {
                panic!("projector failed while writers were appending: {err}");
            }
            tokio::task::yield_now().await;
        }

        for task in tasks {
            task.await.unwrap();
        }
        for w in 0..writers {
            let row = p.row(&format!("sku-{w}")).await.unwrap();
            assert_eq!((row.available_stock, row.last_version), (per_writer as i64, per_writer));
        }
    }

    #[tokio::test]
    async fn running_projector_wakes_on_append_and_stops_promptly() {
        let p = Pipeline::new();
        let mut slow_poll = config(FailurePolicy::SkipAndContinue);
        slow_poll.poll_interval = Duration::from_secs(60);
        slow_poll.lease_ttl = Duration::from_secs(120);

        let handle = p.projector(slow_poll).spawn();
        let mut status = handle.subscribe();
        wait_for_status(&mut status, |s| s.state == ProjectorState::Idle).await;

        p.service.add_stock(&sku("iphone-15"), 100).await.unwrap();
        let seen = wait_for_status(&mut status, |s| s.position == Position::new(1)).await;
        assert_eq!(seen.applied, 1);
        assert_eq!(p.row("iphone-15").await.unwrap().available_stock, 100);

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("shutdown interrupted the idle wait")
            .unwrap();
        assert_eq!(status.borrow().state, ProjectorState::Stopped);
    }

    #[tokio::test]
    async fn second_instance_with_same_id_is_refused() {
        let p = Pipeline::new();
        p.service.add_stock(&sku("ipad"), 1).await.unwrap();

        let first = p.projector(config(FailurePolicy::SkipAndContinue)).spawn();
        let mut status = first.subscribe();
        wait_for_status(&mut status, |s| s.state == ProjectorState::Idle).await;

        let second = p.projector(config(FailurePolicy::SkipAndContinue));
        let (_tx, rx) = watch::channel(false);
        let err = second.run(rx).await.unwrap_err();
        assert_eq!(err, ProjectorError::LeaseUnavailable(ProjectorId::default()));
        assert!(matches!(second.status().state, ProjectorState::Failed(_)));
        assert!(matches!(
            second.rebuild().await.unwrap_err(),
            ProjectorError::LeaseUnavailable(_)
        ));

        first.shutdown().await.unwrap();
        let third = p.projector(config(FailurePolicy::SkipAndContinue));
        assert_eq!(third.rebuild().await.unwrap().processed, 1);
    }

    /// Event store that is never reachable.
    struct Unreachable {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventStore for Unreachable {
        async fn append(&self, _event: NewEvent) -> Result<EventRecord, EventStoreError> {
            Err(EventStoreError::Unavailable("connection refused".into()))
        }

        async fn read_stream(
            &self,
            _stream_id: &StreamId,
            _from_version: u64,
        ) -> Result<Vec<EventRecord>, EventStoreError> {
            Err(EventStoreError::Unavailable("connection refused".into()))
        }

        async fn read_all(
            &self,
            _after: Position,
            _limit: usize,
        ) -> Result<Vec<EventRecord>, EventStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EventStoreError::Unavailable("connection refused".into()))
        }

        async fn head_position(&self) -> Result<Position, EventStoreError> {
            Err(EventStoreError::Unavailable("connection refused".into()))
        }

        async fn stream_version(&self, _stream_id: &StreamId) -> Result<u64, EventStoreError> {
            Err(EventStoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_fail_the_projector() {
        let store = Arc::new(Unreachable {
            calls: AtomicU32::new(0),
        });
        let projector = Projector::new(
            store.clone(),
            Arc::new(InMemoryCheckpointStore::new()),
            StockProjection::new(Arc::new(InMemoryReadModelStore::new())),
            config(FailurePolicy::SkipAndContinue),
        );

        let (_tx, rx) = watch::channel(false);
        let err = projector.run(rx).await.unwrap_err();
        assert!(err.is_transient());
        // One attempt plus three retries.
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
        assert!(matches!(projector.status().state, ProjectorState::Failed(_)));
    }
}
