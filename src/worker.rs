//! Projection workers: catch-up loop, locking, failure retry, reset.
//!
//! One worker drives one projection across all instances. Within a
//! `(projection, instance)` pair, processing is serialized by a TTL lock
//! in `projection_locks`; across pairs, workers run in parallel (including
//! workers in other processes). The worker advances the recorded position
//! only together with a successful apply, records failing events in
//! `projection_failures`, retries them with capped exponential backoff,
//! and quarantines them for operator resolution once the failure cap is
//! reached. Nothing is ever silently dropped.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::event::{Event, Position};
use crate::projection::{
    HandlerError, Projection, ensure_runtime_schema, read_position, write_position,
};
use crate::store::EventStore;

/// A row of the failed-event table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FailedEvent {
    /// Projection the failure belongs to.
    pub projection_name: String,
    /// Per-aggregate sequence of the failing event.
    pub failed_sequence: i64,
    /// Instance the event belongs to.
    pub instance_id: String,
    /// Aggregate type of the failing event.
    pub aggregate_type: String,
    /// Aggregate id of the failing event.
    pub aggregate_id: String,
    /// Event type that failed to apply.
    pub event_type: String,
    /// How many times the handler has failed on it.
    pub failure_count: i32,
    /// Message of the most recent failure.
    pub last_error: String,
    /// When the first failure was recorded.
    pub first_failed_at: DateTime<Utc>,
    /// When the most recent failure was recorded.
    pub last_failed_at: DateTime<Utc>,
    /// Operator decision, if any; `"skipped"` means permanently skipped.
    pub resolution: Option<String>,
}

impl FailedEvent {
    /// Whether automatic retries still apply: unresolved and under the cap.
    fn retryable(&self, config: &EngineConfig) -> bool {
        self.resolution.is_none() && self.failure_count < config.failed_event_max_failures
    }

    /// Whether the backoff for the next automatic retry has elapsed.
    fn due(&self, config: &EngineConfig, now: DateTime<Utc>) -> bool {
        let delay = config.failed_event_delay(self.failure_count);
        let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::MAX);
        now >= self.last_failed_at + delay
    }

}

/// Operator decision for a quarantined event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureResolution {
    /// Re-attempt with the current handler, ignoring backoff and the
    /// failure cap.
    Retry,
    /// Mark the event permanently skipped; the decision stays recorded in
    /// the failed-event row.
    Skip,
}

/// Drives one projection: catch-up, retries, locking.
pub struct ProjectionWorker {
    store: EventStore,
    projection: Arc<dyn Projection>,
    config: EngineConfig,
    worker_id: String,
}

impl ProjectionWorker {
    /// Build a worker for `projection` with a unique worker id.
    pub fn new(store: EventStore, projection: Arc<dyn Projection>, config: EngineConfig) -> Self {
        ProjectionWorker {
            store,
            projection,
            config,
            worker_id: Uuid::new_v4().to_string(),
        }
    }

    fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Each tick processes every instance that has events for the
    /// projection's aggregate types. Errors are logged and the loop keeps
    /// going; a broken database surfaces on every tick rather than
    /// killing the worker.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = self.tick().await {
                tracing::error!(
                    projection = self.projection.name(),
                    error = %e,
                    "projection tick failed"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.projection_tick_interval) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One pass over all instances.
    pub async fn tick(&self) -> Result<()> {
        for instance_id in self.instances().await? {
            if let Err(e) = self.process_instance(&instance_id).await {
                tracing::error!(
                    projection = self.projection.name(),
                    instance_id = %instance_id,
                    error = %e,
                    "projection instance pass failed"
                );
            }
        }
        Ok(())
    }

    /// Instances with any events for the subscribed aggregate types.
    async fn instances(&self) -> Result<Vec<String>> {
        let types = self.projection.subscription().aggregate_types();
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT instance_id FROM events WHERE aggregate_type = ANY($1)")
                .bind(types)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Process one `(projection, instance)` pair under its lock.
    async fn process_instance(&self, instance_id: &str) -> Result<()> {
        let mut lock = match self.acquire_lock(instance_id).await? {
            Some(lock) => lock,
            // Held by a live peer; its TTL has not expired. Skip the tick.
            None => return Ok(()),
        };

        let outcome = self.process_locked(instance_id, &mut lock).await;
        // Best-effort: an expired lock is reclaimed by peers anyway, and a
        // release failure must not mask the processing outcome.
        if let Err(e) = self.release_lock(instance_id).await {
            tracing::warn!(
                projection = self.projection.name(),
                instance_id = %instance_id,
                error = %e,
                "failed to release projection lock"
            );
        }
        outcome
    }

    async fn process_locked(&self, instance_id: &str, lock: &mut HeldLock) -> Result<()> {
        self.retry_due_failures(instance_id, lock).await?;

        if self.projection.strict_order() && self.has_unresolved_failures(instance_id).await? {
            // Strict order: the pair halts until the poisoned event is
            // resolved; newer events must not overtake it.
            return Ok(());
        }

        self.catch_up(instance_id, lock).await
    }

    /// Stream events beyond the recorded position and apply them.
    async fn catch_up(&self, instance_id: &str, lock: &mut HeldLock) -> Result<()> {
        let subscription = self.projection.subscription();
        let skipped = self.skipped_events(instance_id).await?;
        let mut cursor = read_position(self.pool(), self.projection.name(), instance_id)
            .await?
            .unwrap_or(Position::ZERO);

        loop {
            let batch = self
                .store
                .query(
                    &subscription
                        .to_filter(instance_id)
                        .after_position(cursor)
                        .limit(self.config.projection_batch_size),
                )
                .await?;
            let drained = (batch.len() as i64) < self.config.projection_batch_size;

            for event in &batch {
                lock.renew_if_stale(self, instance_id).await?;
                cursor = event.position;

                if !subscription.matches(event) {
                    // Not ours; the watermark still moves past it at the
                    // end of the batch.
                    continue;
                }

                if !skipped.is_empty()
                    && skipped.contains(&(
                        event.aggregate_type.clone(),
                        event.aggregate_id.clone(),
                        event.sequence,
                    ))
                {
                    // Operator marked it permanently skipped.
                    continue;
                }

                match self.apply_one(event).await? {
                    Applied::Ok => {}
                    Applied::Failed if self.projection.strict_order() => return Ok(()),
                    Applied::Failed => {}
                }
            }

            // Advance the watermark past trailing skipped events so the
            // next tick does not rescan them.
            self.advance_position(instance_id, cursor).await?;

            if drained {
                return Ok(());
            }
        }
    }

    /// Apply one event in its own transaction: mutations, position
    /// advance, and stale-failure cleanup commit together; on handler
    /// failure everything rolls back and the failure is recorded instead.
    async fn apply_one(&self, event: &Event) -> Result<Applied> {
        let mut tx = self.pool().begin().await?;
        match self.projection.apply(event, &mut tx).await {
            Ok(()) => {
                write_position(&mut tx, self.projection.name(), &event.instance_id, event.position)
                    .await?;
                sqlx::query(
                    "DELETE FROM projection_failures \
                     WHERE projection_name = $1 AND failed_sequence = $2 AND instance_id = $3",
                )
                .bind(self.projection.name())
                .bind(event.sequence)
                .bind(&event.instance_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(Applied::Ok)
            }
            Err(handler_error) => {
                tx.rollback().await?;
                self.record_failure(event, &handler_error).await?;
                Ok(Applied::Failed)
            }
        }
    }

    /// Insert or increment the failed-event record for `event`.
    async fn record_failure(&self, event: &Event, handler_error: &HandlerError) -> Result<()> {
        let error = Error::HandlerFailure {
            projection: self.projection.name(),
            event_type: event.event_type.clone(),
            sequence: event.sequence,
            instance_id: event.instance_id.clone(),
            message: handler_error.to_string(),
        };
        tracing::warn!(
            projection = self.projection.name(),
            instance_id = %event.instance_id,
            aggregate_type = %event.aggregate_type,
            aggregate_id = %event.aggregate_id,
            sequence = event.sequence,
            command_id = %event.command_id,
            error = %error,
            "projection handler failed, recording event for retry"
        );

        sqlx::query(
            r#"
            INSERT INTO projection_failures (
                projection_name, failed_sequence, instance_id,
                aggregate_type, aggregate_id, event_type,
                failure_count, last_error, first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 1, $7, NOW(), NOW())
            ON CONFLICT (projection_name, failed_sequence, instance_id) DO UPDATE
            SET failure_count = projection_failures.failure_count + 1,
                last_error = EXCLUDED.last_error,
                last_failed_at = NOW()
            "#,
        )
        .bind(self.projection.name())
        .bind(event.sequence)
        .bind(&event.instance_id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(handler_error.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Re-attempt recorded failures whose backoff has elapsed.
    async fn retry_due_failures(&self, instance_id: &str, lock: &mut HeldLock) -> Result<()> {
        let failures = self.failures(instance_id).await?;
        let now = Utc::now();

        for failure in failures {
            if !failure.retryable(&self.config) || !failure.due(&self.config, now) {
                if failure.resolution.is_none()
                    && failure.failure_count >= self.config.failed_event_max_failures
                {
                    tracing::warn!(
                        projection = self.projection.name(),
                        instance_id = %failure.instance_id,
                        sequence = failure.failed_sequence,
                        failure_count = failure.failure_count,
                        "event quarantined, operator resolution required"
                    );
                }
                continue;
            }
            lock.renew_if_stale(self, instance_id).await?;

            let event = self
                .store
                .get_event(
                    &failure.instance_id,
                    &failure.aggregate_type,
                    &failure.aggregate_id,
                    failure.failed_sequence,
                )
                .await?;
            match event {
                Some(event) => {
                    let _ = self.apply_one(&event).await?;
                }
                None => {
                    // The event is gone from the log; the invariant that
                    // events are immutable and never deleted is broken.
                    return Err(Error::fatal(format!(
                        "failed event {}#{} of {} \"{}\" no longer exists in the log",
                        failure.instance_id,
                        failure.failed_sequence,
                        failure.aggregate_type,
                        failure.aggregate_id,
                    )));
                }
            }
        }
        Ok(())
    }

    /// All failure records for this projection and instance.
    async fn failures(&self, instance_id: &str) -> Result<Vec<FailedEvent>> {
        let rows: Vec<FailedEvent> = sqlx::query_as(
            "SELECT projection_name, failed_sequence, instance_id, aggregate_type, \
                    aggregate_id, event_type, failure_count, last_error, \
                    first_failed_at, last_failed_at, resolution \
             FROM projection_failures \
             WHERE projection_name = $1 AND instance_id = $2 \
             ORDER BY failed_sequence",
        )
        .bind(self.projection.name())
        .bind(instance_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Events an operator resolved as permanently skipped, keyed by
    /// `(aggregate_type, aggregate_id, sequence)`. Catch-up passes over
    /// them without dispatching.
    async fn skipped_events(
        &self,
        instance_id: &str,
    ) -> Result<std::collections::HashSet<(String, String, i64)>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT aggregate_type, aggregate_id, failed_sequence FROM projection_failures \
             WHERE projection_name = $1 AND instance_id = $2 AND resolution = 'skipped'",
        )
        .bind(self.projection.name())
        .bind(instance_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn has_unresolved_failures(&self, instance_id: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM projection_failures \
             WHERE projection_name = $1 AND instance_id = $2 AND resolution IS NULL",
        )
        .bind(self.projection.name())
        .bind(instance_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    /// Advance the position watermark outside an apply transaction (for
    /// trailing events the subscription filtered out).
    async fn advance_position(&self, instance_id: &str, position: Position) -> Result<()> {
        if position == Position::ZERO {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        write_position(&mut tx, self.projection.name(), instance_id, position).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Try to take the `(projection, instance)` lock.
    ///
    /// Succeeds if the slot is free, expired, or already ours; returns
    /// `None` when a live peer holds it.
    async fn acquire_lock(&self, instance_id: &str) -> Result<Option<HeldLock>> {
        let expires_at = Utc::now() + lock_ttl(&self.config);
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO projection_locks
                (projection_name, instance_id, worker_id, acquired_at, expires_at)
            VALUES ($1, $2, $3, NOW(), $4)
            ON CONFLICT (projection_name, instance_id) DO UPDATE
            SET worker_id = EXCLUDED.worker_id,
                acquired_at = NOW(),
                expires_at = EXCLUDED.expires_at
            WHERE projection_locks.expires_at < NOW()
               OR projection_locks.worker_id = EXCLUDED.worker_id
            RETURNING worker_id
            "#,
        )
        .bind(self.projection.name())
        .bind(instance_id)
        .bind(&self.worker_id)
        .bind(expires_at)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|_| HeldLock {
            renewed_at: Instant::now(),
        }))
    }

    async fn renew_lock(&self, instance_id: &str) -> Result<()> {
        let expires_at = Utc::now() + lock_ttl(&self.config);
        let renewed = sqlx::query(
            "UPDATE projection_locks SET expires_at = $4 \
             WHERE projection_name = $1 AND instance_id = $2 AND worker_id = $3",
        )
        .bind(self.projection.name())
        .bind(instance_id)
        .bind(&self.worker_id)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        if renewed.rows_affected() == 0 {
            // Another worker stole an expired lock from under us.
            return Err(Error::fatal(format!(
                "projection lock for {}/{} lost mid-batch",
                self.projection.name(),
                instance_id
            )));
        }
        Ok(())
    }

    async fn release_lock(&self, instance_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM projection_locks \
             WHERE projection_name = $1 AND instance_id = $2 AND worker_id = $3",
        )
        .bind(self.projection.name())
        .bind(instance_id)
        .bind(&self.worker_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Marker for a lock this worker currently holds, tracking when it was
/// last written so renewal happens once less than half the TTL remains.
struct HeldLock {
    renewed_at: Instant,
}

impl HeldLock {
    async fn renew_if_stale(&mut self, worker: &ProjectionWorker, instance_id: &str) -> Result<()> {
        if self.renewed_at.elapsed() >= worker.config.projection_lock_ttl / 2 {
            worker.renew_lock(instance_id).await?;
            self.renewed_at = Instant::now();
        }
        Ok(())
    }
}

enum Applied {
    Ok,
    Failed,
}

fn lock_ttl(config: &EngineConfig) -> ChronoDuration {
    ChronoDuration::from_std(config.projection_lock_ttl).unwrap_or(ChronoDuration::MAX)
}

/// Registry of projections plus the operations an operator runs against
/// them: start/stop workers, reset, list failures, resolve a quarantined
/// event.
pub struct ProjectionEngine {
    store: EventStore,
    config: EngineConfig,
    projections: Vec<Arc<dyn Projection>>,
}

impl ProjectionEngine {
    /// An engine with no projections registered yet.
    pub fn new(store: EventStore, config: EngineConfig) -> Self {
        ProjectionEngine {
            store,
            config,
            projections: Vec::new(),
        }
    }

    /// Register a projection. Builder-style; call before
    /// [`ensure_schema`](ProjectionEngine::ensure_schema).
    pub fn register(mut self, projection: Arc<dyn Projection>) -> Self {
        self.projections.push(projection);
        self
    }

    /// The registered projection named `name`, if any.
    fn projection(&self, name: &str) -> Result<Arc<dyn Projection>> {
        self.projections
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown projection \"{name}\"")))
    }

    /// Create the bookkeeping tables and every projection's own tables.
    pub async fn ensure_schema(&self) -> Result<()> {
        ensure_runtime_schema(self.store.pool()).await?;
        for projection in &self.projections {
            projection.ensure_schema(self.store.pool()).await?;
        }
        Ok(())
    }

    /// Spawn one worker task per registered projection.
    ///
    /// Workers stop at the next batch boundary after
    /// [`shutdown`](ProjectionEngineHandle::shutdown) is called.
    pub fn start(&self) -> ProjectionEngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self
            .projections
            .iter()
            .map(|projection| {
                let worker = ProjectionWorker::new(
                    self.store.clone(),
                    projection.clone(),
                    self.config.clone(),
                );
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();
        ProjectionEngineHandle { shutdown_tx, tasks }
    }

    /// Run a single catch-up pass for every projection, without spawning
    /// workers. Useful in tests and one-shot jobs.
    pub async fn tick_all(&self) -> Result<()> {
        for projection in &self.projections {
            ProjectionWorker::new(self.store.clone(), projection.clone(), self.config.clone())
                .tick()
                .await?;
        }
        Ok(())
    }

    /// Operator-initiated rebuild: delete the projection's rows, position
    /// records, and failure records in one transaction. The next tick
    /// replays from position 0.
    pub async fn reset(&self, projection_name: &str, instance_id: Option<&str>) -> Result<()> {
        let projection = self.projection(projection_name)?;

        let mut tx = self.store.pool().begin().await?;
        projection.truncate(&mut tx, instance_id).await?;

        for table in ["projection_positions", "projection_failures"] {
            match instance_id {
                Some(instance) => {
                    sqlx::query(&format!(
                        "DELETE FROM {table} WHERE projection_name = $1 AND instance_id = $2"
                    ))
                    .bind(projection_name)
                    .bind(instance)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(&format!("DELETE FROM {table} WHERE projection_name = $1"))
                        .bind(projection_name)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;

        tracing::info!(
            projection = projection_name,
            instance_id = instance_id.unwrap_or("<all>"),
            "projection reset, will rebuild from position 0"
        );
        Ok(())
    }

    /// Failure records for a projection, newest last.
    pub async fn failed_events(
        &self,
        projection_name: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<FailedEvent>> {
        let mut qb = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "SELECT projection_name, failed_sequence, instance_id, aggregate_type, \
                    aggregate_id, event_type, failure_count, last_error, \
                    first_failed_at, last_failed_at, resolution \
             FROM projection_failures WHERE projection_name = ",
        );
        qb.push_bind(projection_name);
        if let Some(instance) = instance_id {
            qb.push(" AND instance_id = ").push_bind(instance);
        }
        qb.push(" ORDER BY last_failed_at");
        let rows = qb.build_query_as().fetch_all(self.store.pool()).await?;
        Ok(rows)
    }

    /// Resolve a quarantined (or still-retrying) event.
    ///
    /// `Retry` re-attempts immediately with the current handler: success
    /// deletes the record and advances the position if the event was the
    /// frontier; another failure increments the count. `Skip` marks the
    /// row permanently skipped, which also unblocks a halted strict-order
    /// pair; the row is kept as the record of the decision.
    pub async fn resolve_failed_event(
        &self,
        projection_name: &str,
        failed_sequence: i64,
        instance_id: &str,
        resolution: FailureResolution,
    ) -> Result<()> {
        let projection = self.projection(projection_name)?;

        let failure: Option<FailedEvent> = sqlx::query_as(
            "SELECT projection_name, failed_sequence, instance_id, aggregate_type, \
                    aggregate_id, event_type, failure_count, last_error, \
                    first_failed_at, last_failed_at, resolution \
             FROM projection_failures \
             WHERE projection_name = $1 AND failed_sequence = $2 AND instance_id = $3",
        )
        .bind(projection_name)
        .bind(failed_sequence)
        .bind(instance_id)
        .fetch_optional(self.store.pool())
        .await?;

        let failure = failure.ok_or_else(|| Error::NotFound {
            entity: "failed event",
            id: failed_sequence.to_string(),
            instance_id: instance_id.to_string(),
        })?;

        match resolution {
            FailureResolution::Skip => {
                sqlx::query(
                    "UPDATE projection_failures SET resolution = 'skipped', last_failed_at = NOW() \
                     WHERE projection_name = $1 AND failed_sequence = $2 AND instance_id = $3",
                )
                .bind(projection_name)
                .bind(failed_sequence)
                .bind(instance_id)
                .execute(self.store.pool())
                .await?;
                tracing::info!(
                    projection = projection_name,
                    instance_id,
                    sequence = failed_sequence,
                    "failed event marked permanently skipped"
                );
                Ok(())
            }
            FailureResolution::Retry => {
                let event = self
                    .store
                    .get_event(
                        instance_id,
                        &failure.aggregate_type,
                        &failure.aggregate_id,
                        failed_sequence,
                    )
                    .await?
                    .ok_or_else(|| {
                        Error::fatal(format!(
                            "failed event {instance_id}#{failed_sequence} of {} \"{}\" \
                             no longer exists in the log",
                            failure.aggregate_type, failure.aggregate_id
                        ))
                    })?;

                let worker =
                    ProjectionWorker::new(self.store.clone(), projection, self.config.clone());
                match worker.apply_one(&event).await? {
                    Applied::Ok => Ok(()),
                    Applied::Failed => Err(Error::HandlerFailure {
                        projection: worker.projection.name(),
                        event_type: event.event_type.clone(),
                        sequence: event.sequence,
                        instance_id: instance_id.to_string(),
                        message: "re-attempt failed; failure count incremented".into(),
                    }),
                }
            }
        }
    }
}

/// Running workers plus the shutdown signal, in the shape of a live
/// subscription handle: signal, then await the tasks.
pub struct ProjectionEngineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProjectionEngineHandle {
    /// Signal all workers to stop and wait for them to finish their
    /// current batch.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[cfg(all(test, feature = "pg-tests"))]
mod pg_tests {
    use super::*;
    use crate::event::{Editor, EventPayload};
    use crate::pg_test::test_store;
    use crate::projection::{AggregateEvents, Subscription};
    use crate::store::AppendWrite;
    use async_trait::async_trait;
    use sqlx::{Postgres, Transaction};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Read model: one row per widget, updated idempotently and guarded by
    /// the event sequence. `fail_sequences` makes the handler throw the
    /// first `failures_per_sequence` times it sees a given sequence.
    struct WidgetProjection {
        strict: bool,
        fail_sequences: Mutex<HashSet<i64>>,
        failures_per_sequence: i32,
        failures_seen: Mutex<std::collections::HashMap<i64, i32>>,
    }

    impl WidgetProjection {
        fn new(strict: bool) -> Self {
            WidgetProjection {
                strict,
                fail_sequences: Mutex::new(HashSet::new()),
                failures_per_sequence: 0,
                failures_seen: Mutex::new(Default::default()),
            }
        }

        fn failing_on(sequence: i64, times: i32, strict: bool) -> Self {
            let mut p = Self::new(strict);
            p.fail_sequences.get_mut().unwrap().insert(sequence);
            p.failures_per_sequence = times;
            p
        }
    }

    #[async_trait]
    impl Projection for WidgetProjection {
        fn name(&self) -> &'static str {
            "widgets"
        }

        fn subscription(&self) -> Subscription {
            Subscription {
                aggregates: vec![AggregateEvents::all_of("widget")],
            }
        }

        fn strict_order(&self) -> bool {
            self.strict
        }

        async fn ensure_schema(&self, pool: &PgPool) -> Result<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS widgets (
                    instance_id TEXT NOT NULL,
                    id          TEXT NOT NULL,
                    label       TEXT NOT NULL,
                    sequence    BIGINT NOT NULL,
                    PRIMARY KEY (instance_id, id)
                )
                "#,
            )
            .execute(pool)
            .await?;
            Ok(())
        }

        async fn apply(
            &self,
            event: &Event,
            tx: &mut Transaction<'_, Postgres>,
        ) -> Result<(), HandlerError> {
            if self.fail_sequences.lock().unwrap().contains(&event.sequence) {
                let mut seen = self.failures_seen.lock().unwrap();
                let count = seen.entry(event.sequence).or_insert(0);
                if *count < self.failures_per_sequence {
                    *count += 1;
                    return Err(HandlerError::Failed("injected failure".into()));
                }
            }

            let label = event
                .payload
                .as_ref()
                .and_then(|p| p.get("label"))
                .and_then(|l| l.as_str())
                .ok_or_else(|| HandlerError::Decode("label missing".into()))?;

            sqlx::query(
                r#"
                INSERT INTO widgets (instance_id, id, label, sequence)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (instance_id, id) DO UPDATE
                SET label = EXCLUDED.label, sequence = EXCLUDED.sequence
                WHERE widgets.sequence < EXCLUDED.sequence
                "#,
            )
            .bind(&event.instance_id)
            .bind(&event.aggregate_id)
            .bind(label)
            .bind(event.sequence)
            .execute(&mut **tx)
            .await?;
            Ok(())
        }

        async fn truncate(
            &self,
            tx: &mut Transaction<'_, Postgres>,
            instance_id: Option<&str>,
        ) -> Result<()> {
            match instance_id {
                Some(instance) => {
                    sqlx::query("DELETE FROM widgets WHERE instance_id = $1")
                        .bind(instance)
                        .execute(&mut **tx)
                        .await?;
                }
                None => {
                    sqlx::query("DELETE FROM widgets").execute(&mut **tx).await?;
                }
            }
            Ok(())
        }
    }

    async fn seed_widget_events(store: &EventStore, instance: &str, id: &str, labels: &[&str]) {
        for (i, label) in labels.iter().enumerate() {
            store
                .push(
                    Uuid::new_v4(),
                    vec![AppendWrite {
                        instance_id: instance.into(),
                        aggregate_type: "widget".into(),
                        aggregate_id: id.into(),
                        aggregate_version: 1,
                        expected_sequence: Some(i as i64),
                        editor: Editor::user("tester"),
                        resource_owner: "org1".into(),
                        events: vec![EventPayload {
                            event_type: "widget.labeled".into(),
                            data: Some(serde_json::json!({"label": label})),
                        }],
                        constraints: Vec::new(),
                    }],
                )
                .await
                .unwrap();
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            failed_event_base_delay: std::time::Duration::from_millis(1),
            ..EngineConfig::default()
        }
    }

    async fn widget_rows(pool: &PgPool, instance: &str) -> Vec<(String, String, i64)> {
        sqlx::query_as(
            "SELECT id, label, sequence FROM widgets WHERE instance_id = $1 ORDER BY id",
        )
        .bind(instance)
        .fetch_all(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn catch_up_builds_rows_and_advances_position() {
        let store = test_store().await;
        seed_widget_events(&store, "inst1", "w1", &["a", "b", "c"]).await;

        let engine = ProjectionEngine::new(store.clone(), fast_config())
            .register(Arc::new(WidgetProjection::new(false)));
        engine.ensure_schema().await.unwrap();
        engine.tick_all().await.unwrap();

        let rows = widget_rows(store.pool(), "inst1").await;
        assert_eq!(rows, vec![("w1".into(), "c".into(), 3)]);

        let position = read_position(store.pool(), "widgets", "inst1")
            .await
            .unwrap()
            .expect("position recorded");
        assert_eq!(position, store.latest_position(Some("inst1")).await.unwrap());
    }

    #[tokio::test]
    async fn replay_from_zero_is_idempotent() {
        let store = test_store().await;
        seed_widget_events(&store, "inst1", "w1", &["a", "b"]).await;
        seed_widget_events(&store, "inst1", "w2", &["x"]).await;

        let engine = ProjectionEngine::new(store.clone(), fast_config())
            .register(Arc::new(WidgetProjection::new(false)));
        engine.ensure_schema().await.unwrap();
        engine.tick_all().await.unwrap();
        let before = widget_rows(store.pool(), "inst1").await;

        engine.reset("widgets", None).await.unwrap();
        assert!(widget_rows(store.pool(), "inst1").await.is_empty());

        engine.tick_all().await.unwrap();
        let after = widget_rows(store.pool(), "inst1").await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn poisoned_event_is_recorded_retried_and_cleared() {
        let store = test_store().await;
        seed_widget_events(&store, "inst1", "w1", &["a", "b", "c"]).await;

        // Sequence 2 fails once, then succeeds on retry.
        let engine = ProjectionEngine::new(store.clone(), fast_config())
            .register(Arc::new(WidgetProjection::failing_on(2, 1, false)));
        engine.ensure_schema().await.unwrap();
        engine.tick_all().await.unwrap();

        // Non-strict: later events applied past the failure.
        let rows = widget_rows(store.pool(), "inst1").await;
        assert_eq!(rows[0].2, 3, "sequence 3 applied despite the poison at 2");
        let failures = engine.failed_events("widgets", Some("inst1")).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].failed_sequence, 2);
        assert_eq!(failures[0].failure_count, 1);
        assert_eq!(failures[0].last_error, "injected failure");

        // Backoff is 1ms in fast_config; the next tick retries and clears.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine.tick_all().await.unwrap();
        let failures = engine.failed_events("widgets", Some("inst1")).await.unwrap();
        assert!(failures.is_empty(), "failure cleared on success: {failures:?}");
    }

    #[tokio::test]
    async fn strict_order_halts_until_resolved() {
        let store = test_store().await;
        seed_widget_events(&store, "inst1", "w1", &["a", "b", "c"]).await;

        // Sequence 2 fails forever; strict order.
        let engine = ProjectionEngine::new(store.clone(), fast_config())
            .register(Arc::new(WidgetProjection::failing_on(2, i32::MAX, true)));
        engine.ensure_schema().await.unwrap();
        engine.tick_all().await.unwrap();

        // Only sequence 1 got through.
        let rows = widget_rows(store.pool(), "inst1").await;
        assert_eq!(rows[0].2, 1, "strict order must not apply past the poison");

        // Skip the poisoned event: processing resumes, decision retained.
        engine
            .resolve_failed_event("widgets", 2, "inst1", FailureResolution::Skip)
            .await
            .unwrap();
        engine.tick_all().await.unwrap();
        let rows = widget_rows(store.pool(), "inst1").await;
        assert_eq!(rows[0].2, 3);
        let failures = engine.failed_events("widgets", Some("inst1")).await.unwrap();
        assert_eq!(failures[0].resolution.as_deref(), Some("skipped"));
    }

    #[tokio::test]
    async fn quarantine_stops_automatic_retries() {
        let store = test_store().await;
        seed_widget_events(&store, "inst1", "w1", &["a"]).await;

        let config = EngineConfig {
            failed_event_base_delay: std::time::Duration::from_millis(1),
            failed_event_max_failures: 2,
            ..EngineConfig::default()
        };
        let engine = ProjectionEngine::new(store.clone(), config)
            .register(Arc::new(WidgetProjection::failing_on(1, i32::MAX, false)));
        engine.ensure_schema().await.unwrap();

        for _ in 0..5 {
            engine.tick_all().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let failures = engine.failed_events("widgets", Some("inst1")).await.unwrap();
        assert_eq!(
            failures[0].failure_count, 2,
            "automatic retries must stop at the cap"
        );

        // Operator retry still increments (handler keeps failing).
        let err = engine
            .resolve_failed_event("widgets", 1, "inst1", FailureResolution::Retry)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandlerFailure { .. }));
        let failures = engine.failed_events("widgets", Some("inst1")).await.unwrap();
        assert_eq!(failures[0].failure_count, 3);
    }

    #[tokio::test]
    async fn lock_excludes_other_workers_until_expiry() {
        let store = test_store().await;
        seed_widget_events(&store, "inst1", "w1", &["a"]).await;

        let projection: Arc<dyn Projection> = Arc::new(WidgetProjection::new(false));
        let config = fast_config();
        ensure_runtime_schema(store.pool()).await.unwrap();

        let holder = ProjectionWorker::new(store.clone(), projection.clone(), config.clone());
        let contender = ProjectionWorker::new(store.clone(), projection, config);

        let held = holder.acquire_lock("inst1").await.unwrap();
        assert!(held.is_some());
        assert!(contender.acquire_lock("inst1").await.unwrap().is_none());
        // Re-acquiring our own lock is fine.
        assert!(holder.acquire_lock("inst1").await.unwrap().is_some());

        holder.release_lock("inst1").await.unwrap();
        assert!(contender.acquire_lock("inst1").await.unwrap().is_some());
    }
}
