//! Append-only event store on PostgreSQL.
//!
//! The store owns three tables: `events` (the log itself),
//! `aggregate_sequences` (one counter row per aggregate, locked during
//! append to serialize writers), and `unique_constraints` (the
//! cross-aggregate registry, written atomically with events).
//!
//! Appends are optimistic: callers state the sequence they loaded their
//! write-model at, and the push fails with
//! [`Error::ConcurrencyConflict`](crate::Error::ConcurrencyConflict) if a
//! concurrent writer got there first. Everything inside one
//! [`push`](EventStore::push) commits or rolls back together, including
//! unique-constraint reservations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::{FromRow, QueryBuilder, Transaction};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{Editor, Event, EventPayload, Position};
use crate::unique::{self, UniqueConstraint};

/// How long a follow-mode stream sleeps between polls when no in-process
/// append notification arrives. Covers appends made by other processes.
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Batch size used internally by [`EventStore::stream`].
const STREAM_BATCH_SIZE: i64 = 200;

/// One aggregate's contribution to a [`push`](EventStore::push).
///
/// Carries the target aggregate triple, the sequence the caller loaded its
/// write-model at, the ordered event payloads to append, and any
/// unique-constraint operations that must commit with them.
#[derive(Debug, Clone)]
pub struct AppendWrite {
    /// Tenant the aggregate belongs to.
    pub instance_id: String,
    /// Aggregate type (e.g. "user").
    pub aggregate_type: String,
    /// Aggregate instance id.
    pub aggregate_id: String,
    /// Schema version of the aggregate type.
    pub aggregate_version: i16,
    /// Sequence the caller observed; `None` skips the optimistic check
    /// (used for system writes that tolerate interleaving).
    pub expected_sequence: Option<i64>,
    /// Who issued the producing command.
    pub editor: Editor,
    /// Owning organization of the aggregate.
    pub resource_owner: String,
    /// Ordered payloads to append; sequence numbers are assigned in this
    /// order.
    pub events: Vec<EventPayload>,
    /// Unique-constraint operations riding along with the events.
    pub constraints: Vec<UniqueConstraint>,
}

/// Filter language for [`query`](EventStore::query) and
/// [`stream`](EventStore::stream).
///
/// All vector fields are set-membership filters; empty means "any".
/// Results are ordered by `(position, in_tx_order)`, ascending unless
/// [`descending`](EventFilter::descending) is called.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    from: Option<(Position, bool)>, // bound, inclusive?
    to: Option<Position>,
    instance_ids: Vec<String>,
    aggregate_types: Vec<String>,
    aggregate_ids: Vec<String>,
    event_types: Vec<String>,
    editor_users: Vec<String>,
    limit: Option<i64>,
    descending: bool,
}

impl EventFilter {
    /// Match every event in the log.
    pub fn all() -> Self {
        Self::default()
    }

    /// Events at or beyond `position` (inclusive lower bound).
    pub fn from_position(mut self, position: Position) -> Self {
        self.from = Some((position, true));
        self
    }

    /// Events strictly beyond `position`. This is what projection workers
    /// use to resume past their recorded position.
    pub fn after_position(mut self, position: Position) -> Self {
        self.from = Some((position, false));
        self
    }

    /// Events at or before `position` (inclusive upper bound).
    pub fn up_to_position(mut self, position: Position) -> Self {
        self.to = Some(position);
        self
    }

    /// Restrict to one instance.
    pub fn in_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_ids.push(instance_id.into());
        self
    }

    /// Restrict to a set of instances.
    pub fn in_instances<I: Into<String>>(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.instance_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Restrict to an aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_types.push(aggregate_type.into());
        self
    }

    /// Restrict to specific aggregate ids.
    pub fn aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_ids.push(aggregate_id.into());
        self
    }

    /// Restrict to specific event types.
    pub fn event_types<I: Into<String>>(mut self, types: impl IntoIterator<Item = I>) -> Self {
        self.event_types.extend(types.into_iter().map(Into::into));
        self
    }

    /// Restrict to events written by a specific human editor.
    pub fn editor_user(mut self, user_id: impl Into<String>) -> Self {
        self.editor_users.push(user_id.into());
        self
    }

    /// Cap the number of returned events.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Return newest events first. Ignored by [`EventStore::stream`].
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Append the WHERE/ORDER/LIMIT clauses to a query builder whose SELECT
    /// is already in place. Kept separate so tests can assert the shape.
    fn push_clauses(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" WHERE 1 = 1");

        if let Some((bound, inclusive)) = &self.from {
            // Lexicographic bound over the (position, in_tx_order) pair.
            qb.push(" AND (position > ")
                .push_bind(bound.position)
                .push(" OR (position = ")
                .push_bind(bound.position)
                .push(if *inclusive {
                    " AND in_tx_order >= "
                } else {
                    " AND in_tx_order > "
                })
                .push_bind(bound.in_tx_order)
                .push("))");
        }
        if let Some(to) = &self.to {
            qb.push(" AND (position < ")
                .push_bind(to.position)
                .push(" OR (position = ")
                .push_bind(to.position)
                .push(" AND in_tx_order <= ")
                .push_bind(to.in_tx_order)
                .push("))");
        }
        if !self.instance_ids.is_empty() {
            qb.push(" AND instance_id = ANY(")
                .push_bind(self.instance_ids.clone())
                .push(")");
        }
        if !self.aggregate_types.is_empty() {
            qb.push(" AND aggregate_type = ANY(")
                .push_bind(self.aggregate_types.clone())
                .push(")");
        }
        if !self.aggregate_ids.is_empty() {
            qb.push(" AND aggregate_id = ANY(")
                .push_bind(self.aggregate_ids.clone())
                .push(")");
        }
        if !self.event_types.is_empty() {
            qb.push(" AND event_type = ANY(")
                .push_bind(self.event_types.clone())
                .push(")");
        }
        if !self.editor_users.is_empty() {
            qb.push(" AND editor_user = ANY(")
                .push_bind(self.editor_users.clone())
                .push(")");
        }

        if self.descending {
            qb.push(" ORDER BY position DESC, in_tx_order DESC");
        } else {
            qb.push(" ORDER BY position ASC, in_tx_order ASC");
        }
        if let Some(limit) = self.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
    }
}

/// Row shape of the `events` table. Kept separate from [`Event`] so the
/// DB mapping can evolve without touching the domain-facing type.
#[derive(Debug, FromRow)]
struct EventRow {
    instance_id: String,
    aggregate_type: String,
    aggregate_id: String,
    sequence: i64,
    aggregate_version: i16,
    event_type: String,
    payload: Option<serde_json::Value>,
    editor_user: Option<String>,
    editor_service: Option<String>,
    resource_owner: String,
    created_at: DateTime<Utc>,
    command_id: Uuid,
    position: f64,
    in_tx_order: i32,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            position: Position::new(row.position, row.in_tx_order),
            sequence: row.sequence,
            instance_id: row.instance_id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            aggregate_version: row.aggregate_version,
            event_type: row.event_type,
            payload: row.payload,
            editor: Editor {
                user_id: row.editor_user,
                service: row.editor_service,
            },
            resource_owner: row.resource_owner,
            created_at: row.created_at,
            command_id: row.command_id,
        }
    }
}

const EVENT_COLUMNS: &str = "instance_id, aggregate_type, aggregate_id, sequence, \
     aggregate_version, event_type, payload, editor_user, editor_service, \
     resource_owner, created_at, command_id, position, in_tx_order";

struct Inner {
    pool: PgPool,
    /// Bumped after every committed push so in-process followers wake
    /// without waiting for the poll interval.
    append_notify: watch::Sender<u64>,
}

/// Durable append-only event log, cheap to clone and share across tasks.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Inner>,
}

impl EventStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        let (append_notify, _) = watch::channel(0);
        EventStore {
            inner: Arc::new(Inner {
                pool,
                append_notify,
            }),
        }
    }

    /// Connect to Postgres with explicit pool timeouts and wrap the pool.
    ///
    /// Hanging forever on a dead database is unacceptable for the paths
    /// this store sits on, so acquisition is bounded.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool, for components that share it (projections,
    /// query accessors).
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// Ensure the store's tables and indexes exist.
    ///
    /// Idempotent; run once at startup before serving commands.
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS events (
                instance_id       TEXT NOT NULL,
                aggregate_type    TEXT NOT NULL,
                aggregate_id      TEXT NOT NULL,
                sequence          BIGINT NOT NULL,
                aggregate_version SMALLINT NOT NULL,
                event_type        TEXT NOT NULL,
                payload           JSONB,
                editor_user       TEXT,
                editor_service    TEXT,
                resource_owner    TEXT NOT NULL,
                created_at        TIMESTAMPTZ NOT NULL,
                command_id        UUID NOT NULL,
                position          DOUBLE PRECISION NOT NULL,
                in_tx_order       INT NOT NULL,
                PRIMARY KEY (instance_id, aggregate_type, aggregate_id, sequence)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_events_position \
             ON events (position, in_tx_order)",
            "CREATE INDEX IF NOT EXISTS idx_events_instance_event_type \
             ON events (instance_id, event_type)",
            r#"
            CREATE TABLE IF NOT EXISTS aggregate_sequences (
                instance_id      TEXT NOT NULL,
                aggregate_type   TEXT NOT NULL,
                aggregate_id     TEXT NOT NULL,
                current_sequence BIGINT NOT NULL DEFAULT 0,
                updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (instance_id, aggregate_type, aggregate_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS unique_constraints (
                instance_id  TEXT NOT NULL,
                unique_type  TEXT NOT NULL,
                unique_field TEXT NOT NULL,
                PRIMARY KEY (instance_id, unique_type, unique_field)
            )
            "#,
        ];
        for statement in ddl {
            sqlx::query(statement).execute(&self.inner.pool).await?;
        }
        Ok(())
    }

    /// Append events (and their unique-constraint operations) atomically.
    ///
    /// For each write, the aggregate's counter row is locked `FOR UPDATE`,
    /// the caller's `expected_sequence` is checked against the stored one,
    /// gapless sequences are assigned, and the events are inserted with a
    /// transaction-wide position (database time) plus a per-event
    /// `in_tx_order` preserving the caller-supplied order. Constraint
    /// operations run in the same transaction; any failure rolls the whole
    /// batch back with no partial effects.
    ///
    /// Returns the committed events in append order.
    ///
    /// # Errors
    ///
    /// [`Error::ConcurrencyConflict`] when an `expected_sequence` does not
    /// match the stored counter, [`Error::UniqueConstraintViolation`] when
    /// a constraint add collides, [`Error::TransientStorage`] for
    /// retryable database failures.
    pub async fn push(&self, command_id: Uuid, writes: Vec<AppendWrite>) -> Result<Vec<Event>> {
        if writes.iter().all(|w| w.events.is_empty() && w.constraints.is_empty()) {
            return Ok(Vec::new());
        }

        let mut tx = self.inner.pool.begin().await?;

        // One position per transaction: database time, so inter-transaction
        // order tracks commit order without a global counter.
        let (position, created_at): (f64, DateTime<Utc>) = sqlx::query_as(
            "SELECT EXTRACT(EPOCH FROM clock_timestamp())::DOUBLE PRECISION, NOW()",
        )
        .fetch_one(&mut *tx)
        .await?;

        let mut appended = Vec::new();
        let mut in_tx_order: i32 = 0;

        for write in &writes {
            let current = lock_sequence(&mut tx, write).await?;

            if let Some(expected) = write.expected_sequence {
                if expected != current {
                    // Dropping the transaction rolls everything back.
                    return Err(Error::ConcurrencyConflict {
                        instance_id: write.instance_id.clone(),
                        aggregate_type: write.aggregate_type.clone(),
                        aggregate_id: write.aggregate_id.clone(),
                        expected,
                        current,
                    });
                }
            }

            for (i, payload) in write.events.iter().enumerate() {
                let sequence = current + 1 + i as i64;
                sqlx::query(
                    r#"
                    INSERT INTO events (
                        instance_id, aggregate_type, aggregate_id, sequence,
                        aggregate_version, event_type, payload,
                        editor_user, editor_service, resource_owner,
                        created_at, command_id, position, in_tx_order
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    "#,
                )
                .bind(&write.instance_id)
                .bind(&write.aggregate_type)
                .bind(&write.aggregate_id)
                .bind(sequence)
                .bind(write.aggregate_version)
                .bind(&payload.event_type)
                .bind(&payload.data)
                .bind(&write.editor.user_id)
                .bind(&write.editor.service)
                .bind(&write.resource_owner)
                .bind(created_at)
                .bind(command_id)
                .bind(position)
                .bind(in_tx_order)
                .execute(&mut *tx)
                .await?;

                appended.push(Event {
                    position: Position::new(position, in_tx_order),
                    sequence,
                    instance_id: write.instance_id.clone(),
                    aggregate_type: write.aggregate_type.clone(),
                    aggregate_id: write.aggregate_id.clone(),
                    aggregate_version: write.aggregate_version,
                    event_type: payload.event_type.clone(),
                    payload: payload.data.clone(),
                    editor: write.editor.clone(),
                    resource_owner: write.resource_owner.clone(),
                    created_at,
                    command_id,
                });
                in_tx_order += 1;
            }

            if !write.events.is_empty() {
                let new_sequence = current + write.events.len() as i64;
                sqlx::query(
                    r#"
                    UPDATE aggregate_sequences
                    SET current_sequence = $4, updated_at = NOW()
                    WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
                    "#,
                )
                .bind(&write.instance_id)
                .bind(&write.aggregate_type)
                .bind(&write.aggregate_id)
                .bind(new_sequence)
                .execute(&mut *tx)
                .await?;
            }

            for constraint in &write.constraints {
                unique::apply(&mut tx, &write.instance_id, constraint).await?;
            }
        }

        tx.commit().await?;

        tracing::debug!(
            command_id = %command_id,
            events = appended.len(),
            position,
            "appended event batch"
        );

        // Wake in-process followers. Receivers may be gone; that's fine.
        self.inner.append_notify.send_modify(|n| *n = n.wrapping_add(1));

        Ok(appended)
    }

    /// Read events matching `filter`, ordered by `(position, in_tx_order)`.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut qb = QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events"));
        filter.push_clauses(&mut qb);
        let rows: Vec<EventRow> = qb
            .build_query_as()
            .fetch_all(&self.inner.pool)
            .await?;
        Ok(rows.into_iter().map(Event::from).collect())
    }

    /// The position of the newest event, optionally scoped to one instance.
    ///
    /// Returns [`Position::ZERO`] for an empty log.
    pub async fn latest_position(&self, instance_id: Option<&str>) -> Result<Position> {
        let row: Option<(f64, i32)> = match instance_id {
            Some(instance) => {
                sqlx::query_as(
                    "SELECT position, in_tx_order FROM events WHERE instance_id = $1 \
                     ORDER BY position DESC, in_tx_order DESC LIMIT 1",
                )
                .bind(instance)
                .fetch_optional(&self.inner.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT position, in_tx_order FROM events \
                     ORDER BY position DESC, in_tx_order DESC LIMIT 1",
                )
                .fetch_optional(&self.inner.pool)
                .await?
            }
        };
        Ok(row
            .map(|(position, in_tx_order)| Position::new(position, in_tx_order))
            .unwrap_or(Position::ZERO))
    }

    /// Fetch one event by its aggregate triple and sequence.
    ///
    /// Used by the projection worker to re-load an event recorded in the
    /// failed-event table.
    pub(crate) async fn get_event(
        &self,
        instance_id: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        sequence: i64,
    ) -> Result<Option<Event>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE instance_id = $1 AND aggregate_type = $2 \
               AND aggregate_id = $3 AND sequence = $4"
        ))
        .bind(instance_id)
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(sequence)
        .fetch_optional(&self.inner.pool)
        .await?;
        Ok(row.map(Event::from))
    }

    /// Lazily stream events matching `filter` in `(position, in_tx_order)`
    /// order.
    ///
    /// With `follow = false` the stream ends once it has caught up with the
    /// log tail. With `follow = true` it then waits for new appends:
    /// in-process pushes wake it immediately via the append notifier, and a
    /// poll interval covers appends from other processes. The caller's
    /// `limit` and `descending` settings are ignored; streams are always
    /// ascending and unbounded.
    ///
    /// Dropping the returned stream stops the background reader.
    pub fn stream(&self, filter: EventFilter, follow: bool) -> ReceiverStream<Result<Event>> {
        let (tx, rx) = mpsc::channel(64);
        let store = self.clone();

        tokio::spawn(async move {
            let mut notify = store.inner.append_notify.subscribe();
            notify.mark_unchanged();
            let mut cursor: Option<Position> = None;

            loop {
                let mut batch_filter = filter.clone().limit(STREAM_BATCH_SIZE);
                batch_filter.descending = false;
                if let Some(position) = cursor {
                    batch_filter = batch_filter.after_position(position);
                }

                let batch = match store.query(&batch_filter).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        // Surface the error to the consumer and stop.
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                let drained = (batch.len() as i64) < STREAM_BATCH_SIZE;
                for event in batch {
                    cursor = Some(event.position);
                    if tx.send(Ok(event)).await.is_err() {
                        // Consumer dropped the stream.
                        return;
                    }
                }

                if drained {
                    if !follow {
                        return;
                    }
                    tokio::select! {
                        changed = notify.changed() => {
                            if changed.is_err() {
                                // Store dropped; nothing more will arrive.
                                return;
                            }
                        }
                        _ = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => {}
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

/// Ensure the aggregate's counter row exists and lock it, returning the
/// stored sequence. The lock serializes concurrent pushes per aggregate
/// until this transaction commits or rolls back.
async fn lock_sequence(tx: &mut Transaction<'_, Postgres>, write: &AppendWrite) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO aggregate_sequences (instance_id, aggregate_type, aggregate_id, current_sequence)
        VALUES ($1, $2, $3, 0)
        ON CONFLICT (instance_id, aggregate_type, aggregate_id) DO NOTHING
        "#,
    )
    .bind(&write.instance_id)
    .bind(&write.aggregate_type)
    .bind(&write.aggregate_id)
    .execute(&mut **tx)
    .await?;

    let (current,): (i64,) = sqlx::query_as(
        r#"
        SELECT current_sequence
        FROM aggregate_sequences
        WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
        FOR UPDATE
        "#,
    )
    .bind(&write.instance_id)
    .bind(&write.aggregate_type)
    .bind(&write.aggregate_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_sql(filter: &EventFilter) -> String {
        let mut qb = QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events"));
        filter.push_clauses(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn empty_filter_orders_ascending() {
        let sql = filter_sql(&EventFilter::all());
        assert!(sql.contains("ORDER BY position ASC, in_tx_order ASC"));
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn after_position_uses_strict_pair_comparison() {
        let sql = filter_sql(&EventFilter::all().after_position(Position::new(1.0, 2)));
        assert!(sql.contains("position > "), "got: {sql}");
        assert!(sql.contains("in_tx_order > "), "got: {sql}");
        assert!(!sql.contains("in_tx_order >= "), "got: {sql}");
    }

    #[test]
    fn from_position_is_inclusive() {
        let sql = filter_sql(&EventFilter::all().from_position(Position::new(1.0, 2)));
        assert!(sql.contains("in_tx_order >= "), "got: {sql}");
    }

    #[test]
    fn membership_filters_render_as_any() {
        let filter = EventFilter::all()
            .in_instance("inst1")
            .aggregate_type("user")
            .event_types(["user.human.added"])
            .editor_user("admin");
        let sql = filter_sql(&filter);
        assert!(sql.contains("instance_id = ANY("));
        assert!(sql.contains("aggregate_type = ANY("));
        assert!(sql.contains("event_type = ANY("));
        assert!(sql.contains("editor_user = ANY("));
    }

    #[test]
    fn descending_with_limit() {
        let sql = filter_sql(&EventFilter::all().descending().limit(10));
        assert!(sql.contains("ORDER BY position DESC, in_tx_order DESC"));
        assert!(sql.contains("LIMIT"));
    }
}

#[cfg(all(test, feature = "pg-tests"))]
mod pg_tests {
    use super::*;
    use crate::pg_test::test_store;
    use tokio_stream::StreamExt;

    fn write(instance: &str, aggregate_id: &str, expected: i64, types: &[&str]) -> AppendWrite {
        AppendWrite {
            instance_id: instance.into(),
            aggregate_type: "user".into(),
            aggregate_id: aggregate_id.into(),
            aggregate_version: 1,
            expected_sequence: Some(expected),
            editor: Editor::user("tester"),
            resource_owner: "org1".into(),
            events: types
                .iter()
                .map(|t| EventPayload {
                    event_type: (*t).to_string(),
                    data: Some(serde_json::json!({"via": "pg-test"})),
                })
                .collect(),
            constraints: Vec::new(),
        }
    }

    #[tokio::test]
    async fn push_assigns_gapless_sequences_across_batches() {
        let store = test_store().await;
        let first = store
            .push(Uuid::new_v4(), vec![write("inst1", "u1", 0, &["user.human.added"])])
            .await
            .unwrap();
        assert_eq!(first[0].sequence, 1);

        let second = store
            .push(
                Uuid::new_v4(),
                vec![write("inst1", "u1", 1, &["user.email.changed", "user.deactivated"])],
            )
            .await
            .unwrap();
        assert_eq!(second[0].sequence, 2);
        assert_eq!(second[1].sequence, 3);
        assert!(second[0].position > first[0].position);
        assert_eq!(second[0].position.position, second[1].position.position);
        assert!(second[0].position.in_tx_order < second[1].position.in_tx_order);
    }

    #[tokio::test]
    async fn stale_expected_sequence_conflicts_and_rolls_back() {
        let store = test_store().await;
        store
            .push(Uuid::new_v4(), vec![write("inst1", "u1", 0, &["user.human.added"])])
            .await
            .unwrap();

        let err = store
            .push(Uuid::new_v4(), vec![write("inst1", "u1", 0, &["user.email.changed"])])
            .await
            .unwrap_err();
        match err {
            Error::ConcurrencyConflict { expected, current, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(current, 1);
            }
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }

        // Nothing from the failed batch is visible.
        let events = store
            .query(&EventFilter::all().in_instance("inst1"))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_pushes_at_same_sequence_one_wins() {
        let store = test_store().await;
        store
            .push(Uuid::new_v4(), vec![write("inst1", "u1", 0, &["user.human.added"])])
            .await
            .unwrap();

        let a = store.push(Uuid::new_v4(), vec![write("inst1", "u1", 1, &["user.email.changed"])]);
        let b = store.push(Uuid::new_v4(), vec![write("inst1", "u1", 1, &["user.email.changed"])]);
        let (ra, rb) = tokio::join!(a, b);

        let successes = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one writer must win: {ra:?} {rb:?}");
        let loser = if ra.is_err() { ra } else { rb };
        assert!(matches!(loser, Err(Error::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn unique_constraint_reserved_per_instance() {
        let store = test_store().await;
        let reserve = |instance: &str, user: &str| {
            let mut w = write(instance, user, 0, &["user.human.added"]);
            w.constraints.push(
                UniqueConstraint::add("username", "Alice", "username already taken")
                    .ignoring_case(),
            );
            w
        };

        store.push(Uuid::new_v4(), vec![reserve("inst1", "u1")]).await.unwrap();

        // Same instance, different casing: violation with the domain message.
        let err = store
            .push(Uuid::new_v4(), vec![reserve("inst1", "u2")])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "username already taken");
        // The events of the failed batch rolled back with the constraint.
        let u2 = store
            .query(&EventFilter::all().in_instance("inst1").aggregate_id("u2"))
            .await
            .unwrap();
        assert!(u2.is_empty());

        // Different instance: fine.
        store.push(Uuid::new_v4(), vec![reserve("inst2", "u1")]).await.unwrap();
    }

    #[tokio::test]
    async fn removing_unheld_constraint_is_noop_and_release_allows_reuse() {
        let store = test_store().await;

        let mut free = write("inst1", "u1", 0, &["user.removed"]);
        free.constraints.push(UniqueConstraint::remove("username", "ghost"));
        store.push(Uuid::new_v4(), vec![free]).await.unwrap();

        let mut take = write("inst1", "u2", 0, &["user.human.added"]);
        take.constraints
            .push(UniqueConstraint::add("username", "bob", "taken"));
        store.push(Uuid::new_v4(), vec![take]).await.unwrap();

        let mut release = write("inst1", "u2", 1, &["user.removed"]);
        release.constraints.push(UniqueConstraint::remove("username", "bob"));
        store.push(Uuid::new_v4(), vec![release]).await.unwrap();

        let mut retake = write("inst1", "u3", 0, &["user.human.added"]);
        retake
            .constraints
            .push(UniqueConstraint::add("username", "bob", "taken"));
        store.push(Uuid::new_v4(), vec![retake]).await.unwrap();
    }

    #[tokio::test]
    async fn query_is_strictly_ordered_and_filters_by_instance() {
        let store = test_store().await;
        for i in 0..5 {
            let instance = if i % 2 == 0 { "inst1" } else { "inst2" };
            store
                .push(
                    Uuid::new_v4(),
                    vec![write(instance, &format!("u{i}"), 0, &["user.human.added"])],
                )
                .await
                .unwrap();
        }

        let all = store.query(&EventFilter::all()).await.unwrap();
        assert_eq!(all.len(), 5);
        for pair in all.windows(2) {
            assert!(pair[0].position < pair[1].position, "positions must increase");
        }

        let inst1 = store
            .query(&EventFilter::all().in_instance("inst1"))
            .await
            .unwrap();
        assert_eq!(inst1.len(), 3);
        assert!(inst1.iter().all(|e| e.instance_id == "inst1"));
    }

    #[tokio::test]
    async fn latest_position_tracks_tail() {
        let store = test_store().await;
        assert_eq!(store.latest_position(None).await.unwrap(), Position::ZERO);

        let events = store
            .push(Uuid::new_v4(), vec![write("inst1", "u1", 0, &["user.human.added"])])
            .await
            .unwrap();
        assert_eq!(store.latest_position(None).await.unwrap(), events[0].position);
        assert_eq!(
            store.latest_position(Some("inst2")).await.unwrap(),
            Position::ZERO
        );
    }

    #[tokio::test]
    async fn stream_catches_up_and_follows() {
        let store = test_store().await;
        store
            .push(Uuid::new_v4(), vec![write("inst1", "u1", 0, &["user.human.added"])])
            .await
            .unwrap();

        // Non-follow: finite.
        let caught_up: Vec<_> = store
            .stream(EventFilter::all(), false)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(caught_up.len(), 1);

        // Follow: sees an event appended after subscription.
        let mut live = store.stream(EventFilter::all(), true);
        let first = live.next().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);

        store
            .push(Uuid::new_v4(), vec![write("inst1", "u1", 1, &["user.email.changed"])])
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), live.next())
            .await
            .expect("follow stream should yield within the deadline")
            .unwrap()
            .unwrap();
        assert_eq!(second.event_type, "user.email.changed");
    }
}
