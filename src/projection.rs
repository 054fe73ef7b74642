//! Projection trait and bookkeeping tables.
//!
//! A projection is a named, typed handler bundle: it declares the event
//! filter it subscribes to, owns one or more read-model tables shaped for
//! query, and folds each matching event into row mutations inside the
//! transaction the worker opens for it. Handlers must be idempotent
//! upserts (`INSERT ... ON CONFLICT DO UPDATE` guarded by the event's
//! sequence), because restoring a backup replays events at-least-once.
//!
//! The engine records, per `(projection_name, instance_id)`, the position
//! of the last successfully applied event; the worker in
//! [`crate::worker`] advances it only together with a successful apply.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;

use crate::error::Result;
use crate::event::{Event, Position};
use crate::store::EventFilter;

/// Events of one aggregate type a projection subscribes to.
#[derive(Debug, Clone)]
pub struct AggregateEvents {
    /// The aggregate type (e.g. "user").
    pub aggregate_type: String,
    /// Specific event types within it; empty subscribes to all of them.
    pub event_types: Vec<String>,
}

impl AggregateEvents {
    /// Subscribe to every event of `aggregate_type`.
    pub fn all_of(aggregate_type: impl Into<String>) -> Self {
        AggregateEvents {
            aggregate_type: aggregate_type.into(),
            event_types: Vec::new(),
        }
    }

    /// Subscribe to the listed event types of `aggregate_type`.
    pub fn of<I: Into<String>>(
        aggregate_type: impl Into<String>,
        event_types: impl IntoIterator<Item = I>,
    ) -> Self {
        AggregateEvents {
            aggregate_type: aggregate_type.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
        }
    }
}

/// The event filter a projection subscribes to.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Per-aggregate-type subscriptions; an event matches if any entry
    /// accepts it.
    pub aggregates: Vec<AggregateEvents>,
}

impl Subscription {
    /// Does `event` fall under this subscription?
    pub fn matches(&self, event: &Event) -> bool {
        self.aggregates.iter().any(|a| {
            a.aggregate_type == event.aggregate_type
                && (a.event_types.is_empty() || a.event_types.iter().any(|t| *t == event.event_type))
        })
    }

    /// The store-side filter for this subscription, scoped to one instance.
    ///
    /// Filters by aggregate type only; the per-type event lists are
    /// refined in-process via [`matches`](Subscription::matches), since
    /// the store's filter language cannot express "these types for this
    /// aggregate, all types for that one".
    pub fn to_filter(&self, instance_id: &str) -> EventFilter {
        let mut filter = EventFilter::all().in_instance(instance_id);
        for aggregate in &self.aggregates {
            filter = filter.aggregate_type(aggregate.aggregate_type.clone());
        }
        filter
    }

    /// The aggregate types this subscription covers.
    pub fn aggregate_types(&self) -> Vec<String> {
        self.aggregates
            .iter()
            .map(|a| a.aggregate_type.clone())
            .collect()
    }
}

/// Why a handler could not apply an event.
///
/// All variants are recorded in the failed-event table and retried with
/// backoff; none of them crash the worker.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload no longer decodes into what the handler expects.
    #[error("payload decode failed: {0}")]
    Decode(String),

    /// The read-model mutation failed in the database.
    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    /// Any other handler failure, in the handler's own words.
    #[error("{0}")]
    Failed(String),
}

/// A named, typed handler bundle deriving read-model tables from events.
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    /// Stable name, used as the key in the position, lock, and
    /// failed-event tables. Renaming it orphans all three.
    fn name(&self) -> &'static str;

    /// The event filter this projection subscribes to.
    fn subscription(&self) -> Subscription;

    /// Whether a poisoned event halts the `(projection, instance)` pair
    /// until resolved, instead of being skipped and retried while newer
    /// events continue to apply.
    fn strict_order(&self) -> bool {
        false
    }

    /// Create the projection's tables and indexes if absent. Run at
    /// startup, before the first event is dispatched.
    async fn ensure_schema(&self, pool: &PgPool) -> Result<()>;

    /// Fold one event into row mutations, inside the worker's transaction.
    ///
    /// Must be an idempotent upsert keyed by the event's identifying
    /// fields; may be invoked more than once for the same event.
    async fn apply(
        &self,
        event: &Event,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), HandlerError>;

    /// Delete the projection's rows, for the given instance or all of
    /// them, as part of an operator-initiated reset. The engine clears
    /// the position and failed-event records in the same transaction.
    async fn truncate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance_id: Option<&str>,
    ) -> Result<()>;
}

/// Ensure the engine's own bookkeeping tables exist.
pub(crate) async fn ensure_runtime_schema(pool: &PgPool) -> Result<()> {
    let ddl = [
        r#"
        CREATE TABLE IF NOT EXISTS projection_positions (
            projection_name   TEXT NOT NULL,
            instance_id       TEXT NOT NULL,
            last_position     DOUBLE PRECISION NOT NULL,
            last_in_tx_order  INT NOT NULL,
            updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (projection_name, instance_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS projection_locks (
            projection_name TEXT NOT NULL,
            instance_id     TEXT NOT NULL,
            worker_id       TEXT NOT NULL,
            acquired_at     TIMESTAMPTZ NOT NULL,
            expires_at      TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (projection_name, instance_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS projection_failures (
            projection_name TEXT NOT NULL,
            failed_sequence BIGINT NOT NULL,
            instance_id     TEXT NOT NULL,
            aggregate_type  TEXT NOT NULL,
            aggregate_id    TEXT NOT NULL,
            event_type      TEXT NOT NULL,
            failure_count   INT NOT NULL,
            last_error      TEXT NOT NULL,
            first_failed_at TIMESTAMPTZ NOT NULL,
            last_failed_at  TIMESTAMPTZ NOT NULL,
            resolution      TEXT,
            PRIMARY KEY (projection_name, failed_sequence, instance_id)
        )
        "#,
    ];
    for statement in ddl {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Read the recorded position for `(projection_name, instance_id)`.
///
/// `None` means the projection has not applied anything for the instance;
/// callers treat that as [`Position::ZERO`].
pub(crate) async fn read_position(
    pool: &PgPool,
    projection_name: &str,
    instance_id: &str,
) -> Result<Option<Position>> {
    let row: Option<(f64, i32)> = sqlx::query_as(
        "SELECT last_position, last_in_tx_order FROM projection_positions \
         WHERE projection_name = $1 AND instance_id = $2",
    )
    .bind(projection_name)
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(p, o)| Position::new(p, o)))
}

/// Advance the recorded position, inside the apply transaction.
///
/// Advance-only: an upsert with a stale position (possible when a retried
/// failed event lies behind the frontier) leaves the record untouched.
pub(crate) async fn write_position(
    tx: &mut Transaction<'_, Postgres>,
    projection_name: &str,
    instance_id: &str,
    position: Position,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO projection_positions
            (projection_name, instance_id, last_position, last_in_tx_order, updated_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (projection_name, instance_id) DO UPDATE
        SET last_position = EXCLUDED.last_position,
            last_in_tx_order = EXCLUDED.last_in_tx_order,
            updated_at = NOW()
        WHERE (projection_positions.last_position, projection_positions.last_in_tx_order)
            < (EXCLUDED.last_position, EXCLUDED.last_in_tx_order)
        "#,
    )
    .bind(projection_name)
    .bind(instance_id)
    .bind(position.position)
    .bind(position.in_tx_order)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
