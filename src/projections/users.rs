//! The users read model.
//!
//! One row per live user. Removed users are deleted from the table; their
//! history stays in the log. All mutations are sequence-guarded upserts so
//! at-least-once replay converges on the same rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, QueryBuilder, Transaction};

use crate::aggregate::Aggregate;
use crate::domain::user::{User, UserEvent, UserState};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::projection::{AggregateEvents, HandlerError, Projection, Subscription};
use crate::query::{Cursor, Page, SearchResult, SortDirection, TextMatch};

/// Stable projection name; keys the position, lock, and failure tables.
pub const NAME: &str = "projection.users";

/// State labels as stored in the read model.
fn state_label(state: UserState) -> &'static str {
    match state {
        UserState::Unspecified => "unspecified",
        UserState::Active => "active",
        UserState::Inactive => "inactive",
        UserState::Removed => "removed",
    }
}

/// One row of the users read model.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct UserRow {
    /// Tenant the user belongs to.
    pub instance_id: String,
    /// User id (the aggregate id).
    pub id: String,
    /// Owning org.
    pub resource_owner: String,
    /// Login name.
    pub username: String,
    /// Contact email.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Lifecycle state label ("active", "inactive").
    pub state: String,
    /// When the user was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub changed_at: DateTime<Utc>,
    /// Sequence of the newest event folded into the row.
    pub sequence: i64,
}

/// Search filter over the users read model.
///
/// All fields are AND-combined; `None`/empty means "any".
#[derive(Debug, Clone, Default)]
pub struct UserSearch {
    /// Match on the username.
    pub username: Option<TextMatch>,
    /// Match on the email.
    pub email: Option<TextMatch>,
    /// Match on "first last" display name.
    pub display_name: Option<TextMatch>,
    /// Restrict to these lifecycle states.
    pub states: Vec<UserState>,
    /// Only users created at or after this time.
    pub created_after: Option<DateTime<Utc>>,
    /// Only users created at or before this time.
    pub created_before: Option<DateTime<Utc>>,
}

impl UserSearch {
    /// Append the filter's WHERE conjuncts. The leading
    /// `instance_id = ...` conjunct is already in place.
    fn push_filters(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        if let Some(m) = &self.username {
            qb.push(" AND ");
            m.push_sql(qb, "username");
        }
        if let Some(m) = &self.email {
            qb.push(" AND ");
            m.push_sql(qb, "email");
        }
        if let Some(m) = &self.display_name {
            qb.push(" AND ");
            m.push_sql(qb, "(first_name || ' ' || last_name)");
        }
        if !self.states.is_empty() {
            let labels: Vec<String> = self
                .states
                .iter()
                .map(|s| state_label(*s).to_string())
                .collect();
            qb.push(" AND state = ANY(").push_bind(labels).push(")");
        }
        if let Some(after) = self.created_after {
            qb.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = self.created_before {
            qb.push(" AND created_at <= ").push_bind(before);
        }
    }
}

/// Sortable columns. All are indexed with `instance_id` leading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserSortKey {
    /// Sort by username.
    #[default]
    Username,
    /// Sort by email.
    Email,
    /// Sort by creation time.
    CreatedAt,
}

impl UserSortKey {
    fn column(self) -> &'static str {
        match self {
            UserSortKey::Username => "username",
            UserSortKey::Email => "email",
            UserSortKey::CreatedAt => "created_at",
        }
    }

    /// The row's sort-key value, as stored in a cursor.
    fn cursor_value(self, row: &UserRow) -> serde_json::Value {
        match self {
            UserSortKey::Username => serde_json::json!(row.username),
            UserSortKey::Email => serde_json::json!(row.email),
            UserSortKey::CreatedAt => serde_json::json!(row.created_at.to_rfc3339()),
        }
    }

    /// Bind a cursor's sort-key value with the column's SQL type.
    fn push_cursor_bound(
        self,
        qb: &mut QueryBuilder<'_, Postgres>,
        cursor: &Cursor,
    ) -> Result<()> {
        match self {
            UserSortKey::Username | UserSortKey::Email => {
                let value = cursor
                    .sort_key
                    .as_str()
                    .ok_or_else(|| Error::validation("cursor does not fit the sort key"))?;
                qb.push_bind(value.to_string());
            }
            UserSortKey::CreatedAt => {
                let value = cursor
                    .sort_key
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .ok_or_else(|| Error::validation("cursor does not fit the sort key"))?;
                qb.push_bind(value.with_timezone(&Utc));
            }
        }
        Ok(())
    }
}

const ROW_COLUMNS: &str = "instance_id, id, resource_owner, username, email, \
     first_name, last_name, state, created_at, changed_at, sequence";

/// The users projection: handler plus query accessors.
#[derive(Debug, Clone, Default)]
pub struct UsersProjection;

#[async_trait]
impl Projection for UsersProjection {
    fn name(&self) -> &'static str {
        NAME
    }

    fn subscription(&self) -> Subscription {
        Subscription {
            aggregates: vec![AggregateEvents::all_of(User::AGGREGATE_TYPE)],
        }
    }

    async fn ensure_schema(&self, pool: &PgPool) -> Result<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS projection_users (
                instance_id    TEXT NOT NULL,
                id             TEXT NOT NULL,
                resource_owner TEXT NOT NULL,
                username       TEXT NOT NULL,
                email          TEXT NOT NULL,
                first_name     TEXT NOT NULL DEFAULT '',
                last_name      TEXT NOT NULL DEFAULT '',
                state          TEXT NOT NULL,
                created_at     TIMESTAMPTZ NOT NULL,
                changed_at     TIMESTAMPTZ NOT NULL,
                sequence       BIGINT NOT NULL,
                PRIMARY KEY (instance_id, id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_projection_users_username \
             ON projection_users (instance_id, LOWER(username))",
            "CREATE INDEX IF NOT EXISTS idx_projection_users_email \
             ON projection_users (instance_id, email)",
            "CREATE INDEX IF NOT EXISTS idx_projection_users_created_at \
             ON projection_users (instance_id, created_at)",
        ];
        for statement in ddl {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        event: &Event,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), HandlerError> {
        // Unknown event types are tolerated for forward compatibility.
        let Some(domain_event) = event.domain_event::<UserEvent>() else {
            return Ok(());
        };

        match domain_event {
            UserEvent::HumanAdded {
                username,
                email,
                first_name,
                last_name,
                ..
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO projection_users (
                        instance_id, id, resource_owner, username, email,
                        first_name, last_name, state, created_at, changed_at, sequence
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, $10)
                    ON CONFLICT (instance_id, id) DO UPDATE SET
                        resource_owner = EXCLUDED.resource_owner,
                        username = EXCLUDED.username,
                        email = EXCLUDED.email,
                        first_name = EXCLUDED.first_name,
                        last_name = EXCLUDED.last_name,
                        state = EXCLUDED.state,
                        created_at = EXCLUDED.created_at,
                        changed_at = EXCLUDED.changed_at,
                        sequence = EXCLUDED.sequence
                    WHERE projection_users.sequence < EXCLUDED.sequence
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(&event.resource_owner)
                .bind(username)
                .bind(email)
                .bind(first_name)
                .bind(last_name)
                .bind(state_label(UserState::Active))
                .bind(event.created_at)
                .bind(event.sequence)
                .execute(&mut **tx)
                .await?;
            }
            UserEvent::EmailChanged { email } => {
                self.update_field(event, tx, "email", &email).await?;
            }
            UserEvent::UsernameChanged { username, .. } => {
                self.update_field(event, tx, "username", &username).await?;
            }
            UserEvent::Deactivated => {
                self.update_field(event, tx, "state", state_label(UserState::Inactive))
                    .await?;
            }
            UserEvent::Reactivated => {
                self.update_field(event, tx, "state", state_label(UserState::Active))
                    .await?;
            }
            UserEvent::Removed { .. } => {
                sqlx::query("DELETE FROM projection_users WHERE instance_id = $1 AND id = $2")
                    .bind(&event.instance_id)
                    .bind(&event.aggregate_id)
                    .execute(&mut **tx)
                    .await?;
            }
            // Credentials are write-model concerns; the read model skips
            // them but still advances past their events.
            UserEvent::OtpAdded { .. } => {}
        }
        Ok(())
    }

    async fn truncate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance_id: Option<&str>,
    ) -> Result<()> {
        match instance_id {
            Some(instance) => {
                sqlx::query("DELETE FROM projection_users WHERE instance_id = $1")
                    .bind(instance)
                    .execute(&mut **tx)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM projection_users")
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }
}

impl UsersProjection {
    /// Sequence-guarded single-column update.
    async fn update_field(
        &self,
        event: &Event,
        tx: &mut Transaction<'_, Postgres>,
        column: &'static str,
        value: &str,
    ) -> Result<(), HandlerError> {
        sqlx::query(&format!(
            "UPDATE projection_users \
             SET {column} = $3, changed_at = $4, sequence = $5 \
             WHERE instance_id = $1 AND id = $2 AND sequence < $5"
        ))
        .bind(&event.instance_id)
        .bind(&event.aggregate_id)
        .bind(value)
        .bind(event.created_at)
        .bind(event.sequence)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Fetch one user by id, scoped to the instance.
    pub async fn get_by_id(&self, pool: &PgPool, instance_id: &str, id: &str) -> Result<UserRow> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {ROW_COLUMNS} FROM projection_users WHERE instance_id = $1 AND id = $2"
        ))
        .bind(instance_id)
        .bind(id)
        .fetch_optional(pool)
        .await?;
        row.ok_or_else(|| Error::NotFound {
            entity: "user",
            id: id.to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    /// Fetch one user by username, case-insensitively.
    pub async fn get_by_username(
        &self,
        pool: &PgPool,
        instance_id: &str,
        username: &str,
    ) -> Result<UserRow> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {ROW_COLUMNS} FROM projection_users \
             WHERE instance_id = $1 AND LOWER(username) = LOWER($2)"
        ))
        .bind(instance_id)
        .bind(username)
        .fetch_optional(pool)
        .await?;
        row.ok_or_else(|| Error::NotFound {
            entity: "user",
            id: username.to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    /// Search users within one instance.
    ///
    /// Cursor pagination over `(sort key, id)`; the returned
    /// `next_cursor` continues where this page ended. `total_count`
    /// ignores pagination.
    pub async fn search(
        &self,
        pool: &PgPool,
        instance_id: &str,
        search: &UserSearch,
        sort: UserSortKey,
        direction: SortDirection,
        page: &Page,
    ) -> Result<SearchResult<UserRow>> {
        // Total, ignoring pagination.
        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM projection_users WHERE instance_id = ");
        count_qb.push_bind(instance_id);
        search.push_filters(&mut count_qb);
        let (total_count,): (i64,) = count_qb.build_query_as().fetch_one(pool).await?;

        // The page itself.
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ROW_COLUMNS} FROM projection_users WHERE instance_id = "
        ));
        qb.push_bind(instance_id);
        search.push_filters(&mut qb);

        if let Some(cursor) = &page.cursor {
            qb.push(" AND (")
                .push(sort.column())
                .push(", id) ")
                .push(direction.comparison())
                .push(" (");
            sort.push_cursor_bound(&mut qb, cursor)?;
            qb.push(", ").push_bind(cursor.id.clone()).push(")");
        }

        let limit = page.clamped_limit();
        qb.push(" ORDER BY ")
            .push(sort.column())
            .push(" ")
            .push(direction.sql())
            .push(", id ")
            .push(direction.sql())
            .push(" LIMIT ")
            .push_bind(limit);

        let entities: Vec<UserRow> = qb.build_query_as().fetch_all(pool).await?;

        let next_cursor = if (entities.len() as i64) == limit {
            entities.last().map(|row| {
                Cursor {
                    sort_key: sort.cursor_value(row),
                    id: row.id.clone(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(SearchResult {
            entities,
            total_count,
            next_cursor,
        })
    }
}
