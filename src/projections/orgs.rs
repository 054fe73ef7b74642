//! The orgs read model.
//!
//! Mirrors the users projection in shape: sequence-guarded upserts, rows
//! deleted on removal, queries scoped by instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, QueryBuilder, Transaction};

use crate::aggregate::Aggregate;
use crate::domain::org::{Org, OrgEvent, OrgState};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::projection::{AggregateEvents, HandlerError, Projection, Subscription};
use crate::query::{Cursor, Page, SearchResult, SortDirection, TextMatch};

/// Stable projection name.
pub const NAME: &str = "projection.orgs";

fn state_label(state: OrgState) -> &'static str {
    match state {
        OrgState::Unspecified => "unspecified",
        OrgState::Active => "active",
        OrgState::Inactive => "inactive",
        OrgState::Removed => "removed",
    }
}

/// One row of the orgs read model.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OrgRow {
    /// Tenant the org belongs to.
    pub instance_id: String,
    /// Org id (the aggregate id).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Primary domain.
    pub primary_domain: String,
    /// Lifecycle state label.
    pub state: String,
    /// When the org was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub changed_at: DateTime<Utc>,
    /// Sequence of the newest event folded into the row.
    pub sequence: i64,
}

const ROW_COLUMNS: &str =
    "instance_id, id, name, primary_domain, state, created_at, changed_at, sequence";

/// The orgs projection: handler plus query accessors.
#[derive(Debug, Clone, Default)]
pub struct OrgsProjection;

#[async_trait]
impl Projection for OrgsProjection {
    fn name(&self) -> &'static str {
        NAME
    }

    fn subscription(&self) -> Subscription {
        Subscription {
            aggregates: vec![AggregateEvents::all_of(Org::AGGREGATE_TYPE)],
        }
    }

    async fn ensure_schema(&self, pool: &PgPool) -> Result<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS projection_orgs (
                instance_id    TEXT NOT NULL,
                id             TEXT NOT NULL,
                name           TEXT NOT NULL,
                primary_domain TEXT NOT NULL,
                state          TEXT NOT NULL,
                created_at     TIMESTAMPTZ NOT NULL,
                changed_at     TIMESTAMPTZ NOT NULL,
                sequence       BIGINT NOT NULL,
                PRIMARY KEY (instance_id, id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_projection_orgs_name \
             ON projection_orgs (instance_id, name)",
            "CREATE INDEX IF NOT EXISTS idx_projection_orgs_domain \
             ON projection_orgs (instance_id, LOWER(primary_domain))",
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
        let Some(domain_event) = event.domain_event::<OrgEvent>() else {
            return Ok(());
        };

        match domain_event {
            OrgEvent::Added {
                name,
                primary_domain,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO projection_orgs (
                        instance_id, id, name, primary_domain, state,
                        created_at, changed_at, sequence
                    ) VALUES ($1, $2, $3, $4, $5, $6, $6, $7)
                    ON CONFLICT (instance_id, id) DO UPDATE SET
                        name = EXCLUDED.name,
                        primary_domain = EXCLUDED.primary_domain,
                        state = EXCLUDED.state,
                        created_at = EXCLUDED.created_at,
                        changed_at = EXCLUDED.changed_at,
                        sequence = EXCLUDED.sequence
                    WHERE projection_orgs.sequence < EXCLUDED.sequence
                    "#,
                )
                .bind(&event.instance_id)
                .bind(&event.aggregate_id)
                .bind(name)
                .bind(primary_domain)
                .bind(state_label(OrgState::Active))
                .bind(event.created_at)
                .bind(event.sequence)
                .execute(&mut **tx)
                .await?;
            }
            OrgEvent::Changed { name } => {
                self.update_field(event, tx, "name", &name).await?;
            }
            OrgEvent::Deactivated => {
                self.update_field(event, tx, "state", state_label(OrgState::Inactive))
                    .await?;
            }
            OrgEvent::Reactivated => {
                self.update_field(event, tx, "state", state_label(OrgState::Active))
                    .await?;
            }
            OrgEvent::Removed { .. } => {
                sqlx::query("DELETE FROM projection_orgs WHERE instance_id = $1 AND id = $2")
                    .bind(&event.instance_id)
                    .bind(&event.aggregate_id)
                    .execute(&mut **tx)
                    .await?;
            }
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
                sqlx::query("DELETE FROM projection_orgs WHERE instance_id = $1")
                    .bind(instance)
                    .execute(&mut **tx)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM projection_orgs")
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }
}

impl OrgsProjection {
    async fn update_field(
        &self,
        event: &Event,
        tx: &mut Transaction<'_, Postgres>,
        column: &'static str,
        value: &str,
    ) -> Result<(), HandlerError> {
        sqlx::query(&format!(
            "UPDATE projection_orgs \
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

    /// Fetch one org by id, scoped to the instance.
    pub async fn get_by_id(&self, pool: &PgPool, instance_id: &str, id: &str) -> Result<OrgRow> {
        let row: Option<OrgRow> = sqlx::query_as(&format!(
            "SELECT {ROW_COLUMNS} FROM projection_orgs WHERE instance_id = $1 AND id = $2"
        ))
        .bind(instance_id)
        .bind(id)
        .fetch_optional(pool)
        .await?;
        row.ok_or_else(|| Error::NotFound {
            entity: "org",
            id: id.to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    /// Fetch one org by its primary domain, case-insensitively.
    pub async fn get_by_domain(
        &self,
        pool: &PgPool,
        instance_id: &str,
        domain: &str,
    ) -> Result<OrgRow> {
        let row: Option<OrgRow> = sqlx::query_as(&format!(
            "SELECT {ROW_COLUMNS} FROM projection_orgs \
             WHERE instance_id = $1 AND LOWER(primary_domain) = LOWER($2)"
        ))
        .bind(instance_id)
        .bind(domain)
        .fetch_optional(pool)
        .await?;
        row.ok_or_else(|| Error::NotFound {
            entity: "org",
            id: domain.to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    /// Search orgs by name within one instance, sorted by name with
    /// cursor pagination over `(name, id)`.
    pub async fn search(
        &self,
        pool: &PgPool,
        instance_id: &str,
        name: Option<&TextMatch>,
        direction: SortDirection,
        page: &Page,
    ) -> Result<SearchResult<OrgRow>> {
        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM projection_orgs WHERE instance_id = ");
        count_qb.push_bind(instance_id);
        if let Some(m) = name {
            count_qb.push(" AND ");
            m.push_sql(&mut count_qb, "name");
        }
        let (total_count,): (i64,) = count_qb.build_query_as().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ROW_COLUMNS} FROM projection_orgs WHERE instance_id = "
        ));
        qb.push_bind(instance_id);
        if let Some(m) = name {
            qb.push(" AND ");
            m.push_sql(&mut qb, "name");
        }

        if let Some(cursor) = &page.cursor {
            let bound = cursor
                .sort_key
                .as_str()
                .ok_or_else(|| Error::validation("cursor does not fit the sort key"))?
                .to_string();
            qb.push(" AND (name, id) ")
                .push(direction.comparison())
                .push(" (")
                .push_bind(bound)
                .push(", ")
                .push_bind(cursor.id.clone())
                .push(")");
        }

        let limit = page.clamped_limit();
        qb.push(" ORDER BY name ")
            .push(direction.sql())
            .push(", id ")
            .push(direction.sql())
            .push(" LIMIT ")
            .push_bind(limit);

        let entities: Vec<OrgRow> = qb.build_query_as().fetch_all(pool).await?;

        let next_cursor = if (entities.len() as i64) == limit {
            entities.last().map(|row| {
                Cursor {
                    sort_key: serde_json::json!(row.name),
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

#[cfg(all(test, feature = "pg-tests"))]
mod pg_tests {
    use super::*;
    use crate::command::{CommandContext, CommandEngine};
    use crate::config::EngineConfig;
    use crate::domain::org::OrgCommand;
    use crate::event::Editor;
    use crate::pg_test::test_store;
    use crate::worker::ProjectionEngine;
    use std::sync::Arc;

    #[tokio::test]
    async fn org_lifecycle_and_domain_lookup() {
        let store = test_store().await;
        let commands = CommandEngine::new(store.clone(), EngineConfig::default());
        let projections = ProjectionEngine::new(store.clone(), EngineConfig::default())
            .register(Arc::new(OrgsProjection));
        projections.ensure_schema().await.unwrap();
        let ctx = CommandContext::new("inst1", Editor::user("admin"));

        commands
            .execute::<Org>(
                "org1",
                OrgCommand::AddOrg {
                    name: "ACME".into(),
                    primary_domain: "acme.example".into(),
                },
                &ctx,
                &(),
            )
            .await
            .unwrap();
        commands
            .execute::<Org>(
                "org1",
                OrgCommand::ChangeName { name: "ACME Corp".into() },
                &CommandContext::new("inst1", Editor::user("admin")),
                &(),
            )
            .await
            .unwrap();
        projections.tick_all().await.unwrap();

        let orgs = OrgsProjection;
        let row = orgs
            .get_by_domain(store.pool(), "inst1", "ACME.example")
            .await
            .unwrap();
        assert_eq!(row.id, "org1");
        assert_eq!(row.name, "ACME Corp");
        assert_eq!(row.state, "active");

        // Other instances see nothing.
        assert!(matches!(
            orgs.get_by_id(store.pool(), "inst2", "org1").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn search_by_name_prefix() {
        let store = test_store().await;
        let commands = CommandEngine::new(store.clone(), EngineConfig::default());
        let projections = ProjectionEngine::new(store.clone(), EngineConfig::default())
            .register(Arc::new(OrgsProjection));
        projections.ensure_schema().await.unwrap();

        for (id, name, domain) in [
            ("org1", "Acme", "acme.example"),
            ("org2", "Acorn", "acorn.example"),
            ("org3", "Zenith", "zenith.example"),
        ] {
            commands
                .execute::<Org>(
                    id,
                    OrgCommand::AddOrg {
                        name: name.into(),
                        primary_domain: domain.into(),
                    },
                    &CommandContext::new("inst1", Editor::user("admin")),
                    &(),
                )
                .await
                .unwrap();
        }
        projections.tick_all().await.unwrap();

        let result = OrgsProjection
            .search(
                store.pool(),
                "inst1",
                Some(&TextMatch::StartsWithIgnoreCase("ac".into())),
                SortDirection::Ascending,
                &Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.total_count, 2);
        let names: Vec<_> = result.entities.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["Acme", "Acorn"]);
        assert!(result.next_cursor.is_none());
    }
}
