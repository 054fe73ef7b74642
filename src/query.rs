//! Query façade building blocks: filters, cursor pagination, and the
//! read-your-writes helper.
//!
//! Queries read only from projections, never from the event log. Every
//! accessor takes an `instance_id` and applies it as the leading filter so
//! plans can use the leading index column. Pagination is cursor-based over
//! `(sort key, id)`; cursors are opaque base64 strings the caller passes
//! back verbatim.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::QueryBuilder;

use crate::error::{Error, Result};
use crate::event::Position;
use crate::projection::read_position;

/// Sort direction for search queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Smallest sort key first.
    #[default]
    Ascending,
    /// Largest sort key first.
    Descending,
}

impl SortDirection {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }

    /// The comparison a cursor bound uses to continue past the last row.
    pub(crate) fn comparison(self) -> &'static str {
        match self {
            SortDirection::Ascending => ">",
            SortDirection::Descending => "<",
        }
    }
}

/// Text matching operators supported by projection search filters.
///
/// Prefix operators escape `%`, `_`, and `\` in the needle, so user input
/// cannot smuggle wildcards into the generated `LIKE` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMatch {
    /// Exact, case-sensitive equality.
    Equals(String),
    /// Exact equality ignoring case.
    EqualsIgnoreCase(String),
    /// Case-sensitive prefix match.
    StartsWith(String),
    /// Prefix match ignoring case.
    StartsWithIgnoreCase(String),
    /// Substring match ignoring case.
    Contains(String),
}

impl TextMatch {
    /// Append `column <op> <bound value>` to the query builder.
    pub(crate) fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>, column: &str) {
        match self {
            TextMatch::Equals(v) => {
                qb.push(column).push(" = ").push_bind(v.clone());
            }
            TextMatch::EqualsIgnoreCase(v) => {
                qb.push("LOWER(")
                    .push(column)
                    .push(") = LOWER(")
                    .push_bind(v.clone())
                    .push(")");
            }
            TextMatch::StartsWith(v) => {
                qb.push(column)
                    .push(" LIKE ")
                    .push_bind(format!("{}%", escape_like(v)));
            }
            TextMatch::StartsWithIgnoreCase(v) => {
                qb.push(column)
                    .push(" ILIKE ")
                    .push_bind(format!("{}%", escape_like(v)));
            }
            TextMatch::Contains(v) => {
                qb.push(column)
                    .push(" ILIKE ")
                    .push_bind(format!("%{}%", escape_like(v)));
            }
        }
    }
}

/// Escape `LIKE` wildcards in a user-supplied needle.
fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// A decoded pagination cursor: the sort-key value and id of the last row
/// of the previous page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Sort-key value of the last row (JSON so every sortable column type
    /// round-trips).
    #[serde(rename = "k")]
    pub sort_key: serde_json::Value,
    /// Id tiebreak of the last row.
    #[serde(rename = "id")]
    pub id: String,
}

impl Cursor {
    /// Encode into the opaque form handed to callers.
    pub fn encode(&self) -> String {
        // Serialization of a two-field struct to JSON cannot fail.
        let json = serde_json::to_vec(self).expect("cursor serializes");
        BASE64.encode(json)
    }

    /// Decode an opaque cursor string.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when the string is not a cursor this crate
    /// produced; malformed caller input is never a storage error.
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| Error::validation("malformed pagination cursor"))?;
        serde_json::from_slice(&bytes).map_err(|_| Error::validation("malformed pagination cursor"))
    }
}

/// Page size and continuation for a search query.
#[derive(Debug, Clone)]
pub struct Page {
    /// Maximum rows to return. Clamped to 1..=1000.
    pub limit: i64,
    /// Continuation returned by the previous page, if any.
    pub cursor: Option<Cursor>,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            limit: 100,
            cursor: None,
        }
    }
}

impl Page {
    /// First page with the given size.
    pub fn of(limit: i64) -> Self {
        Page {
            limit,
            cursor: None,
        }
    }

    /// Continue after an encoded cursor.
    pub fn after(limit: i64, cursor: &str) -> Result<Self> {
        Ok(Page {
            limit,
            cursor: Some(Cursor::decode(cursor)?),
        })
    }

    pub(crate) fn clamped_limit(&self) -> i64 {
        self.limit.clamp(1, 1000)
    }
}

/// One page of search results.
#[derive(Debug, Clone)]
pub struct SearchResult<T> {
    /// The page's rows, in sort order.
    pub entities: Vec<T>,
    /// Total matching rows, ignoring pagination.
    pub total_count: i64,
    /// Cursor for the next page; `None` when this page is the last.
    pub next_cursor: Option<String>,
}

/// Block until `projection` has processed events up to `position` for
/// `instance_id`, or until `deadline` elapses.
///
/// Returns `true` once `last_processed_position >= position`. This is the
/// bounded-wait read-your-writes helper: callers pass the position
/// returned by a command and then query the projection. Queries themselves
/// never block.
pub async fn wait_for_projection(
    pool: &PgPool,
    projection_name: &str,
    instance_id: &str,
    position: Position,
    deadline: Duration,
) -> Result<bool> {
    const POLL_INTERVAL: Duration = Duration::from_millis(25);

    let give_up = tokio::time::Instant::now() + deadline;
    loop {
        let processed = read_position(pool, projection_name, instance_id).await?;
        if processed.is_some_and(|p| p >= position) {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= give_up {
            return Ok(false);
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline)).await;
    }
}
