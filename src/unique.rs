//! Cross-aggregate unique-constraint registry.
//!
//! A constraint is the tuple `(instance_id, unique_type, unique_field)`.
//! "Add" reserves it, "Remove" releases it. Operations are never executed
//! on their own: they ride along in [`EventStore::push`](crate::EventStore::push)
//! and commit or roll back with the events they accompany, so a command
//! that changes a username removes the old tuple and adds the new one
//! atomically.

use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};

use crate::error::{Error, Result};

/// Postgres error code for primary-key / unique violations.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// What to do with a constraint tuple as part of an event append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniqueAction {
    /// Reserve the tuple. Fails the whole push if it is already held.
    Add,
    /// Release the tuple. A no-op if nobody holds it.
    Remove,
}

/// A single constraint operation submitted with an event write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Reserve or release.
    pub action: UniqueAction,
    /// Constraint namespace, e.g. "username" or "org_domain".
    pub unique_type: String,
    /// The contested value within the namespace.
    pub unique_field: String,
    /// Domain message surfaced verbatim when an add collides.
    pub error_message: String,
    /// Whether the field is compared case-insensitively. When set, the
    /// field is lowercased before keying, so "Alice" and "alice" contend
    /// for the same tuple.
    pub case_insensitive: bool,
}

impl UniqueConstraint {
    /// Reserve `(unique_type, unique_field)`, failing with `error_message`
    /// if the tuple is already held.
    pub fn add(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        UniqueConstraint {
            action: UniqueAction::Add,
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            error_message: error_message.into(),
            case_insensitive: false,
        }
    }

    /// Release `(unique_type, unique_field)`.
    pub fn remove(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        UniqueConstraint {
            action: UniqueAction::Remove,
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            error_message: String::new(),
            case_insensitive: false,
        }
    }

    /// Mark the field as case-insensitive.
    pub fn ignoring_case(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// The field value as keyed in the registry.
    pub(crate) fn keyed_field(&self) -> String {
        if self.case_insensitive {
            self.unique_field.to_lowercase()
        } else {
            self.unique_field.clone()
        }
    }
}

/// Apply one constraint operation inside the push transaction.
///
/// Add collisions are translated from the raw Postgres unique-violation
/// into [`Error::UniqueConstraintViolation`] carrying the caller-supplied
/// domain message. Removing a tuple nobody holds succeeds silently.
pub(crate) async fn apply(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &str,
    constraint: &UniqueConstraint,
) -> Result<()> {
    let field = constraint.keyed_field();
    match constraint.action {
        UniqueAction::Add => {
            let inserted = sqlx::query(
                r#"
                INSERT INTO unique_constraints (instance_id, unique_type, unique_field)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(instance_id)
            .bind(&constraint.unique_type)
            .bind(&field)
            .execute(&mut **tx)
            .await;

            match inserted {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION) => {
                    Err(Error::UniqueConstraintViolation {
                        unique_type: constraint.unique_type.clone(),
                        unique_field: field,
                        message: constraint.error_message.clone(),
                    })
                }
                Err(e) => Err(e.into()),
            }
        }
        UniqueAction::Remove => {
            sqlx::query(
                r#"
                DELETE FROM unique_constraints
                WHERE instance_id = $1 AND unique_type = $2 AND unique_field = $3
                "#,
            )
            .bind(instance_id)
            .bind(&constraint.unique_type)
            .bind(&field)
            .execute(&mut **tx)
            .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_builder_defaults_to_case_sensitive() {
        let c = UniqueConstraint::add("username", "Alice", "username already taken");
        assert_eq!(c.action, UniqueAction::Add);
        assert!(!c.case_insensitive);
        assert_eq!(c.keyed_field(), "Alice");
    }

    #[test]
    fn ignoring_case_lowercases_the_key() {
        let c = UniqueConstraint::add("username", "Alice", "taken").ignoring_case();
        assert_eq!(c.keyed_field(), "alice");
    }

    #[test]
    fn remove_carries_no_error_message() {
        let c = UniqueConstraint::remove("username", "alice");
        assert_eq!(c.action, UniqueAction::Remove);
        assert!(c.error_message.is_empty());
    }

    #[test]
    fn case_insensitive_remove_targets_same_key_as_add() {
        let add = UniqueConstraint::add("org_domain", "Acme.Example", "taken").ignoring_case();
        let remove = UniqueConstraint::remove("org_domain", "ACME.example").ignoring_case();
        assert_eq!(add.keyed_field(), remove.keyed_field());
    }
}
