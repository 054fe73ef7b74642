//! Crate-level error taxonomy.
//!
//! Every error that crosses a component boundary is one of the variants
//! below, carrying a typed kind, a human-readable message, and structured
//! fields identifying the aggregate or event it relates to. Where a command
//! is involved, the `command_id` doubles as the correlation id in logs.

/// Unified error type for the event store, command engine, projection
/// engine, and query accessors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed command input. Never retried.
    #[error("invalid command: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// Business rule violation or an FSM-forbidden lifecycle transition.
    ///
    /// Produced during command validation against the replayed write-model;
    /// no events were appended.
    #[error("precondition failed for {aggregate_type} \"{aggregate_id}\": {message}")]
    PreconditionFailed {
        /// Aggregate type the command targeted.
        aggregate_type: &'static str,
        /// Aggregate instance the command targeted.
        aggregate_id: String,
        /// The violated rule, in domain terms.
        message: String,
    },

    /// The write-model was stale: another writer appended to the aggregate
    /// between load and push.
    ///
    /// The command engine retries these transparently up to a bound; after
    /// exhaustion the conflict surfaces to the caller.
    #[error(
        "concurrency conflict on {aggregate_type} \"{aggregate_id}\": \
         expected sequence {expected}, store is at {current}"
    )]
    ConcurrencyConflict {
        /// Tenant the aggregate belongs to.
        instance_id: String,
        /// Aggregate type.
        aggregate_type: String,
        /// Aggregate instance id.
        aggregate_id: String,
        /// Sequence the caller loaded its write-model at.
        expected: i64,
        /// Sequence the store actually holds.
        current: i64,
    },

    /// A unique-constraint "add" collided with an existing owner of the key.
    ///
    /// The display message is the domain message supplied with the
    /// constraint operation (e.g. "username already taken"), so it can be
    /// surfaced to end users verbatim.
    #[error("{message}")]
    UniqueConstraintViolation {
        /// Constraint namespace (e.g. "username").
        unique_type: String,
        /// The contested field value.
        unique_field: String,
        /// Caller-supplied domain message.
        message: String,
    },

    /// A query target does not exist (or is not visible to the requested
    /// instance).
    #[error("{entity} \"{id}\" not found in instance \"{instance_id}\"")]
    NotFound {
        /// Entity kind, e.g. "user".
        entity: &'static str,
        /// Requested id.
        id: String,
        /// Instance the lookup was scoped to.
        instance_id: String,
    },

    /// Database timeout, connection loss, or another retryable storage
    /// failure. Idempotent callers may retry; projections record a failed
    /// event and retry with backoff.
    #[error("storage error: {0}")]
    TransientStorage(#[from] sqlx::Error),

    /// A projection handler failed on a specific event. Recorded in the
    /// failed-event table; never crashes the worker.
    #[error("projection \"{projection}\" failed on event {event_type} (seq {sequence}): {message}")]
    HandlerFailure {
        /// Projection that raised.
        projection: &'static str,
        /// Event type it was handling.
        event_type: String,
        /// Per-aggregate sequence of the failing event.
        sequence: i64,
        /// Instance the event belongs to.
        instance_id: String,
        /// Handler's error message.
        message: String,
    },

    /// A structural invariant is broken (corrupt event row, impossible
    /// state). The affected component halts; operator intervention is
    /// required.
    #[error("fatal: {message}")]
    Fatal {
        /// Full context of the broken invariant.
        message: String,
    },
}

impl Error {
    /// Shorthand for [`Error::Validation`] from anything stringy.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Fatal`] from anything stringy.
    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Fatal {
            message: message.into(),
        }
    }

    /// Whether the command engine may transparently retry after this error.
    ///
    /// Only concurrency conflicts are retried by re-running the whole
    /// load-validate-push procedure; everything else surfaces immediately.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_displays_domain_message_verbatim() {
        let err = Error::UniqueConstraintViolation {
            unique_type: "username".into(),
            unique_field: "alice".into(),
            message: "username already taken".into(),
        };
        assert_eq!(err.to_string(), "username already taken");
    }

    #[test]
    fn concurrency_conflict_display_names_both_sequences() {
        let err = Error::ConcurrencyConflict {
            instance_id: "inst1".into(),
            aggregate_type: "user".into(),
            aggregate_id: "u1".into(),
            expected: 3,
            current: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected sequence 3"), "got: {msg}");
        assert!(msg.contains("store is at 4"), "got: {msg}");
    }

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = Error::ConcurrencyConflict {
            instance_id: "i".into(),
            aggregate_type: "user".into(),
            aggregate_id: "u".into(),
            expected: 0,
            current: 1,
        };
        assert!(conflict.is_retryable_conflict());
        assert!(!Error::validation("nope").is_retryable_conflict());
        assert!(!Error::fatal("broken").is_retryable_conflict());
    }

    #[test]
    fn not_found_display_is_scoped_to_instance() {
        let err = Error::NotFound {
            entity: "user",
            id: "u1".into(),
            instance_id: "inst2".into(),
        };
        assert_eq!(
            err.to_string(),
            "user \"u1\" not found in instance \"inst2\""
        );
    }

    // Errors cross worker task boundaries, so they must be Send + Sync.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<Error>();
        }
    };
}
