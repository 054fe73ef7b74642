//! Stored event shape, global position, and the serde bridge between typed
//! domain events and their persisted `event_type` + `payload` form.
//!
//! This module is pure: no database I/O occurs here. The store, command
//! engine, and projection engine all depend on these types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Global ordering of an event across the whole log.
///
/// `position` is database time (`clock_timestamp()` epoch seconds) captured
/// once per append transaction; `in_tx_order` preserves the caller-supplied
/// order of events written in that transaction. Ordering is lexicographic
/// on the pair, which makes intra-transaction order stable and
/// inter-transaction order match commit order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Transaction timestamp as epoch seconds.
    pub position: f64,
    /// Zero-based order of the event within its transaction.
    pub in_tx_order: i32,
}

impl Position {
    /// The position before any event; streaming from here yields the full log.
    pub const ZERO: Position = Position {
        position: 0.0,
        in_tx_order: 0,
    };

    /// Build a position from its two components.
    pub fn new(position: f64, in_tx_order: i32) -> Self {
        Position {
            position,
            in_tx_order,
        }
    }
}

// `position` values come from the database and are never NaN, so a total
// order via `f64::total_cmp` is sound.
impl Eq for Position {}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.position
            .total_cmp(&other.position)
            .then(self.in_tx_order.cmp(&other.in_tx_order))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.position, self.in_tx_order)
    }
}

/// Who issued the command that produced an event.
///
/// Exactly one of the fields is normally set: a human editor is identified
/// by `user_id`, a machine editor by `service`. Both empty means the editor
/// was the system itself (e.g. a setup job).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Editor {
    /// Id of the human user who issued the command, if any.
    pub user_id: Option<String>,
    /// Name of the service that issued the command, if any.
    pub service: Option<String>,
}

impl Editor {
    /// Editor identified by a human user id.
    pub fn user(id: impl Into<String>) -> Self {
        Editor {
            user_id: Some(id.into()),
            service: None,
        }
    }

    /// Editor identified by a service name.
    pub fn service(name: impl Into<String>) -> Self {
        Editor {
            user_id: None,
            service: Some(name.into()),
        }
    }
}

/// An immutable fact appended to the log.
///
/// Events are self-describing: the aggregate triple, per-aggregate
/// `sequence`, global [`Position`], editor, owning organization, and the
/// `command_id` grouping all events written by the same command are stored
/// alongside the typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Global ordering across the whole log.
    pub position: Position,
    /// Per-aggregate sequence: 1-based, gapless, strictly monotonic.
    pub sequence: i64,
    /// Tenant the aggregate belongs to.
    pub instance_id: String,
    /// Aggregate type (e.g. "user").
    pub aggregate_type: String,
    /// Aggregate instance id within `(instance_id, aggregate_type)`.
    pub aggregate_id: String,
    /// Schema version of the aggregate type that wrote this event.
    pub aggregate_version: i16,
    /// Dotted, stable event type name (e.g. `user.human.added`).
    pub event_type: String,
    /// Structured payload; `None` for marker events with no body.
    pub payload: Option<serde_json::Value>,
    /// Who issued the producing command.
    pub editor: Editor,
    /// Owning organization of the aggregate within the instance.
    pub resource_owner: String,
    /// Database commit timestamp.
    pub created_at: DateTime<Utc>,
    /// Groups events written by the same command.
    pub command_id: Uuid,
}

impl Event {
    /// Decode the payload into a typed domain event.
    ///
    /// Reconstructs the adjacently tagged form (`{"type": ..., "data": ...}`)
    /// from the stored `event_type` and `payload`, then deserializes into
    /// `D`. Returns `None` for event types unknown to `D` or payloads that
    /// no longer decode, so handlers stay forward compatible: new event
    /// types and added fields are tolerated, never fatal.
    pub fn domain_event<D: DeserializeOwned>(&self) -> Option<D> {
        let tagged = match &self.payload {
            None => serde_json::json!({ "type": self.event_type }),
            Some(data) => serde_json::json!({
                "type": self.event_type,
                "data": data,
            }),
        };
        serde_json::from_value(tagged).ok()
    }
}

/// A domain event serialized into its persisted form, ready for append.
///
/// Produced by [`encode_domain_event`] before the store assigns sequence
/// and position.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    /// Dotted event type extracted from the enum tag.
    pub event_type: String,
    /// The `"data"` portion; `None` for unit variants.
    pub data: Option<serde_json::Value>,
}

/// Encode an adjacently tagged domain event into its persisted form.
///
/// Domain events use `#[serde(tag = "type", content = "data")]` with the
/// dotted event type as the variant rename, so serialization produces
/// `{"type": "user.human.added", "data": {...}}` (or just the tag for unit
/// variants). The tag becomes [`EventPayload::event_type`] and the content
/// becomes the stored payload.
///
/// # Errors
///
/// Returns [`crate::Error::Fatal`] if the domain event does not serialize
/// to a tagged object; that indicates a mis-declared event enum, which is
/// a programming error, not a runtime condition.
pub fn encode_domain_event<D: Serialize>(event: &D) -> crate::Result<EventPayload> {
    let value = serde_json::to_value(event).map_err(|e| crate::Error::Fatal {
        message: format!("domain event failed to serialize: {e}"),
    })?;

    let obj = value.as_object().ok_or_else(|| crate::Error::Fatal {
        message: "domain event must serialize to an adjacently tagged object".into(),
    })?;

    let event_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| crate::Error::Fatal {
            message: "domain event is missing its string \"type\" tag".into(),
        })?
        .to_string();

    let data = obj.get("data").filter(|d| !d.is_null()).cloned();

    Ok(EventPayload { event_type, data })
}
