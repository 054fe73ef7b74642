//! Aggregate trait and the replayed write-model.
//!
//! Aggregates have no stored row of their own: state is derived by folding
//! the aggregate's events through [`Aggregate::apply`]. The write-model is
//! transient and rebuilt on every command; nothing is cached across
//! commands.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::store::{EventFilter, EventStore};
use crate::unique::UniqueConstraint;

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state, including
/// its lifecycle FSM: commands that would perform a forbidden transition
/// are rejected inside [`handle`](Aggregate::handle) with a domain error
/// that maps to `PreconditionFailed`.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the events it produces and applies. Must be an
///   adjacently tagged serde enum (`#[serde(tag = "type", content = "data")]`)
///   whose variant renames are the stable dotted event types
///   (e.g. `user.human.added`).
/// - `Error`: command rejection; converts into the crate [`Error`].
/// - `Services`: external collaborators a handler may consult (id
///   generation, hashing, encryption). Use `()` when none are needed.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a deterministic decision
///   function given its inputs: no I/O beyond the injected services, no
///   clock or randomness of its own.
/// - [`apply`](Aggregate::apply) must be a pure, total function. Unknown
///   event variants never reach it (decoding skips them), and it must
///   tolerate any ordering the log can actually contain.
/// - [`unique_constraints`](Aggregate::unique_constraints) must be
///   derivable from the event alone, so replaying and appending agree on
///   what was reserved.
pub trait Aggregate: Default + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "user").
    const AGGREGATE_TYPE: &'static str;

    /// Schema version of this aggregate type, stamped on its events.
    const AGGREGATE_VERSION: i16 = 1;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection error; surfaces through the crate taxonomy.
    type Error: Into<Error> + Send + Sync + 'static;

    /// External services handlers may consult.
    type Services: Send + Sync;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    fn handle(
        &self,
        cmd: Self::Command,
        services: &Self::Services,
    ) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;

    /// Unique-constraint operations implied by an event.
    ///
    /// E.g. `user.human.added` reserves the username;
    /// `user.username.changed` removes the old tuple and adds the new one.
    fn unique_constraints(_event: &Self::DomainEvent) -> Vec<UniqueConstraint> {
        Vec::new()
    }
}

/// Transient state of one aggregate instance, computed by replay.
///
/// Tracks the per-aggregate `sequence` the state was loaded at (fed back
/// into the store as `expected_sequence`) and the resource owner recorded
/// on the aggregate's first event.
#[derive(Debug, Clone)]
pub struct WriteModel<A: Aggregate> {
    /// Folded aggregate state.
    pub state: A,
    /// Tenant the aggregate lives in.
    pub instance_id: String,
    /// Aggregate instance id.
    pub aggregate_id: String,
    /// Sequence of the newest event folded in; 0 for a fresh aggregate.
    pub sequence: i64,
    /// Owning organization, from the first event; `None` until one exists.
    pub resource_owner: Option<String>,
}

impl<A: Aggregate> WriteModel<A> {
    /// An empty write-model for an aggregate with no events yet.
    pub fn fresh(instance_id: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        WriteModel {
            state: A::default(),
            instance_id: instance_id.into(),
            aggregate_id: aggregate_id.into(),
            sequence: 0,
            resource_owner: None,
        }
    }

    /// Replay the aggregate's full event stream into a fresh write-model.
    ///
    /// Events whose type is unknown to `A::DomainEvent` are skipped for
    /// forward compatibility; their sequence still advances the model so
    /// the optimistic check reflects the actual store tail.
    pub async fn load(store: &EventStore, instance_id: &str, aggregate_id: &str) -> Result<Self> {
        let events = store
            .query(
                &EventFilter::all()
                    .in_instance(instance_id)
                    .aggregate_type(A::AGGREGATE_TYPE)
                    .aggregate_id(aggregate_id),
            )
            .await?;

        let mut model = Self::fresh(instance_id, aggregate_id);
        for event in &events {
            model.fold(event);
        }
        Ok(model)
    }

    /// Fold one stored event into the model.
    pub fn fold(&mut self, event: &Event) {
        if self.resource_owner.is_none() {
            self.resource_owner = Some(event.resource_owner.clone());
        }
        self.sequence = event.sequence;
        if let Some(domain_event) = event.domain_event::<A::DomainEvent>() {
            self.state = std::mem::take(&mut self.state).apply(&domain_event);
        }
    }

    /// Whether the aggregate has any history at all.
    pub fn exists(&self) -> bool {
        self.sequence > 0
    }
}
