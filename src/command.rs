//! Command engine: load, validate, append, retry.
//!
//! A command is an intent to change one aggregate. The engine replays the
//! aggregate's events into a transient write-model, lets the aggregate's
//! handler validate and produce events, and appends them with
//! `expected_sequence` set to the sequence the model was loaded at.
//! Concurrency conflicts re-run the whole procedure up to a bound with
//! jittered backoff; every other error surfaces immediately.

use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::aggregate::{Aggregate, WriteModel};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::event::{Editor, Event, Position, encode_domain_event};
use crate::store::{AppendWrite, EventStore};

/// Cross-cutting metadata passed alongside a command.
///
/// Identifies the tenant, the editor, and the command itself (the
/// `command_id` groups all events the command writes and doubles as the
/// correlation id in logs).
///
/// # Examples
///
/// ```
/// use eventgate::{CommandContext, Editor};
///
/// let ctx = CommandContext::new("inst1", Editor::user("admin-1"))
///     .with_resource_owner("org1");
/// assert_eq!(ctx.instance_id, "inst1");
/// assert_eq!(ctx.resource_owner.as_deref(), Some("org1"));
/// ```
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Tenant the command operates in.
    pub instance_id: String,
    /// Authenticated editor issuing the command.
    pub editor: Editor,
    /// Groups the events this command writes; generated if not supplied.
    pub command_id: Uuid,
    /// Owning organization for events this command creates. Falls back to
    /// the aggregate's recorded owner, then to the instance id.
    pub resource_owner: Option<String>,
}

impl CommandContext {
    /// Context for `editor` acting in `instance_id`, with a fresh
    /// `command_id`.
    pub fn new(instance_id: impl Into<String>, editor: Editor) -> Self {
        CommandContext {
            instance_id: instance_id.into(),
            editor,
            command_id: Uuid::new_v4(),
            resource_owner: None,
        }
    }

    /// Set the owning organization for newly created aggregates.
    pub fn with_resource_owner(mut self, resource_owner: impl Into<String>) -> Self {
        self.resource_owner = Some(resource_owner.into());
        self
    }

    /// Override the generated command id (e.g. for client-supplied
    /// idempotency keys).
    pub fn with_command_id(mut self, command_id: Uuid) -> Self {
        self.command_id = command_id;
        self
    }
}

/// What a successfully executed command returns.
///
/// `position` is the global position of the command's last event; callers
/// needing read-your-writes hand it to
/// [`wait_for_projection`](crate::query::wait_for_projection).
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// Aggregate state after the command's events were applied.
    pub state: A,
    /// The committed events, in append order.
    pub events: Vec<Event>,
    /// Position of the last committed event; [`Position::ZERO`] when the
    /// command was a no-op and wrote nothing.
    pub position: Position,
}

/// Executes commands against the event store.
///
/// Cheap to clone; all state lives in the store and the config.
#[derive(Clone)]
pub struct CommandEngine {
    store: EventStore,
    config: EngineConfig,
}

impl CommandEngine {
    /// Build an engine over `store` with `config` retry/backoff settings.
    pub fn new(store: EventStore, config: EngineConfig) -> Self {
        CommandEngine { store, config }
    }

    /// The store this engine appends to.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Execute `cmd` against the aggregate `aggregate_id`.
    ///
    /// Runs the full load-validate-produce-append procedure. On a
    /// concurrency conflict the procedure is re-run from scratch (fresh
    /// replay included) up to `command_max_retries` times with doubling,
    /// jittered backoff; the conflict surfaces once retries are exhausted.
    /// Domain rejections and validation errors are never retried.
    ///
    /// Projections observe the committed events asynchronously; see
    /// [`CommandResult::position`] for bounded-wait read-your-writes.
    pub async fn execute<A: Aggregate>(
        &self,
        aggregate_id: &str,
        cmd: A::Command,
        ctx: &CommandContext,
        services: &A::Services,
    ) -> Result<CommandResult<A>>
    where
        A::Command: Clone,
    {
        let mut attempt: u32 = 0;
        loop {
            match self.try_execute::<A>(aggregate_id, cmd.clone(), ctx, services).await {
                Err(err) if err.is_retryable_conflict() && attempt < self.config.command_max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay(attempt);
                    tracing::debug!(
                        command_id = %ctx.command_id,
                        aggregate_type = A::AGGREGATE_TYPE,
                        aggregate_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "concurrency conflict, retrying command"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// One pass of the per-command procedure.
    async fn try_execute<A: Aggregate>(
        &self,
        aggregate_id: &str,
        cmd: A::Command,
        ctx: &CommandContext,
        services: &A::Services,
    ) -> Result<CommandResult<A>> {
        // 1. Load the write-model by replay. Never cached across commands.
        let model = WriteModel::<A>::load(&self.store, &ctx.instance_id, aggregate_id).await?;

        // 2.-3. Validate and produce events. Handler errors map into the
        // crate taxonomy and produce nothing. Domain error types don't
        // know which instance they were handling, so the engine fills in
        // the aggregate id.
        let domain_events = model.state.handle(cmd, services).map_err(|e| {
            match e.into() {
                Error::PreconditionFailed {
                    aggregate_type,
                    message,
                    ..
                } => Error::PreconditionFailed {
                    aggregate_type,
                    aggregate_id: aggregate_id.to_string(),
                    message,
                },
                other => other,
            }
        })?;

        if domain_events.is_empty() {
            return Ok(CommandResult {
                state: model.state,
                events: Vec::new(),
                position: Position::ZERO,
            });
        }

        let resource_owner = ctx
            .resource_owner
            .clone()
            .or_else(|| model.resource_owner.clone())
            .unwrap_or_else(|| ctx.instance_id.to_string());

        let mut payloads = Vec::with_capacity(domain_events.len());
        let mut constraints = Vec::new();
        for domain_event in &domain_events {
            payloads.push(encode_domain_event(domain_event)?);
            constraints.extend(A::unique_constraints(domain_event));
        }

        // 4. Append optimistically at the loaded sequence.
        let events = self
            .store
            .push(
                ctx.command_id,
                vec![AppendWrite {
                    instance_id: ctx.instance_id.clone(),
                    aggregate_type: A::AGGREGATE_TYPE.to_string(),
                    aggregate_id: aggregate_id.to_string(),
                    aggregate_version: A::AGGREGATE_VERSION,
                    expected_sequence: Some(model.sequence),
                    editor: ctx.editor.clone(),
                    resource_owner,
                    events: payloads,
                    constraints,
                }],
            )
            .await?;

        // 5. Return the committed events and the post-command state.
        let state = domain_events
            .iter()
            .fold(model.state, |state, event| state.apply(event));
        let position = events.last().map(|e| e.position).unwrap_or(Position::ZERO);

        Ok(CommandResult {
            state,
            events,
            position,
        })
    }

    /// Doubling backoff with uniform jitter: attempt 1 waits the base
    /// delay, attempt 2 twice that, and so on, each plus 0..=jitter.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .command_retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_cap = self.config.command_retry_jitter.as_millis() as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(base_ms: u64, jitter_ms: u64) -> CommandEngine {
        // The store is never touched by retry_delay; a lazily connecting
        // pool keeps these tests database-free.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/eventgate_unused")
            .expect("lazy pool");
        CommandEngine::new(
            EventStore::new(pool),
            EngineConfig {
                command_retry_base_delay: Duration::from_millis(base_ms),
                command_retry_jitter: Duration::from_millis(jitter_ms),
                ..EngineConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn retry_delay_doubles_per_attempt() {
        let engine = engine_with(25, 0);
        assert_eq!(engine.retry_delay(1), Duration::from_millis(25));
        assert_eq!(engine.retry_delay(2), Duration::from_millis(50));
        assert_eq!(engine.retry_delay(3), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn retry_delay_jitter_stays_within_cap() {
        let engine = engine_with(10, 20);
        for attempt in 1..=3 {
            let base = Duration::from_millis(10 * 2u64.pow(attempt - 1));
            for _ in 0..50 {
                let delay = engine.retry_delay(attempt as u32);
                assert!(delay >= base, "{delay:?} below base {base:?}");
                assert!(
                    delay <= base + Duration::from_millis(20),
                    "{delay:?} beyond jitter cap"
                );
            }
        }
    }

    #[test]
    fn context_builder_defaults() {
        let ctx = CommandContext::new("inst1", Editor::service("setup"));
        assert_eq!(ctx.instance_id, "inst1");
        assert!(ctx.resource_owner.is_none());
        assert!(!ctx.command_id.is_nil());

        let pinned = Uuid::new_v4();
        let ctx = ctx.with_command_id(pinned).with_resource_owner("org1");
        assert_eq!(ctx.command_id, pinned);
        assert_eq!(ctx.resource_owner.as_deref(), Some("org1"));
    }
}
