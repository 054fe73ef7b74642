//! Event-sourced core of a multi-tenant IAM backend.
//!
//! `eventgate` provides the write and read paths of an identity system
//! built on event sourcing with command/query separation: an append-only
//! event store on PostgreSQL, a command engine with optimistic
//! concurrency, an asynchronous projection engine with per-tenant
//! locking and poisoned-event retry, and tenant-scoped query accessors.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`EventStore`] | Append-only log: push, query, stream, unique constraints |
//! | [`Aggregate`] | Domain model: handles commands, emits events, folds state |
//! | [`CommandEngine`] | Replays the write-model, validates, appends with retry |
//! | [`Projection`] | Read model derived from the event stream |
//! | [`ProjectionEngine`] | Workers, locks, failed-event retry, reset |
//! | [`Error`] | Unified error taxonomy across all components |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use eventgate::domain::user::{User, UserCommand, UserServices};
//! use eventgate::projections::users::{self, UsersProjection};
//! use eventgate::{
//!     CommandContext, CommandEngine, Editor, EngineConfig, EventStore, ProjectionEngine,
//! };
//!
//! # async fn run(
//! #     hasher: Arc<dyn eventgate::SecretHasher>,
//! #     encryption: Arc<dyn eventgate::EncryptionService>,
//! # ) -> eventgate::Result<()> {
//! // 1. Connect and create the schema.
//! let store = EventStore::connect("postgres://localhost/iam").await?;
//! store.ensure_schema().await?;
//!
//! let commands = CommandEngine::new(store.clone(), EngineConfig::default());
//! let projections = ProjectionEngine::new(store.clone(), EngineConfig::default())
//!     .register(Arc::new(UsersProjection));
//! projections.ensure_schema().await?;
//! let workers = projections.start();
//!
//! // 2. Execute a command.
//! let ctx = CommandContext::new("inst1", Editor::user("admin-1"))
//!     .with_resource_owner("org1");
//! let services = UserServices { hasher, encryption };
//! let result = commands
//!     .execute::<User>(
//!         "u1",
//!         UserCommand::AddHuman {
//!             username: "alice".into(),
//!             email: "alice@example.com".into(),
//!             first_name: "Alice".into(),
//!             last_name: "Archer".into(),
//!             password: Some("hunter2".into()),
//!         },
//!         &ctx,
//!         &services,
//!     )
//!     .await?;
//!
//! // 3. Read your write through the projection.
//! eventgate::wait_for_projection(
//!     store.pool(),
//!     users::NAME,
//!     "inst1",
//!     result.position,
//!     Duration::from_secs(5),
//! )
//! .await?;
//! let user = UsersProjection.get_by_id(store.pool(), "inst1", "u1").await?;
//! assert_eq!(user.username, "alice");
//!
//! workers.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod aggregate;
pub use aggregate::{Aggregate, WriteModel};
mod command;
pub use command::{CommandContext, CommandEngine, CommandResult};
mod config;
pub use config::EngineConfig;
pub mod domain;
mod error;
pub use error::{Error, Result};
mod event;
pub use event::{Editor, Event, EventPayload, Position, encode_domain_event};
pub mod projection;
pub use projection::{AggregateEvents, HandlerError, Projection, Subscription};
pub mod projections;
mod query;
pub use query::{Cursor, Page, SearchResult, SortDirection, TextMatch, wait_for_projection};
mod services;
pub use services::{EncryptedBlob, EncryptionService, IdGenerator, SecretHasher, UuidGenerator};
mod store;
pub use store::{AppendWrite, EventFilter, EventStore};
mod unique;
pub use unique::{UniqueAction, UniqueConstraint};
mod worker;
pub use worker::{
    FailedEvent, FailureResolution, ProjectionEngine, ProjectionEngineHandle, ProjectionWorker,
};

#[cfg(all(test, feature = "pg-tests"))]
pub(crate) mod pg_test;
