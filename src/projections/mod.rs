//! Read models derived from the event stream.
//!
//! Each projection owns its tables (every row scoped by `instance_id` as
//! the leading primary-key column), applies events as idempotent upserts
//! guarded by the event sequence, and exposes the query accessors the
//! outside world reads through. Queries never touch the event log.

pub mod orgs;
pub mod users;

pub use orgs::{OrgRow, OrgsProjection};
pub use users::{UserRow, UserSearch, UserSortKey, UsersProjection};
