//! Append-only change ledgers and checkpoint storage.
//!
//! - [`ChangeLog`] records which source rows changed, in commit order
//! - [`CheckpointStore`] remembers how far each subscriber has read
//! - in-memory and PostgreSQL implementations of both

pub mod checkpoint;
pub mod entry;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointStoreExt};
pub use common::{EntityKey, SequenceId};
pub use entry::ChangelogEntry;
pub use error::{ChangelogError, Result, validate_identifier};
pub use memory::{InMemoryChangeLog, InMemoryCheckpointStore};
pub use postgres::{PostgresChangeLog, PostgresCheckpointStore, run_migrations};
pub use store::{ChangeLog, ChangeLogExt};
