//! Incremental materialized views over change-tracked source tables.
//!
//! This crate keeps denormalized grid tables in sync with their sources:
//! - [`Subscription`] installs capture hooks that feed a view's changelog
//! - [`WalkerKind`] walks pending changelog entries in bounded batches
//! - [`View`] applies those batches to the grid and advances its checkpoint
//! - [`ViewProcessor`] drives every configured view against one backend
//! - [`ConfigLoader`] turns JSON declarations into an immutable [`MviewConfig`]
//!
//! Two backends are provided: [`InMemoryDatabase`] and [`PostgresDatabase`].

pub mod cache;
pub mod columns;
pub mod config;
pub mod error;
pub mod grid;
pub mod memory;
pub mod postgres;
pub mod processor;
pub mod schema;
pub mod storage;
pub mod subscription;
pub mod view;
pub mod walker;

pub use cache::LastUpdateTimeCache;
pub use columns::{AdditionalColumnsProcessor, DefaultProcessor, ProcessorRegistry};
pub use config::{
    AdditionalColumn, ColumnSource, ConfigLoader, GridDefinition, MviewConfig, MviewDeclarations,
    SubscriptionConfig, ViewConfig,
};
pub use error::{MviewError, Result};
pub use grid::{GridChanges, Projector};
pub use memory::InMemoryDatabase;
pub use postgres::PostgresDatabase;
pub use processor::{ViewProcessor, ViewRefresh};
pub use schema::{ColumnInfo, SchemaIntrospector, TableSchema};
pub use storage::{GridStore, HeldLock, MviewBackend, RefreshLock, RowSource};
pub use subscription::{
    DefaultSubscription, ModelRegistry, Subscription, SubscriptionModel, TriggerEvent,
    TriggerHost, TriggerSpec,
};
pub use view::{RefreshOutcome, RefreshReport, RefreshState, View, ViewStatus};
pub use walker::{BatchStream, ChangelogBatch, DEFAULT_BATCH_SIZE, WalkerKind};
