//! Storage seams the refresh engine runs against.
//!
//! A backend is one database seen through several narrow traits: reading
//! source rows, writing grid rows, locking views, describing tables and
//! hosting capture hooks. [`MviewBackend`] bundles them together with the
//! changelog and checkpoint stores living in the same database.

use async_trait::async_trait;
use changelog::{ChangeLog, CheckpointStore, EntityKey};
use chrono::{DateTime, NaiveDateTime, Utc};
use common::Row;
use serde_json::Value;

use crate::Result;
use crate::config::GridDefinition;
use crate::schema::SchemaIntrospector;
use crate::subscription::TriggerHost;

/// Read access to source tables.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Rows of `table` whose `key_column` holds one of `keys`.
    ///
    /// Sorted ascending by `order_by` when given, so callers folding rows
    /// by key keep the one with the highest value.
    async fn fetch_rows(
        &self,
        table: &str,
        key_column: &str,
        keys: &[EntityKey],
        order_by: Option<&str>,
    ) -> Result<Vec<Row>>;

    /// Distinct non-null values of `key_column`, ascending.
    async fn fetch_all_keys(&self, table: &str, key_column: &str) -> Result<Vec<EntityKey>>;

    /// Highest value of the timestamp column, or None for an empty table.
    async fn max_updated_at(&self, table: &str, column: &str) -> Result<Option<DateTime<Utc>>>;

    /// Distinct keys of rows whose timestamp column is newer than `after`.
    async fn keys_updated_after(
        &self,
        table: &str,
        key_column: &str,
        column: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<EntityKey>>;
}

/// Write access to grid tables.
#[async_trait]
pub trait GridStore: Send + Sync {
    /// Upserts `upserts` and deletes `deletes` in one transaction.
    async fn apply_batch(
        &self,
        grid: &GridDefinition,
        upserts: &[Row],
        deletes: &[EntityKey],
    ) -> Result<()>;

    /// Replaces the whole grid content with `rows` in one transaction.
    async fn replace_all(&self, grid: &GridDefinition, rows: &[Row]) -> Result<()>;

    /// Reads one grid row.
    async fn fetch_grid_row(&self, grid: &GridDefinition, key: EntityKey) -> Result<Option<Row>>;

    async fn grid_row_count(&self, grid: &GridDefinition) -> Result<u64>;
}

/// Cross-process refresh locks, one per view.
#[async_trait]
pub trait RefreshLock: Send + Sync {
    /// Takes the lock of `view_id` without waiting. None when it is held.
    async fn try_lock_view(&self, view_id: &str) -> Result<Option<Box<dyn HeldLock>>>;
}

/// A taken refresh lock.
///
/// Dropping it without calling [`release`](HeldLock::release) still frees
/// the lock, possibly later.
#[async_trait]
pub trait HeldLock: Send {
    async fn release(&mut self) -> Result<()>;
}

/// Everything a view needs from its database.
pub trait MviewBackend:
    SchemaIntrospector + TriggerHost + RowSource + GridStore + RefreshLock + Clone + 'static
{
    type ChangeLog: ChangeLog + 'static;
    type Checkpoints: CheckpointStore + 'static;

    /// Handle to the changelog `name`. Does not create it.
    fn changelog(&self, name: &str) -> Result<Self::ChangeLog>;

    fn checkpoints(&self) -> &Self::Checkpoints;
}

/// Reads a timestamp stored as RFC 3339 or as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}
