//! In-memory database backend.
//!
//! Source tables, capture hooks, grid tables and refresh locks live in
//! process memory. Hooks append to their changelog while the table lock is
//! held, so a mutation and its changelog entries become visible together.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use changelog::{EntityKey, InMemoryChangeLog, InMemoryCheckpointStore, validate_identifier};
use chrono::{DateTime, Utc};
use common::Row;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::GridDefinition;
use crate::schema::{ColumnInfo, SchemaIntrospector, TableSchema};
use crate::storage::{GridStore, HeldLock, MviewBackend, RefreshLock, RowSource, parse_timestamp};
use crate::subscription::{TriggerEvent, TriggerHost, TriggerSpec};
use crate::{MviewError, Result};

#[derive(Debug, Default)]
struct Table {
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
    triggers: BTreeMap<String, TriggerSpec>,
}

impl Table {
    fn schema(&self, name: &str) -> TableSchema {
        TableSchema {
            table: name.to_string(),
            columns: self.columns.clone(),
        }
    }

    fn check_columns(&self, table: &str, row: &Row) -> Result<()> {
        match row
            .keys()
            .find(|column| !self.columns.iter().any(|c| &c.name == *column))
        {
            Some(column) => Err(MviewError::Configuration(format!(
                "table {table} has no column {column}"
            ))),
            None => Ok(()),
        }
    }

    /// Keys each hook on `event` records for the given (old, new) rows.
    fn captured(
        &self,
        event: TriggerEvent,
        changes: &[(Option<&Row>, Option<&Row>)],
    ) -> Vec<(String, Vec<EntityKey>)> {
        self.triggers
            .values()
            .filter(|trigger| trigger.event == event)
            .map(|trigger| {
                let mut keys = Vec::new();
                for (old, new) in changes {
                    let old_key = old.and_then(|row| key_of(row, &trigger.key_column));
                    let new_key = new.and_then(|row| key_of(row, &trigger.key_column));
                    keys.extend(new_key);
                    if old_key != new_key {
                        keys.extend(old_key);
                    }
                }
                (trigger.changelog.clone(), keys)
            })
            .filter(|(_, keys)| !keys.is_empty())
            .collect()
    }
}

/// Injected grid write failures: pass `skip` writes, then fail `fail`.
#[derive(Debug, Default)]
struct GridFailures {
    skip: usize,
    fail: usize,
}

#[derive(Debug, Default)]
struct Catalog {
    tables: BTreeMap<String, Table>,
    grids: BTreeMap<String, BTreeMap<EntityKey, Row>>,
}

impl Catalog {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| MviewError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| MviewError::TableNotFound(name.to_string()))
    }
}

fn key_of(row: &Row, column: &str) -> Option<EntityKey> {
    row.get(column).and_then(EntityKey::from_value)
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Orders JSON values: nulls first, then numbers, then strings.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(_) => 3,
        }
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// In-memory database for tests and database-less runs.
///
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    catalog: Arc<RwLock<Catalog>>,
    changelogs: Arc<StdMutex<HashMap<String, InMemoryChangeLog>>>,
    checkpoints: InMemoryCheckpointStore,
    locks: Arc<StdMutex<HashSet<String>>>,
    grid_failures: Arc<StdMutex<GridFailures>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source table.
    pub async fn create_table(
        &self,
        name: &str,
        columns: &[&str],
        primary_key: Option<&str>,
    ) -> Result<()> {
        validate_identifier(name)?;
        let mut catalog = self.catalog.write().await;
        if catalog.tables.contains_key(name) {
            return Err(MviewError::Configuration(format!(
                "table {name} already exists"
            )));
        }
        let table = Table {
            columns: columns
                .iter()
                .map(|c| ColumnInfo::new(*c, Some(*c) == primary_key))
                .collect(),
            ..Table::default()
        };
        catalog.tables.insert(name.to_string(), table);
        Ok(())
    }

    /// Inserts a row, firing insert hooks.
    pub async fn insert(&self, table: &str, row: Row) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        let target = catalog.table_mut(table)?;
        target.check_columns(table, &row)?;

        let captured = target.captured(TriggerEvent::Insert, &[(None, Some(&row))]);
        self.capture(captured).await?;
        target.rows.push(row);
        Ok(())
    }

    /// Applies `changes` to every row whose `key_column` equals `key`,
    /// firing update hooks. Returns the number of rows updated.
    pub async fn update(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        changes: Row,
    ) -> Result<usize> {
        let mut catalog = self.catalog.write().await;
        let target = catalog.table_mut(table)?;
        target.check_columns(table, &changes)?;

        let mut updated = Vec::new();
        for (index, row) in target.rows.iter().enumerate() {
            if row.get(key_column) == Some(key) {
                let mut new = row.clone();
                new.extend(changes.clone());
                updated.push((index, new));
            }
        }

        let captured = {
            let pairs: Vec<_> = updated
                .iter()
                .map(|(index, new)| (Some(&target.rows[*index]), Some(new)))
                .collect();
            target.captured(TriggerEvent::Update, &pairs)
        };
        self.capture(captured).await?;

        let count = updated.len();
        for (index, new) in updated {
            target.rows[index] = new;
        }
        Ok(count)
    }

    /// Deletes every row whose `key_column` equals `key`, firing delete
    /// hooks. Returns the number of rows deleted.
    pub async fn delete(&self, table: &str, key_column: &str, key: &Value) -> Result<usize> {
        let mut catalog = self.catalog.write().await;
        let target = catalog.table_mut(table)?;

        let (count, captured) = {
            let deleted: Vec<_> = target
                .rows
                .iter()
                .filter(|row| row.get(key_column) == Some(key))
                .map(|row| (Some(row), None::<&Row>))
                .collect();
            (deleted.len(), target.captured(TriggerEvent::Delete, &deleted))
        };
        self.capture(captured).await?;

        target.rows.retain(|row| row.get(key_column) != Some(key));
        Ok(count)
    }

    /// Current rows of a source table.
    pub async fn rows(&self, table: &str) -> Result<Vec<Row>> {
        Ok(self.catalog.read().await.table(table)?.rows.clone())
    }

    /// Current rows of a grid table, ordered by key.
    pub async fn grid_rows(&self, grid_table: &str) -> Vec<Row> {
        self.catalog
            .read()
            .await
            .grids
            .get(grid_table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Lets `skip` grid writes through, then fails the next `count` with
    /// a transient error.
    pub fn fail_grid_writes(&self, skip: usize, count: usize) {
        *lock(&self.grid_failures) = GridFailures { skip, fail: count };
    }

    fn take_grid_failure(&self) -> bool {
        let mut failures = lock(&self.grid_failures);
        if failures.skip > 0 {
            failures.skip -= 1;
            false
        } else if failures.fail > 0 {
            failures.fail -= 1;
            true
        } else {
            false
        }
    }

    fn changelog_handle(&self, name: &str) -> InMemoryChangeLog {
        lock(&self.changelogs)
            .entry(name.to_string())
            .or_insert_with(|| InMemoryChangeLog::new(name))
            .clone()
    }

    async fn capture(&self, captured: Vec<(String, Vec<EntityKey>)>) -> Result<()> {
        for (changelog, keys) in captured {
            self.changelog_handle(&changelog)
                .append_captured(&keys)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaIntrospector for InMemoryDatabase {
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        Ok(self
            .catalog
            .read()
            .await
            .tables
            .get(table)
            .map(|t| t.schema(table)))
    }
}

#[async_trait]
impl TriggerHost for InMemoryDatabase {
    async fn install_trigger(&self, spec: &TriggerSpec) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        let table = catalog.table_mut(&spec.table)?;
        table.triggers.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn remove_trigger(&self, table: &str, name: &str) -> Result<()> {
        if let Some(table) = self.catalog.write().await.tables.get_mut(table) {
            table.triggers.remove(name);
        }
        Ok(())
    }

    async fn trigger_names(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .catalog
            .read()
            .await
            .table(table)?
            .triggers
            .keys()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RowSource for InMemoryDatabase {
    async fn fetch_rows(
        &self,
        table: &str,
        key_column: &str,
        keys: &[EntityKey],
        order_by: Option<&str>,
    ) -> Result<Vec<Row>> {
        let wanted: HashSet<EntityKey> = keys.iter().copied().collect();
        let catalog = self.catalog.read().await;
        let mut rows: Vec<Row> = catalog
            .table(table)?
            .rows
            .iter()
            .filter(|row| key_of(row, key_column).is_some_and(|k| wanted.contains(&k)))
            .cloned()
            .collect();
        if let Some(column) = order_by {
            rows.sort_by(|a, b| compare_values(a.get(column), b.get(column)));
        }
        Ok(rows)
    }

    async fn fetch_all_keys(&self, table: &str, key_column: &str) -> Result<Vec<EntityKey>> {
        let catalog = self.catalog.read().await;
        let keys: BTreeSet<EntityKey> = catalog
            .table(table)?
            .rows
            .iter()
            .filter_map(|row| key_of(row, key_column))
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn max_updated_at(&self, table: &str, column: &str) -> Result<Option<DateTime<Utc>>> {
        let catalog = self.catalog.read().await;
        Ok(catalog
            .table(table)?
            .rows
            .iter()
            .filter_map(|row| row.get(column).and_then(parse_timestamp))
            .max())
    }

    async fn keys_updated_after(
        &self,
        table: &str,
        key_column: &str,
        column: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<EntityKey>> {
        let catalog = self.catalog.read().await;
        let keys: BTreeSet<EntityKey> = catalog
            .table(table)?
            .rows
            .iter()
            .filter(|row| {
                row.get(column)
                    .and_then(parse_timestamp)
                    .is_some_and(|updated| updated > after)
            })
            .filter_map(|row| key_of(row, key_column))
            .collect();
        Ok(keys.into_iter().collect())
    }
}

fn grid_key(grid: &GridDefinition, row: &Row) -> Result<EntityKey> {
    key_of(row, &grid.key_column).ok_or_else(|| MviewError::Materialization {
        view_id: grid.table.clone(),
        table: grid.table.clone(),
        reason: format!("grid row without {}", grid.key_column),
    })
}

#[async_trait]
impl GridStore for InMemoryDatabase {
    async fn apply_batch(
        &self,
        grid: &GridDefinition,
        upserts: &[Row],
        deletes: &[EntityKey],
    ) -> Result<()> {
        if self.take_grid_failure() {
            return Err(MviewError::TransientStorage(format!(
                "write to {} failed",
                grid.table
            )));
        }
        let keyed = upserts
            .iter()
            .map(|row| Ok((grid_key(grid, row)?, row.clone())))
            .collect::<Result<Vec<_>>>()?;

        let mut catalog = self.catalog.write().await;
        let rows = catalog.grids.entry(grid.table.clone()).or_default();
        rows.extend(keyed);
        for key in deletes {
            rows.remove(key);
        }
        Ok(())
    }

    async fn replace_all(&self, grid: &GridDefinition, rows: &[Row]) -> Result<()> {
        if self.take_grid_failure() {
            return Err(MviewError::TransientStorage(format!(
                "write to {} failed",
                grid.table
            )));
        }
        let keyed = rows
            .iter()
            .map(|row| Ok((grid_key(grid, row)?, row.clone())))
            .collect::<Result<BTreeMap<_, _>>>()?;
        self.catalog
            .write()
            .await
            .grids
            .insert(grid.table.clone(), keyed);
        Ok(())
    }

    async fn fetch_grid_row(&self, grid: &GridDefinition, key: EntityKey) -> Result<Option<Row>> {
        Ok(self
            .catalog
            .read()
            .await
            .grids
            .get(&grid.table)
            .and_then(|rows| rows.get(&key))
            .cloned())
    }

    async fn grid_row_count(&self, grid: &GridDefinition) -> Result<u64> {
        Ok(self
            .catalog
            .read()
            .await
            .grids
            .get(&grid.table)
            .map_or(0, |rows| rows.len() as u64))
    }
}

/// Lock-table entry held by one refresh.
struct MemoryLock {
    locks: Arc<StdMutex<HashSet<String>>>,
    view_id: String,
    held: bool,
}

impl MemoryLock {
    fn free(&mut self) {
        if self.held {
            lock(&self.locks).remove(&self.view_id);
            self.held = false;
        }
    }
}

#[async_trait]
impl HeldLock for MemoryLock {
    async fn release(&mut self) -> Result<()> {
        self.free();
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.free();
    }
}

#[async_trait]
impl RefreshLock for InMemoryDatabase {
    async fn try_lock_view(&self, view_id: &str) -> Result<Option<Box<dyn HeldLock>>> {
        if !lock(&self.locks).insert(view_id.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLock {
            locks: Arc::clone(&self.locks),
            view_id: view_id.to_string(),
            held: true,
        })))
    }
}

impl MviewBackend for InMemoryDatabase {
    type ChangeLog = InMemoryChangeLog;
    type Checkpoints = InMemoryCheckpointStore;

    fn changelog(&self, name: &str) -> Result<InMemoryChangeLog> {
        validate_identifier(name)?;
        Ok(self.changelog_handle(name))
    }

    fn checkpoints(&self) -> &InMemoryCheckpointStore {
        &self.checkpoints
    }
}
