//! PostgreSQL backend.
//!
//! Capture hooks are PL/pgSQL row triggers inserting into the view's
//! changelog table inside the mutating transaction. Source and grid rows
//! travel as JSONB (`to_jsonb` out, `jsonb_populate_recordset` in), so the
//! engine needs no compile-time knowledge of table layouts. Refresh locks
//! are session-level advisory locks held on a dedicated pool connection.

use async_trait::async_trait;
use changelog::{
    ChangelogError, EntityKey, PostgresChangeLog, PostgresCheckpointStore, run_migrations,
    validate_identifier,
};
use chrono::{DateTime, Utc};
use common::Row;
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};

use crate::config::GridDefinition;
use crate::schema::{ColumnInfo, SchemaIntrospector, TableSchema};
use crate::storage::{GridStore, HeldLock, MviewBackend, RefreshLock, RowSource};
use crate::subscription::{TriggerEvent, TriggerHost, TriggerSpec, trigger_function_name};
use crate::{MviewError, Result};

/// SQLSTATE for "relation does not exist".
const UNDEFINED_TABLE: &str = "42P01";

/// Rows per statement when rebuilding a grid.
const REPLACE_CHUNK: usize = 1000;

fn map_missing(table: &str, err: sqlx::Error) -> MviewError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.code().as_deref() == Some(UNDEFINED_TABLE)
    {
        return MviewError::TableNotFound(table.to_string());
    }
    MviewError::Storage(err)
}

fn checked(name: &str) -> Result<&str> {
    validate_identifier(name).map_err(|e| MviewError::Configuration(e.to_string()))
}

fn raw_keys(keys: &[EntityKey]) -> Vec<i64> {
    keys.iter().map(|k| k.as_i64()).collect()
}

/// PL/pgSQL body of the trigger function for `spec`.
fn trigger_function_sql(spec: &TriggerSpec) -> String {
    let key = &spec.key_column;
    let record_new = PostgresChangeLog::append_statement(&spec.changelog, &format!("NEW.{key}::bigint"));
    let record_old = PostgresChangeLog::append_statement(&spec.changelog, &format!("OLD.{key}::bigint"));
    let body = match spec.event {
        TriggerEvent::Insert => format!(
            "IF NEW.{key} IS NOT NULL THEN\n    {record_new}\n    END IF;\n    RETURN NULL;"
        ),
        TriggerEvent::Update => format!(
            "IF NEW.{key} IS NOT NULL THEN\n    {record_new}\n    END IF;\n    \
             IF OLD.{key} IS NOT NULL AND OLD.{key} IS DISTINCT FROM NEW.{key} THEN\n    \
             {record_old}\n    END IF;\n    RETURN NULL;"
        ),
        TriggerEvent::Delete => format!(
            "IF OLD.{key} IS NOT NULL THEN\n    {record_old}\n    END IF;\n    RETURN NULL;"
        ),
    };
    format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$\nBEGIN\n    {body}\nEND;\n$$ LANGUAGE plpgsql",
        function = trigger_function_name(&spec.name),
    )
}

fn upsert_sql(grid: &GridDefinition, on_conflict: bool) -> String {
    let columns = grid.column_names.join(", ");
    let mut sql = format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1)",
        table = grid.table,
    );
    if on_conflict {
        let updates: Vec<String> = grid
            .column_names
            .iter()
            .filter(|c| **c != grid.key_column)
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", grid.key_column));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                grid.key_column,
                updates.join(", ")
            ));
        }
    }
    sql
}

/// PostgreSQL database holding source tables, grids, changelogs and
/// checkpoints.
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
    checkpoints: PostgresCheckpointStore,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self {
            checkpoints: PostgresCheckpointStore::new(pool.clone()),
            pool,
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the checkpoint table.
    pub async fn migrate(&self) -> Result<()> {
        run_migrations(&self.pool)
            .await
            .map_err(ChangelogError::from)?;
        Ok(())
    }
}

#[async_trait]
impl SchemaIntrospector for PostgresDatabase {
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        let columns: Vec<(String, bool)> = sqlx::query_as(
            r#"
            SELECT c.column_name::text,
                   EXISTS (
                       SELECT 1
                       FROM information_schema.table_constraints tc
                       JOIN information_schema.key_column_usage k
                         ON k.constraint_name = tc.constraint_name
                        AND k.table_schema = tc.table_schema
                        AND k.table_name = tc.table_name
                       WHERE tc.constraint_type = 'PRIMARY KEY'
                         AND tc.table_schema = c.table_schema
                         AND tc.table_name = c.table_name
                         AND k.column_name = c.column_name
                   )
            FROM information_schema.columns c
            WHERE c.table_schema = current_schema() AND c.table_name = $1
            ORDER BY c.ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if columns.is_empty() {
            return Ok(None);
        }
        Ok(Some(TableSchema {
            table: table.to_string(),
            columns: columns
                .into_iter()
                .map(|(name, primary)| ColumnInfo::new(name, primary))
                .collect(),
        }))
    }
}

#[async_trait]
impl TriggerHost for PostgresDatabase {
    async fn install_trigger(&self, spec: &TriggerSpec) -> Result<()> {
        for name in [&spec.name, &spec.table, &spec.changelog, &spec.key_column] {
            checked(name)?;
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&trigger_function_sql(spec))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            spec.name, spec.table
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_missing(&spec.table, e))?;
        sqlx::query(&format!(
            "CREATE TRIGGER {name} AFTER {event} ON {table} FOR EACH ROW EXECUTE FUNCTION {function}()",
            name = spec.name,
            event = spec.event.as_str().to_uppercase(),
            table = spec.table,
            function = trigger_function_name(&spec.name),
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(trigger = %spec.name, table = %spec.table, "trigger installed");
        Ok(())
    }

    async fn remove_trigger(&self, table: &str, name: &str) -> Result<()> {
        checked(table)?;
        checked(name)?;

        let mut tx = self.pool.begin().await?;
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(&mut *tx)
            .await?;
        if exists {
            sqlx::query(&format!("DROP TRIGGER IF EXISTS {name} ON {table}"))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(&format!("DROP FUNCTION IF EXISTS {}()", trigger_function_name(name)))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn trigger_names(&self, table: &str) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT tgname::text FROM pg_trigger
            WHERE tgrelid = to_regclass($1) AND NOT tgisinternal
            ORDER BY tgname
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

#[async_trait]
impl RowSource for PostgresDatabase {
    async fn fetch_rows(
        &self,
        table: &str,
        key_column: &str,
        keys: &[EntityKey],
        order_by: Option<&str>,
    ) -> Result<Vec<Row>> {
        let order = match order_by {
            Some(column) => format!(" ORDER BY t.{column}"),
            None => String::new(),
        };
        let rows: Vec<Json<Row>> = sqlx::query_scalar(&format!(
            "SELECT to_jsonb(t) FROM {table} t WHERE t.{key_column}::bigint = ANY($1){order}"
        ))
        .bind(raw_keys(keys))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_missing(table, e))?;

        Ok(rows.into_iter().map(|Json(row)| row).collect())
    }

    async fn fetch_all_keys(&self, table: &str, key_column: &str) -> Result<Vec<EntityKey>> {
        let keys: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT {key_column}::bigint FROM {table} WHERE {key_column} IS NOT NULL ORDER BY 1"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_missing(table, e))?;

        Ok(keys.into_iter().map(EntityKey::new).collect())
    }

    async fn max_updated_at(&self, table: &str, column: &str) -> Result<Option<DateTime<Utc>>> {
        let max: Option<DateTime<Utc>> = sqlx::query_scalar(&format!(
            "SELECT MAX({column})::timestamptz FROM {table}"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_missing(table, e))?;
        Ok(max)
    }

    async fn keys_updated_after(
        &self,
        table: &str,
        key_column: &str,
        column: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<EntityKey>> {
        let keys: Vec<i64> = sqlx::query_scalar(&format!(
            r#"
            SELECT DISTINCT {key_column}::bigint FROM {table}
            WHERE {column}::timestamptz > $1 AND {key_column} IS NOT NULL
            ORDER BY 1
            "#
        ))
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_missing(table, e))?;

        Ok(keys.into_iter().map(EntityKey::new).collect())
    }
}

#[async_trait]
impl GridStore for PostgresDatabase {
    async fn apply_batch(
        &self,
        grid: &GridDefinition,
        upserts: &[Row],
        deletes: &[EntityKey],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !upserts.is_empty() {
            sqlx::query(&upsert_sql(grid, true))
                .bind(Json(upserts))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_missing(&grid.table, e))?;
        }
        if !deletes.is_empty() {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE {} = ANY($1)",
                grid.table, grid.key_column
            ))
            .bind(raw_keys(deletes))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_missing(&grid.table, e))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_all(&self, grid: &GridDefinition, rows: &[Row]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {}", grid.table))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_missing(&grid.table, e))?;
        let insert = upsert_sql(grid, false);
        for chunk in rows.chunks(REPLACE_CHUNK) {
            sqlx::query(&insert)
                .bind(Json(chunk))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_grid_row(&self, grid: &GridDefinition, key: EntityKey) -> Result<Option<Row>> {
        let row: Option<Json<Row>> = sqlx::query_scalar(&format!(
            "SELECT to_jsonb(g) FROM {} g WHERE g.{} = $1",
            grid.table, grid.key_column
        ))
        .bind(key.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_missing(&grid.table, e))?;
        Ok(row.map(|Json(row)| row))
    }

    async fn grid_row_count(&self, grid: &GridDefinition) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", grid.table))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_missing(&grid.table, e))?;
        Ok(count as u64)
    }
}

/// Advisory lock held on its own connection.
struct AdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    key: String,
}

#[async_trait]
impl HeldLock for AdvisoryLock {
    async fn release(&mut self) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        // On failure the connection stays here and Drop closes the session.
        sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&self.key)
            .execute(&mut **conn)
            .await?;
        self.conn = None;
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        // Closing the session frees the lock; a pooled session would keep it.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl RefreshLock for PostgresDatabase {
    async fn try_lock_view(&self, view_id: &str) -> Result<Option<Box<dyn HeldLock>>> {
        let key = format!("mview:{view_id}");
        let mut conn = self.pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(&key)
            .fetch_one(&mut *conn)
            .await?;
        if !locked {
            return Ok(None);
        }
        Ok(Some(Box::new(AdvisoryLock {
            conn: Some(conn),
            key,
        })))
    }
}

impl MviewBackend for PostgresDatabase {
    type ChangeLog = PostgresChangeLog;
    type Checkpoints = PostgresCheckpointStore;

    fn changelog(&self, name: &str) -> Result<PostgresChangeLog> {
        Ok(PostgresChangeLog::new(self.pool.clone(), name)?)
    }

    fn checkpoints(&self) -> &PostgresCheckpointStore {
        &self.checkpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnRef, GridColumn};

    fn grid() -> GridDefinition {
        GridDefinition {
            table: "sales_order_grid".into(),
            key_column: "entity_id".into(),
            columns: vec![GridColumn {
                name: "status".into(),
                source: ColumnRef {
                    table: "sales_order".into(),
                    column: "status".into(),
                },
            }],
            column_names: vec!["entity_id".into(), "status".into()],
        }
    }

    #[test]
    fn upsert_updates_non_key_columns() {
        let sql = upsert_sql(&grid(), true);
        assert!(sql.starts_with("INSERT INTO sales_order_grid (entity_id, status)"));
        assert!(sql.contains("jsonb_populate_recordset(NULL::sales_order_grid, $1)"));
        assert!(sql.ends_with("ON CONFLICT (entity_id) DO UPDATE SET status = EXCLUDED.status"));
    }

    #[test]
    fn key_only_grid_ignores_conflicts() {
        let mut grid = grid();
        grid.column_names.truncate(1);
        assert!(upsert_sql(&grid, true).ends_with("ON CONFLICT (entity_id) DO NOTHING"));
        assert!(!upsert_sql(&grid, false).contains("ON CONFLICT"));
    }

    #[test]
    fn update_trigger_records_old_key_on_change() {
        let spec = TriggerSpec {
            name: "trg_sales_order_update_sales_order_grid_cl".into(),
            table: "sales_order".into(),
            event: TriggerEvent::Update,
            changelog: "sales_order_grid_cl".into(),
            key_column: "entity_id".into(),
        };
        let sql = trigger_function_sql(&spec);
        assert!(sql.contains("FUNCTION trg_sales_order_update_sales_order_grid_cl_fn()"));
        assert!(sql.contains("INSERT INTO sales_order_grid_cl (entity_id) VALUES (NEW.entity_id::bigint)"));
        assert!(sql.contains("OLD.entity_id IS DISTINCT FROM NEW.entity_id"));
        assert!(sql.contains("pg_advisory_xact_lock(hashtext('sales_order_grid_cl'))"));
    }

    #[test]
    fn delete_trigger_only_reads_old_row() {
        let spec = TriggerSpec {
            name: "trg_sales_order_delete_sales_order_grid_cl".into(),
            table: "sales_order".into(),
            event: TriggerEvent::Delete,
            changelog: "sales_order_grid_cl".into(),
            key_column: "entity_id".into(),
        };
        let sql = trigger_function_sql(&spec);
        assert!(!sql.contains("NEW."));
        assert!(sql.contains("VALUES (OLD.entity_id::bigint)"));
    }
}
