use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    ChangelogEntry, ChangelogError, EntityKey, Result, SequenceId,
    checkpoint::{Checkpoint, CheckpointStore},
    error::validate_identifier,
    store::ChangeLog,
};

/// SQLSTATE for "relation does not exist".
const UNDEFINED_TABLE: &str = "42P01";

/// Runs the migrations that create the checkpoint table.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

/// PostgreSQL-backed changelog.
///
/// Each changelog is its own table:
///
/// ```sql
/// sequence_id BIGSERIAL PRIMARY KEY,
/// entity_id   BIGINT NOT NULL,
/// version_id  BIGINT NOT NULL DEFAULT txid_current(),
/// recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// ```
///
/// Writers take a transaction-scoped advisory lock keyed by the table name
/// before inserting, so sequence ids become visible in allocation order.
#[derive(Clone)]
pub struct PostgresChangeLog {
    pool: PgPool,
    name: String,
}

impl PostgresChangeLog {
    /// Creates a handle to the changelog table `name`.
    pub fn new(pool: PgPool, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self { pool, name })
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns the SQL statement that appends one key for the current
    /// transaction. Trigger functions embed it verbatim.
    pub fn append_statement(name: &str, key_expression: &str) -> String {
        format!(
            "PERFORM pg_advisory_xact_lock(hashtext('{name}'));\n    \
             INSERT INTO {name} (entity_id) VALUES ({key_expression});"
        )
    }

    fn row_to_entry(row: PgRow) -> Result<ChangelogEntry> {
        Ok(ChangelogEntry {
            sequence_id: SequenceId::new(row.try_get("sequence_id")?),
            entity_key: EntityKey::new(row.try_get("entity_id")?),
            version_id: row.try_get("version_id")?,
            recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
        })
    }

    fn map_missing(&self, err: sqlx::Error) -> ChangelogError {
        if let sqlx::Error::Database(ref db_err) = err
            && db_err.code().as_deref() == Some(UNDEFINED_TABLE)
        {
            return ChangelogError::ChangelogNotFound(self.name.clone());
        }
        ChangelogError::Database(err)
    }
}

#[async_trait]
impl ChangeLog for PostgresChangeLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {name} (
                sequence_id BIGSERIAL PRIMARY KEY,
                entity_id BIGINT NOT NULL,
                version_id BIGINT NOT NULL DEFAULT txid_current(),
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            name = self.name
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.name))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn append(&self, entity_key: EntityKey) -> Result<SequenceId> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.name)
            .execute(&mut *tx)
            .await?;

        let sequence: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {} (entity_id) VALUES ($1) RETURNING sequence_id",
            self.name
        ))
        .bind(entity_key.as_i64())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| self.map_missing(e))?;

        tx.commit().await?;
        metrics::counter!("mview_changelog_appends").increment(1);
        Ok(SequenceId::new(sequence))
    }

    async fn entries_since(
        &self,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<ChangelogEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT sequence_id, entity_id, version_id, recorded_at
            FROM {}
            WHERE sequence_id > $1
            ORDER BY sequence_id ASC
            LIMIT $2
            "#,
            self.name
        ))
        .bind(after.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.map_missing(e))?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn entries_between(
        &self,
        after: SequenceId,
        up_to: SequenceId,
    ) -> Result<Vec<ChangelogEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT sequence_id, entity_id, version_id, recorded_at
            FROM {}
            WHERE sequence_id > $1 AND sequence_id <= $2
            ORDER BY sequence_id ASC
            "#,
            self.name
        ))
        .bind(after.as_i64())
        .bind(up_to.as_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.map_missing(e))?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn current_sequence(&self) -> Result<SequenceId> {
        // Pruning only removes entries below the slowest checkpoint, so the
        // newest entry always survives and MAX is the head.
        let head: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(sequence_id) FROM {}",
            self.name
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| self.map_missing(e))?;

        Ok(SequenceId::new(head.unwrap_or(0)))
    }

    async fn prune(&self, below: SequenceId) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE sequence_id < $1",
            self.name
        ))
        .bind(below.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| self.map_missing(e))?;

        Ok(result.rows_affected())
    }
}

/// PostgreSQL-backed checkpoint store using the `mview_state` table.
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Creates a new PostgreSQL checkpoint store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_checkpoint(row: PgRow) -> Result<Checkpoint> {
        Ok(Checkpoint {
            subscriber_id: row.try_get("subscriber_id")?,
            last_processed_sequence_id: SequenceId::new(
                row.try_get("last_processed_sequence_id")?,
            ),
            last_processed_at: row.try_get::<DateTime<Utc>, _>("last_processed_at")?,
        })
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, subscriber_id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT subscriber_id, last_processed_sequence_id, last_processed_at
            FROM mview_state
            WHERE subscriber_id = $1
            "#,
        )
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_checkpoint).transpose()
    }

    async fn advance(
        &self,
        subscriber_id: &str,
        expected: SequenceId,
        to: SequenceId,
    ) -> Result<Checkpoint> {
        if to < expected {
            return Err(ChangelogError::CheckpointRegression {
                subscriber: subscriber_id.to_string(),
                current: expected,
                requested: to,
            });
        }

        // Insert-or-update guarded by the expected position. A missing row
        // counts as position 0, so only an advance from 0 may create it.
        let row: Option<PgRow> = if expected == SequenceId::initial() {
            sqlx::query(
                r#"
                INSERT INTO mview_state (subscriber_id, last_processed_sequence_id, last_processed_at)
                VALUES ($1, $2, now())
                ON CONFLICT (subscriber_id) DO UPDATE SET
                    last_processed_sequence_id = EXCLUDED.last_processed_sequence_id,
                    last_processed_at = EXCLUDED.last_processed_at
                WHERE mview_state.last_processed_sequence_id = 0
                RETURNING subscriber_id, last_processed_sequence_id, last_processed_at
                "#,
            )
            .bind(subscriber_id)
            .bind(to.as_i64())
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE mview_state
                SET last_processed_sequence_id = $3, last_processed_at = now()
                WHERE subscriber_id = $1 AND last_processed_sequence_id = $2
                RETURNING subscriber_id, last_processed_sequence_id, last_processed_at
                "#,
            )
            .bind(subscriber_id)
            .bind(expected.as_i64())
            .bind(to.as_i64())
            .fetch_optional(&self.pool)
            .await?
        };

        match row {
            Some(row) => Self::row_to_checkpoint(row),
            None => {
                let actual = self
                    .load(subscriber_id)
                    .await?
                    .map(|c| c.last_processed_sequence_id)
                    .unwrap_or_else(SequenceId::initial);
                Err(ChangelogError::CheckpointConflict {
                    subscriber: subscriber_id.to_string(),
                    expected,
                    actual,
                })
            }
        }
    }

    async fn remove(&self, subscriber_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM mview_state WHERE subscriber_id = $1")
            .bind(subscriber_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT subscriber_id, last_processed_sequence_id, last_processed_at
            FROM mview_state
            ORDER BY subscriber_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_checkpoint).collect()
    }
}
