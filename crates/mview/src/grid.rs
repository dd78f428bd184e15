//! Projection of source rows into grid rows.

use std::collections::HashMap;

use changelog::EntityKey;
use common::Row;
use serde_json::Value;

use crate::config::ViewConfig;
use crate::storage::RowSource;
use crate::{MviewError, Result};

/// Grid changes computed for a set of keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridChanges {
    pub upserts: Vec<Row>,
    /// Keys whose main-table row is gone.
    pub deletes: Vec<EntityKey>,
}

impl GridChanges {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Current source rows of a set of keys, per subscribed table.
#[derive(Debug, Default)]
pub struct SourceSnapshot {
    tables: HashMap<String, HashMap<EntityKey, Row>>,
}

impl SourceSnapshot {
    /// Adds rows of `table`, keyed by `key_column`.
    ///
    /// When several rows share a key the last one wins.
    pub fn insert_rows(
        &mut self,
        view_id: &str,
        table: &str,
        key_column: &str,
        rows: Vec<Row>,
    ) {
        let by_key = self.tables.entry(table.to_string()).or_default();
        for row in rows {
            let raw = row.get(key_column).cloned().unwrap_or(Value::Null);
            match EntityKey::from_value(&raw) {
                Some(key) => {
                    by_key.insert(key, row);
                }
                None => {
                    let err = MviewError::Materialization {
                        view_id: view_id.to_string(),
                        table: table.to_string(),
                        reason: format!("{key_column} holds unusable key {raw}"),
                    };
                    tracing::warn!(error = %err, "skipping source row");
                }
            }
        }
    }

    pub fn row(&self, table: &str, key: EntityKey) -> Option<&Row> {
        self.tables.get(table).and_then(|rows| rows.get(&key))
    }
}

/// Builds grid rows for one view.
pub struct Projector<'a> {
    view: &'a ViewConfig,
}

impl<'a> Projector<'a> {
    pub fn new(view: &'a ViewConfig) -> Self {
        Self { view }
    }

    /// Loads the current source state of `keys` and projects it.
    pub async fn project(&self, source: &dyn RowSource, keys: &[EntityKey]) -> Result<GridChanges> {
        if keys.is_empty() {
            return Ok(GridChanges::default());
        }
        let snapshot = self.load(source, keys).await?;
        Ok(self.project_snapshot(&snapshot, keys))
    }

    async fn load(&self, source: &dyn RowSource, keys: &[EntityKey]) -> Result<SourceSnapshot> {
        let mut snapshot = SourceSnapshot::default();
        for subscription in &self.view.subscriptions {
            let rows = source
                .fetch_rows(
                    &subscription.source_table,
                    &subscription.entity_key_column,
                    keys,
                    subscription.primary_key_column.as_deref(),
                )
                .await?;
            snapshot.insert_rows(
                &self.view.id,
                &subscription.source_table,
                &subscription.entity_key_column,
                rows,
            );
        }
        Ok(snapshot)
    }

    /// Projects already loaded rows. A key without a main-table row
    /// becomes a delete.
    pub fn project_snapshot(&self, snapshot: &SourceSnapshot, keys: &[EntityKey]) -> GridChanges {
        let mut changes = GridChanges::default();
        for key in keys {
            match self.build_row(snapshot, *key) {
                Some(row) => changes.upserts.push(row),
                None => changes.deletes.push(*key),
            }
        }
        changes
    }

    fn build_row(&self, snapshot: &SourceSnapshot, key: EntityKey) -> Option<Row> {
        let main = self.view.main_subscription();
        snapshot.row(&main.source_table, key)?;

        let grid = &self.view.grid;
        let mut row = Row::new();
        row.insert(grid.key_column.clone(), key.to_value());

        for column in &grid.columns {
            if column.name == grid.key_column {
                continue;
            }
            let value = snapshot
                .row(&column.source.table, key)
                .and_then(|source| source.get(&column.source.column))
                .cloned()
                .unwrap_or(Value::Null);
            row.insert(column.name.clone(), value);
        }

        for subscription in &self.view.subscriptions {
            let source = snapshot.row(&subscription.source_table, key);
            row.extend(
                subscription
                    .processor
                    .process(&subscription.additional_columns, source),
            );
        }
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLoader, MviewDeclarations};
    use crate::schema::{SchemaIntrospector, TableSchema};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoSchemas;

    #[async_trait]
    impl SchemaIntrospector for NoSchemas {
        async fn describe_table(&self, _: &str) -> Result<Option<TableSchema>> {
            Ok(None)
        }
    }

    async fn view() -> ViewConfig {
        let declarations = MviewDeclarations::from_json(
            &json!({
                "views": [{
                    "id": "order_grid",
                    "grid": {
                        "table": "order_grid",
                        "key_column": "entity_id",
                        "columns": {
                            "status": "orders.status",
                            "city": "order_address.city"
                        }
                    },
                    "subscriptions": [
                        {
                            "name": "orders",
                            "entity_column": "entity_id",
                            "additional_columns": [{"name": "channel", "constant": "web"}]
                        },
                        {"name": "order_address", "entity_column": "parent_id"}
                    ]
                }]
            })
            .to_string(),
        )
        .unwrap();
        let config = ConfigLoader::new()
            .load(&declarations, &NoSchemas)
            .await
            .unwrap();
        config.view("order_grid").unwrap().as_ref().clone()
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn joins_subscribed_tables_by_key() {
        let view = view().await;
        let mut snapshot = SourceSnapshot::default();
        snapshot.insert_rows(
            "order_grid",
            "orders",
            "entity_id",
            vec![row(json!({"entity_id": 7, "status": "new"}))],
        );
        snapshot.insert_rows(
            "order_grid",
            "order_address",
            "parent_id",
            vec![row(json!({"address_id": 1, "parent_id": 7, "city": "Lyon"}))],
        );

        let changes = Projector::new(&view).project_snapshot(&snapshot, &[EntityKey::new(7)]);
        assert!(changes.deletes.is_empty());
        assert_eq!(
            changes.upserts,
            vec![row(json!({
                "entity_id": 7,
                "status": "new",
                "city": "Lyon",
                "channel": "web"
            }))]
        );
    }

    #[tokio::test]
    async fn missing_main_row_is_a_tombstone() {
        let view = view().await;
        let mut snapshot = SourceSnapshot::default();
        snapshot.insert_rows(
            "order_grid",
            "order_address",
            "parent_id",
            vec![row(json!({"parent_id": 8, "city": "Oslo"}))],
        );

        let changes = Projector::new(&view).project_snapshot(&snapshot, &[EntityKey::new(8)]);
        assert!(changes.upserts.is_empty());
        assert_eq!(changes.deletes, vec![EntityKey::new(8)]);
    }

    #[tokio::test]
    async fn missing_joined_row_projects_nulls() {
        let view = view().await;
        let mut snapshot = SourceSnapshot::default();
        snapshot.insert_rows(
            "order_grid",
            "orders",
            "entity_id",
            vec![row(json!({"entity_id": 9, "status": "paid"}))],
        );

        let changes = Projector::new(&view).project_snapshot(&snapshot, &[EntityKey::new(9)]);
        assert_eq!(changes.upserts[0]["city"], Value::Null);
    }

    #[test]
    fn last_row_per_key_wins_and_bad_keys_are_skipped() {
        let mut snapshot = SourceSnapshot::default();
        snapshot.insert_rows(
            "order_grid",
            "order_address",
            "parent_id",
            vec![
                row(json!({"address_id": 1, "parent_id": 3, "city": "Rome"})),
                row(json!({"address_id": 2, "parent_id": 3, "city": "Pisa"})),
                row(json!({"address_id": 4, "parent_id": null, "city": "Bari"})),
            ],
        );
        let kept = snapshot.row("order_address", EntityKey::new(3)).unwrap();
        assert_eq!(kept["city"], json!("Pisa"));
        assert_eq!(snapshot.tables["order_address"].len(), 1);
    }
}
