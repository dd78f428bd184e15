//! Table introspection used to resolve key columns.

use async_trait::async_trait;

use crate::Result;

/// One column of a described table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub primary: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, primary: bool) -> Self {
        Self {
            name: name.into(),
            primary,
        }
    }
}

/// Column layout of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    /// Returns true if the table has a column named `name`.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Returns the first primary-key column, if the table has one.
    pub fn primary_key(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.primary)
            .map(|c| c.name.as_str())
    }
}

/// Describes tables of the underlying database.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    /// Returns the layout of `table`, or None if the table does not exist.
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>>;
}
