//! Additional-column processors: the computed part of a grid row.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use common::Row;
use serde_json::Value;

use crate::config::{AdditionalColumn, ColumnSource};

/// Computes the additional grid columns a subscription contributes.
pub trait AdditionalColumnsProcessor: Send + Sync + Debug {
    /// Returns the additional columns for one source row.
    ///
    /// `source` is None when the subscribed table has no row for the key.
    fn process(&self, columns: &[AdditionalColumn], source: Option<&Row>) -> Row;
}

/// Copies expression columns from the source row and fills in constants.
///
/// A missing source row or column yields JSON null for expressions.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProcessor;

impl AdditionalColumnsProcessor for DefaultProcessor {
    fn process(&self, columns: &[AdditionalColumn], source: Option<&Row>) -> Row {
        columns
            .iter()
            .map(|column| {
                let value = match &column.source {
                    ColumnSource::Constant(value) => value.clone(),
                    ColumnSource::Expression(expr) => source
                        .and_then(|row| row.get(expr))
                        .cloned()
                        .unwrap_or(Value::Null),
                };
                (column.name.clone(), value)
            })
            .collect()
    }
}

/// Additional-column processors available to configuration, by name.
#[derive(Debug, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn AdditionalColumnsProcessor>>,
}

impl ProcessorRegistry {
    /// Name under which [`DefaultProcessor`] is registered.
    pub const DEFAULT: &'static str = "default";

    /// Creates a registry holding only the default processor.
    pub fn new() -> Self {
        let mut registry = Self {
            processors: HashMap::new(),
        };
        registry.register(Self::DEFAULT, DefaultProcessor);
        registry
    }

    /// Registers a processor under `name`, replacing any previous one.
    pub fn register<P: AdditionalColumnsProcessor + 'static>(
        &mut self,
        name: impl Into<String>,
        processor: P,
    ) {
        self.processors.insert(name.into(), Arc::new(processor));
    }

    /// Looks a processor up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AdditionalColumnsProcessor>> {
        self.processors.get(name).cloned()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
