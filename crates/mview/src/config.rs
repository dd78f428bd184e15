//! View configuration: declarations in, immutable resolved config out.
//!
//! Declarations are plain serde structs (read from JSON). [`ConfigLoader`]
//! validates them once at startup, resolves key columns against the live
//! schema and looks up subscription models and processors by name. The
//! result, [`MviewConfig`], is never mutated afterwards and is shared by
//! `Arc` with every component.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use changelog::validate_identifier;
use serde::{Deserialize, Serialize};

use crate::columns::{AdditionalColumnsProcessor, ProcessorRegistry};
use crate::schema::{SchemaIntrospector, TableSchema};
use crate::subscription::{
    ModelRegistry, SubscriptionModel, TriggerEvent, trigger_function_name, trigger_name,
};
use crate::walker::{DEFAULT_BATCH_SIZE, WalkerKind};
use crate::{MviewError, Result};

// -- Declarations --

/// Top-level declaration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MviewDeclarations {
    #[serde(default)]
    pub views: Vec<ViewDeclaration>,
}

impl MviewDeclarations {
    /// Parses a JSON declaration document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| MviewError::Configuration(format!("invalid declarations: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDeclaration {
    pub id: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub walker: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    pub grid: GridDeclaration,
    pub subscriptions: Vec<SubscriptionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridDeclaration {
    pub table: String,
    pub key_column: String,
    /// Grid column name to `table.column` of a subscribed table.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDeclaration {
    /// Source table name.
    pub name: String,
    pub entity_column: String,
    #[serde(default)]
    pub subscription_model: Option<String>,
    #[serde(default)]
    pub processor: Option<String>,
    #[serde(default)]
    pub updated_at_column: Option<String>,
    #[serde(default)]
    pub additional_columns: Vec<AdditionalColumnDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalColumnDeclaration {
    pub name: String,
    /// Source column to copy; defaults to `name`.
    #[serde(default)]
    pub cl_name: Option<String>,
    /// Fixed value; takes precedence over `cl_name`.
    #[serde(default)]
    pub constant: Option<serde_json::Value>,
}

// -- Resolved configuration --

/// Where an additional column gets its value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSource {
    /// Copied from this column of the source row.
    Expression(String),
    /// Always this value.
    Constant(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdditionalColumn {
    pub name: String,
    pub source: ColumnSource,
}

/// A `table.column` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    /// Parses `table.column`.
    pub fn parse(reference: &str) -> Result<Self> {
        let (table, column) = reference.split_once('.').ok_or_else(|| {
            MviewError::Configuration(format!(
                "column reference {reference:?} must look like table.column"
            ))
        })?;
        Ok(Self {
            table: checked_identifier(table)?.to_string(),
            column: checked_identifier(column)?.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridColumn {
    pub name: String,
    pub source: ColumnRef,
}

/// Layout of a grid table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridDefinition {
    pub table: String,
    /// Grid column holding the entity key; unique in the grid.
    pub key_column: String,
    pub columns: Vec<GridColumn>,
    /// Every column a projected row carries, key column first.
    pub column_names: Vec<String>,
}

/// One watched source table.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub source_table: String,
    /// Column whose value is recorded in the changelog. Already resolved:
    /// falls back to the primary key when the declared column is missing.
    pub entity_key_column: String,
    /// Used to pick a deterministic row when several share one key.
    pub primary_key_column: Option<String>,
    pub changelog_name: String,
    /// Timestamp column consulted by the last-update-time cache.
    pub updated_at_column: Option<String>,
    pub additional_columns: Vec<AdditionalColumn>,
    pub model: Arc<dyn SubscriptionModel>,
    pub processor: Arc<dyn AdditionalColumnsProcessor>,
}

/// One materialized view.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub id: String,
    pub group: Option<String>,
    pub changelog_name: String,
    pub walker: WalkerKind,
    pub grid: GridDefinition,
    /// Watched tables; the first one is the main table whose rows decide
    /// whether a grid row exists.
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl ViewConfig {
    /// The main subscription.
    pub fn main_subscription(&self) -> &SubscriptionConfig {
        &self.subscriptions[0]
    }

    pub fn subscription(&self, table: &str) -> Option<&SubscriptionConfig> {
        self.subscriptions.iter().find(|s| s.source_table == table)
    }
}

/// The resolved configuration of every view.
#[derive(Debug, Clone, Default)]
pub struct MviewConfig {
    views: BTreeMap<String, Arc<ViewConfig>>,
}

impl MviewConfig {
    pub fn view(&self, id: &str) -> Option<&Arc<ViewConfig>> {
        self.views.get(id)
    }

    /// Views ordered by id.
    pub fn views(&self) -> impl Iterator<Item = &Arc<ViewConfig>> {
        self.views.values()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// Name of the changelog a view writes to.
pub fn changelog_name(view_id: &str) -> String {
    format!("{view_id}_cl")
}

fn checked_identifier(name: &str) -> Result<&str> {
    validate_identifier(name).map_err(|e| MviewError::Configuration(e.to_string()))
}

/// Picks the column a subscription records in its changelog.
///
/// The declared column wins when the table has it, or when the table does
/// not exist yet. Otherwise the primary key is used; a table without one
/// can't be subscribed.
pub fn resolve_key_column(
    table: &str,
    declared: &str,
    schema: Option<&TableSchema>,
) -> Result<String> {
    let Some(schema) = schema else {
        return Ok(declared.to_string());
    };
    if schema.has_column(declared) {
        return Ok(declared.to_string());
    }
    match schema.primary_key() {
        Some(primary) => {
            tracing::warn!(
                table,
                declared,
                fallback = primary,
                "entity column missing, using primary key"
            );
            Ok(primary.to_string())
        }
        None => Err(MviewError::Configuration(format!(
            "table {table} has no column {declared} and no primary key"
        ))),
    }
}

// -- Loader --

/// Turns declarations into an [`MviewConfig`].
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    models: ModelRegistry,
    processors: ProcessorRegistry,
    default_walker: String,
    default_batch_size: usize,
}

impl ConfigLoader {
    /// Creates a loader with the default model, processor and walker.
    pub fn new() -> Self {
        Self {
            models: ModelRegistry::new(),
            processors: ProcessorRegistry::new(),
            default_walker: WalkerKind::DEFAULT.to_string(),
            default_batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_models(mut self, models: ModelRegistry) -> Self {
        self.models = models;
        self
    }

    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    /// Walker used by views that don't name one.
    pub fn with_default_walker(mut self, walker: impl Into<String>) -> Self {
        self.default_walker = walker.into();
        self
    }

    pub fn with_default_batch_size(mut self, batch_size: usize) -> Self {
        self.default_batch_size = batch_size;
        self
    }

    /// Validates and resolves every declared view.
    ///
    /// Each table is described at most once per load.
    #[tracing::instrument(skip_all, fields(views = declarations.views.len()))]
    pub async fn load(
        &self,
        declarations: &MviewDeclarations,
        introspector: &dyn SchemaIntrospector,
    ) -> Result<MviewConfig> {
        let mut schemas: HashMap<String, Option<TableSchema>> = HashMap::new();
        let mut views = BTreeMap::new();

        for declaration in &declarations.views {
            for subscription in &declaration.subscriptions {
                let table = checked_identifier(&subscription.name)?;
                if !schemas.contains_key(table) {
                    let schema = introspector.describe_table(table).await?;
                    schemas.insert(table.to_string(), schema);
                }
            }

            let view = self.resolve_view(declaration, &schemas)?;
            if views.contains_key(&view.id) {
                return Err(MviewError::Configuration(format!(
                    "view {} declared twice",
                    view.id
                )));
            }
            tracing::debug!(view_id = %view.id, walker = view.walker.name(), "view configured");
            views.insert(view.id.clone(), Arc::new(view));
        }

        Ok(MviewConfig { views })
    }

    fn resolve_view(
        &self,
        declaration: &ViewDeclaration,
        schemas: &HashMap<String, Option<TableSchema>>,
    ) -> Result<ViewConfig> {
        let id = checked_identifier(&declaration.id)?.to_string();
        let changelog_name = changelog_name(&id);
        checked_identifier(&changelog_name)?;

        if declaration.subscriptions.is_empty() {
            return Err(MviewError::Configuration(format!(
                "view {id} has no subscriptions"
            )));
        }

        let batch_size = declaration.batch_size.unwrap_or(self.default_batch_size);
        if batch_size == 0 {
            return Err(MviewError::Configuration(format!(
                "view {id}: batch size must be positive"
            )));
        }
        let walker_name = declaration
            .walker
            .as_deref()
            .unwrap_or(&self.default_walker);
        let walker = WalkerKind::from_name(walker_name, batch_size).ok_or_else(|| {
            MviewError::Configuration(format!("view {id}: unknown walker {walker_name:?}"))
        })?;

        let mut seen_tables = HashSet::new();
        let mut subscriptions = Vec::with_capacity(declaration.subscriptions.len());
        for subscription in &declaration.subscriptions {
            if !seen_tables.insert(subscription.name.as_str()) {
                return Err(MviewError::Configuration(format!(
                    "view {id}: table {} subscribed twice",
                    subscription.name
                )));
            }
            let schema = schemas.get(&subscription.name).and_then(Option::as_ref);
            subscriptions.push(self.resolve_subscription(
                &id,
                &changelog_name,
                subscription,
                schema,
            )?);
        }

        let grid = resolve_grid(&id, &declaration.grid, &subscriptions, schemas)?;

        Ok(ViewConfig {
            id,
            group: declaration.group.clone(),
            changelog_name,
            walker,
            grid,
            subscriptions,
        })
    }

    fn resolve_subscription(
        &self,
        view_id: &str,
        changelog_name: &str,
        declaration: &SubscriptionDeclaration,
        schema: Option<&TableSchema>,
    ) -> Result<SubscriptionConfig> {
        let table = declaration.name.clone();
        checked_identifier(&declaration.entity_column)?;
        let entity_key_column = resolve_key_column(&table, &declaration.entity_column, schema)?;

        let model_name = declaration
            .subscription_model
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(ModelRegistry::DEFAULT);
        let model = self.models.get(model_name).ok_or_else(|| {
            MviewError::Configuration(format!(
                "view {view_id}: subscription model {model_name:?} is not registered"
            ))
        })?;

        let processor_name = declaration
            .processor
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(ProcessorRegistry::DEFAULT);
        let processor = self.processors.get(processor_name).ok_or_else(|| {
            MviewError::Configuration(format!(
                "view {view_id}: processor {processor_name:?} is not registered"
            ))
        })?;

        let updated_at_column = match &declaration.updated_at_column {
            Some(column) => {
                checked_identifier(column)?;
                if let Some(schema) = schema
                    && !schema.has_column(column)
                {
                    return Err(MviewError::Configuration(format!(
                        "view {view_id}: table {table} has no column {column}"
                    )));
                }
                Some(column.clone())
            }
            None => schema
                .filter(|s| s.has_column("updated_at"))
                .map(|_| "updated_at".to_string()),
        };

        for event in TriggerEvent::ALL {
            let trigger = trigger_name(&table, event, changelog_name);
            checked_identifier(&trigger_function_name(&trigger))?;
        }

        let mut additional_columns = Vec::with_capacity(declaration.additional_columns.len());
        for column in &declaration.additional_columns {
            checked_identifier(&column.name)?;
            let source = match (&column.constant, &column.cl_name) {
                (Some(constant), _) => ColumnSource::Constant(constant.clone()),
                (None, Some(expr)) => ColumnSource::Expression(checked_identifier(expr)?.to_string()),
                (None, None) => ColumnSource::Expression(column.name.clone()),
            };
            if let ColumnSource::Expression(expr) = &source
                && let Some(schema) = schema
                && !schema.has_column(expr)
            {
                return Err(MviewError::Configuration(format!(
                    "view {view_id}: additional column {} reads {table}.{expr}, which does not exist",
                    column.name
                )));
            }
            additional_columns.push(AdditionalColumn {
                name: column.name.clone(),
                source,
            });
        }

        Ok(SubscriptionConfig {
            source_table: table,
            entity_key_column,
            primary_key_column: schema.and_then(|s| s.primary_key()).map(str::to_string),
            changelog_name: changelog_name.to_string(),
            updated_at_column,
            additional_columns,
            model,
            processor,
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_grid(
    view_id: &str,
    declaration: &GridDeclaration,
    subscriptions: &[SubscriptionConfig],
    schemas: &HashMap<String, Option<TableSchema>>,
) -> Result<GridDefinition> {
    let table = checked_identifier(&declaration.table)?.to_string();
    let key_column = checked_identifier(&declaration.key_column)?.to_string();

    if subscriptions.iter().any(|s| s.source_table == table) {
        return Err(MviewError::Configuration(format!(
            "view {view_id}: grid table {table} can't also be a source"
        )));
    }

    let mut column_names = vec![key_column.clone()];
    let mut columns = Vec::with_capacity(declaration.columns.len());
    for (name, reference) in &declaration.columns {
        checked_identifier(name)?;
        let source = ColumnRef::parse(reference)?;
        if !subscriptions.iter().any(|s| s.source_table == source.table) {
            return Err(MviewError::Configuration(format!(
                "view {view_id}: column {name} reads {reference}, but {} is not subscribed",
                source.table
            )));
        }
        // Tables that don't exist yet are not checked.
        if let Some(Some(schema)) = schemas.get(&source.table)
            && !schema.has_column(&source.column)
        {
            return Err(MviewError::Configuration(format!(
                "view {view_id}: column {name} reads {reference}, which does not exist"
            )));
        }
        if *name != key_column {
            column_names.push(name.clone());
        }
        columns.push(GridColumn {
            name: name.clone(),
            source,
        });
    }

    for subscription in subscriptions {
        for column in &subscription.additional_columns {
            if column_names.contains(&column.name) {
                return Err(MviewError::Configuration(format!(
                    "view {view_id}: grid column {} is defined twice",
                    column.name
                )));
            }
            column_names.push(column.name.clone());
        }
    }

    Ok(GridDefinition {
        table,
        key_column,
        columns,
        column_names,
    })
}
