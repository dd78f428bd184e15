//! Change capture: binding source tables to changelogs.
//!
//! A [`SubscriptionModel`] decides which capture hooks a source table gets;
//! a [`TriggerHost`] (the database) installs them. Hooks run inside the
//! mutating transaction, so a committed write always has its changelog
//! entry.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::config::SubscriptionConfig;

/// Row mutation a capture hook reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerEvent {
    /// Records the key of the inserted row.
    Insert,
    /// Records the new key, and the old key too when the update changed it.
    Update,
    /// Records the key of the deleted row.
    Delete,
}

impl TriggerEvent {
    /// All events, in the order hooks are installed.
    pub const ALL: [TriggerEvent; 3] = [
        TriggerEvent::Insert,
        TriggerEvent::Update,
        TriggerEvent::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::Insert => "insert",
            TriggerEvent::Update => "update",
            TriggerEvent::Delete => "delete",
        }
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one capture hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSpec {
    pub name: String,
    pub table: String,
    pub event: TriggerEvent,
    pub changelog: String,
    pub key_column: String,
}

impl TriggerSpec {
    /// Builds the hook for `event` on the subscription's table.
    pub fn for_subscription(subscription: &SubscriptionConfig, event: TriggerEvent) -> Self {
        Self {
            name: trigger_name(
                &subscription.source_table,
                event,
                &subscription.changelog_name,
            ),
            table: subscription.source_table.clone(),
            event,
            changelog: subscription.changelog_name.clone(),
            key_column: subscription.entity_key_column.clone(),
        }
    }
}

/// Name of the hook capturing `event` on `table` into `changelog`.
///
/// Includes the changelog so several views can watch one table.
pub fn trigger_name(table: &str, event: TriggerEvent, changelog: &str) -> String {
    format!("trg_{table}_{event}_{changelog}")
}

/// Name of the database function behind the hook `trigger`.
pub fn trigger_function_name(trigger: &str) -> String {
    format!("{trigger}_fn")
}

/// A database that can install and remove capture hooks.
#[async_trait]
pub trait TriggerHost: Send + Sync {
    /// Installs `spec`, replacing a hook of the same name on the same table.
    async fn install_trigger(&self, spec: &TriggerSpec) -> Result<()>;

    /// Removes a hook. Removing a missing hook is not an error.
    async fn remove_trigger(&self, table: &str, name: &str) -> Result<()>;

    /// Names of the hooks currently installed on `table`.
    async fn trigger_names(&self, table: &str) -> Result<Vec<String>>;
}

/// Capability set every subscription model must provide.
#[async_trait]
pub trait SubscriptionModel: Send + Sync + Debug {
    /// Installs change capture for `subscription`. Must be idempotent.
    async fn attach(&self, host: &dyn TriggerHost, subscription: &SubscriptionConfig)
    -> Result<()>;

    /// Removes change capture for `subscription`. A no-op when detached.
    async fn detach(&self, host: &dyn TriggerHost, subscription: &SubscriptionConfig)
    -> Result<()>;
}

/// Captures inserts, updates and deletes with one hook each.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSubscription;

#[async_trait]
impl SubscriptionModel for DefaultSubscription {
    async fn attach(
        &self,
        host: &dyn TriggerHost,
        subscription: &SubscriptionConfig,
    ) -> Result<()> {
        for event in TriggerEvent::ALL {
            host.install_trigger(&TriggerSpec::for_subscription(subscription, event))
                .await?;
        }
        Ok(())
    }

    async fn detach(
        &self,
        host: &dyn TriggerHost,
        subscription: &SubscriptionConfig,
    ) -> Result<()> {
        for event in TriggerEvent::ALL {
            let name = trigger_name(
                &subscription.source_table,
                event,
                &subscription.changelog_name,
            );
            host.remove_trigger(&subscription.source_table, &name)
                .await?;
        }
        Ok(())
    }
}

/// Subscription models available to configuration, by name.
///
/// Only types implementing [`SubscriptionModel`] can be registered, so
/// a name that resolves is guaranteed to support attach and detach.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn SubscriptionModel>>,
}

impl ModelRegistry {
    /// Name under which [`DefaultSubscription`] is registered.
    pub const DEFAULT: &'static str = "default";

    /// Creates a registry holding only the default model.
    pub fn new() -> Self {
        let mut registry = Self {
            models: HashMap::new(),
        };
        registry.register(Self::DEFAULT, DefaultSubscription);
        registry
    }

    /// Registers a model under `name`, replacing any previous one.
    pub fn register<M: SubscriptionModel + 'static>(&mut self, name: impl Into<String>, model: M) {
        self.models.insert(name.into(), Arc::new(model));
    }

    /// Looks a model up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn SubscriptionModel>> {
        self.models.get(name).cloned()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured subscription bound to the database that hosts it.
pub struct Subscription<'a> {
    host: &'a dyn TriggerHost,
    config: &'a SubscriptionConfig,
}

impl<'a> Subscription<'a> {
    pub fn new(host: &'a dyn TriggerHost, config: &'a SubscriptionConfig) -> Self {
        Self { host, config }
    }

    /// Installs change capture through the configured model.
    #[tracing::instrument(skip(self), fields(table = %self.config.source_table, changelog = %self.config.changelog_name))]
    pub async fn subscribe(&self) -> Result<()> {
        self.config.model.attach(self.host, self.config).await?;
        tracing::debug!("subscription attached");
        Ok(())
    }

    /// Removes change capture. Safe to call when not subscribed.
    #[tracing::instrument(skip(self), fields(table = %self.config.source_table, changelog = %self.config.changelog_name))]
    pub async fn unsubscribe(&self) -> Result<()> {
        self.config.model.detach(self.host, self.config).await?;
        tracing::debug!("subscription detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_names_include_changelog() {
        let name = trigger_name("sales_order", TriggerEvent::Update, "sales_order_grid_cl");
        assert_eq!(name, "trg_sales_order_update_sales_order_grid_cl");
    }

    #[test]
    fn registry_starts_with_default_model() {
        let registry = ModelRegistry::new();
        assert!(registry.get(ModelRegistry::DEFAULT).is_some());
        assert!(registry.get("Vendor\\Custom\\Subscription").is_none());
    }

    #[derive(Debug)]
    struct NoopModel;

    #[async_trait]
    impl SubscriptionModel for NoopModel {
        async fn attach(&self, _: &dyn TriggerHost, _: &SubscriptionConfig) -> Result<()> {
            Ok(())
        }

        async fn detach(&self, _: &dyn TriggerHost, _: &SubscriptionConfig) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_accepts_custom_models() {
        let mut registry = ModelRegistry::new();
        registry.register("noop", NoopModel);
        assert!(registry.get("noop").is_some());
    }
}
