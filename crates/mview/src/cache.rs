//! Last-update-time cache.
//!
//! Remembers, per table, the newest `updated_at` seen by the last
//! successful refresh. A refresh that finds every watched table unchanged
//! and no pending changelog entries is skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

/// Process-wide map from cache key to last known `updated_at`.
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct LastUpdateTimeCache {
    entries: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl LastUpdateTimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        // The map holds plain values; a panic elsewhere can't leave it torn.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries().get(key).copied()
    }

    pub fn set(&self, key: impl Into<String>, value: DateTime<Utc>) {
        self.entries().insert(key.into(), value);
    }

    /// Forgets `key`. The next refresh of the owning view can't skip.
    pub fn remove(&self, key: &str) {
        self.entries().remove(key);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Cache key for `source_table` as watched by the view writing `grid_table`.
///
/// The main table is stored under the grid table name, joined tables
/// under `grid.source`.
pub fn cache_key(grid_table: &str, source_table: &str, is_main: bool) -> String {
    if is_main {
        grid_table.to_string()
    } else {
        format!("{grid_table}.{source_table}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn set_get_remove() {
        let cache = LastUpdateTimeCache::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        assert_eq!(cache.get("sales_order_grid"), None);
        cache.set("sales_order_grid", t0);
        assert_eq!(cache.get("sales_order_grid"), Some(t0));
        cache.set("sales_order_grid", t1);
        assert_eq!(cache.get("sales_order_grid"), Some(t1));

        cache.remove("sales_order_grid");
        assert_eq!(cache.get("sales_order_grid"), None);
    }

    #[test]
    fn clones_share_entries() {
        let cache = LastUpdateTimeCache::new();
        let other = cache.clone();
        other.set("grid", Utc::now());
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn keys_separate_main_and_joined_tables() {
        assert_eq!(cache_key("sales_order_grid", "sales_order", true), "sales_order_grid");
        assert_eq!(
            cache_key("sales_order_grid", "sales_order_address", false),
            "sales_order_grid.sales_order_address"
        );
    }
}
