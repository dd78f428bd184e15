use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    ChangelogEntry, ChangelogError, EntityKey, Result, SequenceId,
    checkpoint::{Checkpoint, CheckpointStore},
    store::ChangeLog,
};

#[derive(Default)]
struct Ledger {
    created: bool,
    entries: Vec<ChangelogEntry>,
    head: SequenceId,
    last_version: i64,
}

impl Ledger {
    fn push(&mut self, key: EntityKey, version_id: i64) -> SequenceId {
        self.head = self.head.next();
        self.entries.push(ChangelogEntry::new(self.head, key, version_id));
        self.head
    }
}

/// In-memory changelog implementation for testing.
///
/// Clones share the same ledger, so a clone handed to a capture hook
/// and a clone held by a view see the same entries.
#[derive(Clone)]
pub struct InMemoryChangeLog {
    name: Arc<str>,
    ledger: Arc<RwLock<Ledger>>,
}

impl InMemoryChangeLog {
    /// Creates a handle to a changelog that does not exist yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            ledger: Arc::new(RwLock::new(Ledger::default())),
        }
    }

    /// Appends the keys captured by one source transaction.
    ///
    /// All entries share one `version_id`. Returns the last sequence id
    /// allocated, or None when `keys` is empty.
    pub async fn append_captured(&self, keys: &[EntityKey]) -> Result<Option<SequenceId>> {
        if keys.is_empty() {
            return Ok(None);
        }

        let mut ledger = self.ledger.write().await;
        if !ledger.created {
            return Err(ChangelogError::ChangelogNotFound(self.name.to_string()));
        }

        ledger.last_version += 1;
        let version_id = ledger.last_version;
        let mut last = None;
        for key in keys {
            last = Some(ledger.push(*key, version_id));
        }
        metrics::counter!("mview_changelog_appends").increment(keys.len() as u64);
        Ok(last)
    }

    /// Returns the number of entries currently stored.
    pub async fn entry_count(&self) -> usize {
        self.ledger.read().await.entries.len()
    }
}

#[async_trait]
impl ChangeLog for InMemoryChangeLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self) -> Result<()> {
        self.ledger.write().await.created = true;
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        *ledger = Ledger::default();
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.ledger.read().await.created)
    }

    async fn append(&self, entity_key: EntityKey) -> Result<SequenceId> {
        self.append_captured(&[entity_key])
            .await?
            .ok_or_else(|| ChangelogError::ChangelogNotFound(self.name.to_string()))
    }

    async fn entries_since(
        &self,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<ChangelogEntry>> {
        let ledger = self.ledger.read().await;
        if !ledger.created {
            return Err(ChangelogError::ChangelogNotFound(self.name.to_string()));
        }
        // Entries are pushed in sequence order, so the slice is already sorted.
        let start = ledger.entries.partition_point(|e| e.sequence_id <= after);
        Ok(ledger.entries[start..].iter().take(limit).cloned().collect())
    }

    async fn entries_between(
        &self,
        after: SequenceId,
        up_to: SequenceId,
    ) -> Result<Vec<ChangelogEntry>> {
        let ledger = self.ledger.read().await;
        if !ledger.created {
            return Err(ChangelogError::ChangelogNotFound(self.name.to_string()));
        }
        Ok(ledger
            .entries
            .iter()
            .filter(|e| e.sequence_id > after && e.sequence_id <= up_to)
            .cloned()
            .collect())
    }

    async fn current_sequence(&self) -> Result<SequenceId> {
        let ledger = self.ledger.read().await;
        if !ledger.created {
            return Err(ChangelogError::ChangelogNotFound(self.name.to_string()));
        }
        Ok(ledger.head)
    }

    async fn prune(&self, below: SequenceId) -> Result<u64> {
        let mut ledger = self.ledger.write().await;
        let before = ledger.entries.len();
        ledger.entries.retain(|e| e.sequence_id >= below);
        Ok((before - ledger.entries.len()) as u64)
    }
}

/// In-memory checkpoint store implementation for testing.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<BTreeMap<String, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Creates a new empty checkpoint store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, subscriber_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(subscriber_id).cloned())
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

        let mut checkpoints = self.checkpoints.write().await;
        let actual = checkpoints
            .get(subscriber_id)
            .map(|c| c.last_processed_sequence_id)
            .unwrap_or_else(SequenceId::initial);

        if actual != expected {
            return Err(ChangelogError::CheckpointConflict {
                subscriber: subscriber_id.to_string(),
                expected,
                actual,
            });
        }

        let checkpoint = Checkpoint {
            subscriber_id: subscriber_id.to_string(),
            last_processed_sequence_id: to,
            last_processed_at: Utc::now(),
        };
        checkpoints.insert(subscriber_id.to_string(), checkpoint.clone());
        Ok(checkpoint)
    }

    async fn remove(&self, subscriber_id: &str) -> Result<()> {
        self.checkpoints.write().await.remove(subscriber_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.checkpoints.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStoreExt;
    use crate::store::ChangeLogExt;

    async fn created_log(name: &str) -> InMemoryChangeLog {
        let log = InMemoryChangeLog::new(name);
        log.create().await.unwrap();
        log
    }

    #[tokio::test]
    async fn append_allocates_increasing_sequence_ids() {
        let log = created_log("orders_cl").await;

        let first = log.append(EntityKey::new(10)).await.unwrap();
        let second = log.append(EntityKey::new(10)).await.unwrap();
        let third = log.append(EntityKey::new(11)).await.unwrap();

        assert_eq!(first, SequenceId::new(1));
        assert_eq!(second, SequenceId::new(2));
        assert_eq!(third, SequenceId::new(3));
        assert_eq!(log.current_sequence().await.unwrap(), SequenceId::new(3));
    }

    #[tokio::test]
    async fn append_to_missing_changelog_fails() {
        let log = InMemoryChangeLog::new("missing_cl");
        let result = log.append(EntityKey::new(1)).await;
        assert!(matches!(result, Err(ChangelogError::ChangelogNotFound(_))));
    }

    #[tokio::test]
    async fn concurrent_appends_never_share_a_sequence() {
        let log = created_log("concurrent_cl").await;

        let mut handles = Vec::new();
        for worker in 0..8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..50 {
                    ids.push(log.append(EntityKey::new(worker * 100 + i)).await.unwrap());
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(log.current_sequence().await.unwrap(), SequenceId::new(400));
    }

    #[tokio::test]
    async fn captured_keys_share_version() {
        let log = created_log("tx_cl").await;
        log.append_captured(&[EntityKey::new(1), EntityKey::new(2)])
            .await
            .unwrap();
        log.append(EntityKey::new(3)).await.unwrap();

        let entries = log.entries_since(SequenceId::initial(), 10).await.unwrap();
        assert_eq!(entries[0].version_id, entries[1].version_id);
        assert_ne!(entries[1].version_id, entries[2].version_id);
    }

    #[tokio::test]
    async fn entries_since_is_exclusive_and_limited() {
        let log = created_log("since_cl").await;
        for key in 1..=5 {
            log.append(EntityKey::new(key)).await.unwrap();
        }

        let entries = log.entries_since(SequenceId::new(2), 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence_id, SequenceId::new(3));
        assert_eq!(entries[1].sequence_id, SequenceId::new(4));

        let between = log
            .entries_between(SequenceId::new(3), SequenceId::new(5))
            .await
            .unwrap();
        let keys: Vec<_> = between.iter().map(|e| e.entity_key.as_i64()).collect();
        assert_eq!(keys, vec![4, 5]);
    }

    #[tokio::test]
    async fn prune_keeps_head_and_later_entries() {
        let log = created_log("prune_cl").await;
        for key in 1..=4 {
            log.append(EntityKey::new(key)).await.unwrap();
        }

        let pruned = log.prune(SequenceId::new(3)).await.unwrap();
        assert_eq!(pruned, 2);
        assert_eq!(log.entry_count().await, 2);
        assert_eq!(log.current_sequence().await.unwrap(), SequenceId::new(4));

        let next = log.append(EntityKey::new(9)).await.unwrap();
        assert_eq!(next, SequenceId::new(5));
    }

    #[tokio::test]
    async fn prune_consumed_respects_slowest_subscriber() {
        let log = created_log("shared_cl").await;
        for key in 1..=6 {
            log.append(EntityKey::new(key)).await.unwrap();
        }

        let checkpoints = InMemoryCheckpointStore::new();
        checkpoints
            .advance("fast", SequenceId::initial(), SequenceId::new(6))
            .await
            .unwrap();
        checkpoints
            .advance("slow", SequenceId::initial(), SequenceId::new(2))
            .await
            .unwrap();

        let subscribers = vec!["fast".to_string(), "slow".to_string()];
        let pruned = log.prune_consumed(&checkpoints, &subscribers).await.unwrap();
        assert_eq!(pruned, 1);

        let remaining = log.entries_since(SequenceId::new(2), 10).await.unwrap();
        assert_eq!(remaining.len(), 4);
    }

    #[tokio::test]
    async fn prune_consumed_without_checkpoint_keeps_everything() {
        let log = created_log("fresh_cl").await;
        log.append(EntityKey::new(1)).await.unwrap();

        let checkpoints = InMemoryCheckpointStore::new();
        let pruned = log
            .prune_consumed(&checkpoints, &["never_refreshed".to_string()])
            .await
            .unwrap();
        assert_eq!(pruned, 0);
        assert_eq!(log.entry_count().await, 1);
    }

    #[tokio::test]
    async fn checkpoint_advances_conditionally() {
        let store = InMemoryCheckpointStore::new();

        let first = store
            .advance("grid", SequenceId::initial(), SequenceId::new(5))
            .await
            .unwrap();
        assert_eq!(first.last_processed_sequence_id, SequenceId::new(5));

        let stale = store
            .advance("grid", SequenceId::initial(), SequenceId::new(7))
            .await;
        assert!(matches!(
            stale,
            Err(ChangelogError::CheckpointConflict { actual, .. }) if actual == SequenceId::new(5)
        ));

        assert_eq!(store.position("grid").await.unwrap(), SequenceId::new(5));
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backwards() {
        let store = InMemoryCheckpointStore::new();
        store
            .advance("grid", SequenceId::initial(), SequenceId::new(5))
            .await
            .unwrap();

        let result = store
            .advance("grid", SequenceId::new(5), SequenceId::new(3))
            .await;
        assert!(matches!(
            result,
            Err(ChangelogError::CheckpointRegression { .. })
        ));
        assert_eq!(store.position("grid").await.unwrap(), SequenceId::new(5));
    }

    #[tokio::test]
    async fn checkpoint_remove_is_idempotent() {
        let store = InMemoryCheckpointStore::new();
        store.remove("nobody").await.unwrap();

        store
            .advance("grid", SequenceId::initial(), SequenceId::new(1))
            .await
            .unwrap();
        store.remove("grid").await.unwrap();
        assert!(store.load("grid").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }
}
