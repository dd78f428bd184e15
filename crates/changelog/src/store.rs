use async_trait::async_trait;

use crate::checkpoint::CheckpointStore;
use crate::{ChangelogEntry, EntityKey, Result, SequenceId};

/// Core trait for changelog implementations.
///
/// A changelog is an append-only ledger of changed row keys. Sequence ids
/// are allocated in commit order, so a reader that has seen everything up
/// to `n` never finds a late entry below `n`.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Returns the name of this changelog.
    fn name(&self) -> &str;

    /// Creates the ledger if it does not exist yet.
    async fn create(&self) -> Result<()>;

    /// Removes the ledger and all of its entries. Removing a missing
    /// ledger is not an error.
    async fn remove(&self) -> Result<()>;

    /// Returns true if the ledger has been created.
    async fn exists(&self) -> Result<bool>;

    /// Appends one entry and returns its sequence id.
    ///
    /// Concurrent appends never receive the same sequence id.
    async fn append(&self, entity_key: EntityKey) -> Result<SequenceId>;

    /// Returns up to `limit` entries with a sequence id greater than `after`,
    /// oldest first.
    async fn entries_since(&self, after: SequenceId, limit: usize)
    -> Result<Vec<ChangelogEntry>>;

    /// Returns the entries in `(after, up_to]`, oldest first.
    async fn entries_between(
        &self,
        after: SequenceId,
        up_to: SequenceId,
    ) -> Result<Vec<ChangelogEntry>>;

    /// Returns the highest sequence id ever allocated.
    ///
    /// Returns `SequenceId::initial()` for an empty ledger. Pruning does
    /// not move the head back.
    async fn current_sequence(&self) -> Result<SequenceId>;

    /// Deletes entries with a sequence id strictly below `below`.
    ///
    /// Returns the number of deleted entries.
    async fn prune(&self, below: SequenceId) -> Result<u64>;
}

/// Extension trait providing convenience methods for changelogs.
#[async_trait]
pub trait ChangeLogExt: ChangeLog {
    /// Appends several keys, returning the last sequence id allocated.
    async fn append_all(&self, keys: &[EntityKey]) -> Result<Option<SequenceId>> {
        let mut last = None;
        for key in keys {
            last = Some(self.append(*key).await?);
        }
        Ok(last)
    }

    /// Checks whether any entry lies beyond `checkpoint`.
    async fn has_pending(&self, checkpoint: SequenceId) -> Result<bool> {
        Ok(self.current_sequence().await? > checkpoint)
    }

    /// Prunes everything the given subscribers have already consumed.
    ///
    /// The cut-off is the lowest checkpoint among `subscribers`; a
    /// subscriber without a checkpoint pins the whole ledger.
    async fn prune_consumed(
        &self,
        checkpoints: &dyn CheckpointStore,
        subscribers: &[String],
    ) -> Result<u64> {
        let mut floor: Option<SequenceId> = None;
        for subscriber in subscribers {
            let position = checkpoints
                .load(subscriber)
                .await?
                .map(|c| c.last_processed_sequence_id)
                .unwrap_or_else(SequenceId::initial);
            floor = Some(floor.map_or(position, |f| f.min(position)));
        }

        let Some(floor) = floor else {
            return Ok(0);
        };
        if floor == SequenceId::initial() {
            return Ok(0);
        }

        let pruned = self.prune(floor).await?;
        if pruned > 0 {
            tracing::debug!(changelog = self.name(), below = %floor, pruned, "pruned changelog");
        }
        Ok(pruned)
    }
}

// Blanket implementation for all ChangeLog implementations
impl<T: ChangeLog + ?Sized> ChangeLogExt for T {}
