use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, SequenceId};

/// The last changelog position a subscriber has fully materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The subscriber (view) this checkpoint belongs to.
    pub subscriber_id: String,

    /// Highest sequence id whose effects are committed in the grid.
    pub last_processed_sequence_id: SequenceId,

    /// When the checkpoint last moved.
    pub last_processed_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint at `sequence`, stamped now.
    pub fn new(subscriber_id: impl Into<String>, sequence: SequenceId) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            last_processed_sequence_id: sequence,
            last_processed_at: Utc::now(),
        }
    }

    /// Creates the checkpoint a subscriber starts from before its first refresh.
    pub fn initial(subscriber_id: impl Into<String>) -> Self {
        Self::new(subscriber_id, SequenceId::initial())
    }
}

/// Durable storage for subscriber checkpoints.
///
/// Checkpoints only ever move forward, and only through a conditional
/// update, so two workers that read the same position can't both advance
/// past it.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint of a subscriber.
    ///
    /// Returns None if the subscriber never completed a refresh.
    async fn load(&self, subscriber_id: &str) -> Result<Option<Checkpoint>>;

    /// Moves a checkpoint from `expected` to `to`.
    ///
    /// Fails with `CheckpointConflict` if the stored position is not
    /// `expected` (a missing checkpoint counts as `SequenceId::initial()`),
    /// and with `CheckpointRegression` if `to` is below `expected`.
    async fn advance(
        &self,
        subscriber_id: &str,
        expected: SequenceId,
        to: SequenceId,
    ) -> Result<Checkpoint>;

    /// Deletes the checkpoint of a subscriber. Deleting a missing
    /// checkpoint is not an error.
    async fn remove(&self, subscriber_id: &str) -> Result<()>;

    /// Returns every stored checkpoint, ordered by subscriber id.
    async fn list(&self) -> Result<Vec<Checkpoint>>;
}

/// Extension trait providing convenience methods for checkpoint stores.
#[async_trait]
pub trait CheckpointStoreExt: CheckpointStore {
    /// Loads a checkpoint, falling back to the initial position.
    async fn load_or_initial(&self, subscriber_id: &str) -> Result<Checkpoint> {
        Ok(self
            .load(subscriber_id)
            .await?
            .unwrap_or_else(|| Checkpoint::initial(subscriber_id)))
    }

    /// Returns the current position of a subscriber.
    async fn position(&self, subscriber_id: &str) -> Result<SequenceId> {
        Ok(self.load_or_initial(subscriber_id).await?.last_processed_sequence_id)
    }
}

impl<T: CheckpointStore + ?Sized> CheckpointStoreExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_checkpoint_is_at_zero() {
        let checkpoint = Checkpoint::initial("sales_order_grid");
        assert_eq!(checkpoint.subscriber_id, "sales_order_grid");
        assert_eq!(checkpoint.last_processed_sequence_id, SequenceId::initial());
    }

    #[test]
    fn checkpoint_serialization_roundtrip() {
        let checkpoint = Checkpoint::new("grid", SequenceId::new(12));
        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
