use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityKey, SequenceId};

/// One changelog record: "row `entity_key` changed".
///
/// Entries are ordered by `sequence_id`, which is unique within a
/// changelog. The same `entity_key` shows up once per mutation until a
/// refresh consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    /// Position of this entry in the changelog.
    pub sequence_id: SequenceId,

    /// Key of the changed source row.
    pub entity_key: EntityKey,

    /// Source transaction that produced the entry. Entries captured by the
    /// same transaction share it.
    pub version_id: i64,

    /// When the change was captured.
    pub recorded_at: DateTime<Utc>,
}

impl ChangelogEntry {
    /// Creates an entry captured now.
    pub fn new(sequence_id: SequenceId, entity_key: EntityKey, version_id: i64) -> Self {
        Self {
            sequence_id,
            entity_key,
            version_id,
            recorded_at: Utc::now(),
        }
    }
}

/// Returns the highest sequence id in `entries`, if any.
pub fn last_sequence(entries: &[ChangelogEntry]) -> Option<SequenceId> {
    entries.iter().map(|e| e.sequence_id).max()
}
