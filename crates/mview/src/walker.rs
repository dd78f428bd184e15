//! Batch walkers: bounded, restartable iteration over pending changelog entries.

use std::collections::HashSet;
use std::pin::Pin;

use changelog::{ChangeLog, ChangelogEntry, EntityKey, SequenceId};
use futures_core::Stream;
use futures_util::stream;

use crate::Result;

/// Batch size used when a view does not configure one.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// One unit of materialization work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogBatch {
    /// Position the batch starts after.
    pub after: SequenceId,

    /// Highest position covered by the batch. The checkpoint moves here
    /// once the batch is applied.
    pub last_sequence: SequenceId,

    /// Distinct keys, in order of first appearance.
    pub keys: Vec<EntityKey>,

    /// Number of changelog entries the batch was built from.
    pub entries: usize,
}

impl ChangelogBatch {
    fn from_entries(after: SequenceId, last_sequence: SequenceId, entries: &[ChangelogEntry]) -> Self {
        let mut seen = HashSet::with_capacity(entries.len());
        let keys = entries
            .iter()
            .map(|e| e.entity_key)
            .filter(|key| seen.insert(*key))
            .collect();
        Self {
            after,
            last_sequence,
            keys,
            entries: entries.len(),
        }
    }
}

/// A stream of batches.
pub type BatchStream<'a> = Pin<Box<dyn Stream<Item = Result<ChangelogBatch>> + Send + 'a>>;

/// How a view walks its changelog.
///
/// Walks stop at the changelog head observed when the walk starts, so a
/// busy writer can't keep a refresh running forever. Walking again from
/// the same checkpoint yields the same batches (plus anything appended
/// since).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkerKind {
    /// Reads up to `batch_size` entries per batch.
    Changelog { batch_size: usize },
    /// Reads fixed windows of `batch_size` sequence ids per batch. Windows
    /// that only cover gaps come back as empty batches.
    VersionRange { batch_size: usize },
}

impl WalkerKind {
    /// Name of the default walker.
    pub const DEFAULT: &'static str = "changelog";

    /// Resolves a walker by configuration name.
    pub fn from_name(name: &str, batch_size: usize) -> Option<Self> {
        match name {
            "changelog" => Some(WalkerKind::Changelog { batch_size }),
            "version_range" => Some(WalkerKind::VersionRange { batch_size }),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WalkerKind::Changelog { .. } => "changelog",
            WalkerKind::VersionRange { .. } => "version_range",
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            WalkerKind::Changelog { batch_size } | WalkerKind::VersionRange { batch_size } => {
                *batch_size
            }
        }
    }

    /// Walks `changelog` from `checkpoint` lazily, one batch per poll.
    pub fn walk<'a>(&self, changelog: &'a dyn ChangeLog, checkpoint: SequenceId) -> BatchStream<'a> {
        let kind = *self;
        // State: (cursor, head). The head is read on the first poll.
        let walk = stream::try_unfold((checkpoint, None), move |(cursor, head)| {
            next_batch(kind, changelog, cursor, head)
        });
        Box::pin(walk)
    }
}

type WalkState = (SequenceId, Option<SequenceId>);

async fn next_batch(
    kind: WalkerKind,
    changelog: &dyn ChangeLog,
    cursor: SequenceId,
    head: Option<SequenceId>,
) -> Result<Option<(ChangelogBatch, WalkState)>> {
    let head = match head {
        Some(head) => head,
        None => changelog.current_sequence().await?,
    };
    if cursor >= head {
        return Ok(None);
    }

    let batch_size = kind.batch_size().max(1);
    let batch = match kind {
        WalkerKind::Changelog { .. } => {
            let mut entries = changelog.entries_since(cursor, batch_size).await?;
            entries.retain(|e| e.sequence_id <= head);
            // Everything up to the head was pruned: jump to it.
            let last = entries.last().map_or(head, |e| e.sequence_id);
            ChangelogBatch::from_entries(cursor, last, &entries)
        }
        WalkerKind::VersionRange { .. } => {
            let window_end =
                SequenceId::new(cursor.as_i64().saturating_add(batch_size as i64)).min(head);
            let entries = changelog.entries_between(cursor, window_end).await?;
            ChangelogBatch::from_entries(cursor, window_end, &entries)
        }
    };

    let next = batch.last_sequence;
    Ok(Some((batch, (next, Some(head)))))
}

impl Default for WalkerKind {
    fn default() -> Self {
        WalkerKind::Changelog {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}
