use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single table row, column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Identifier of a changed source row as recorded in a changelog.
///
/// Wraps the integer key so entity keys can't be mixed up with
/// sequence ids, which share the same representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(i64);

impl EntityKey {
    /// Creates an entity key from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw key value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Extracts a key from a column value.
    ///
    /// Accepts JSON integers and strings holding an integer, since
    /// drivers disagree on how wide integer columns come back.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Self),
            serde_json::Value::String(s) => s.trim().parse().ok().map(Self),
            _ => None,
        }
    }

    /// Returns the key as a JSON value.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::from(self.0)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntityKey {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<EntityKey> for i64 {
    fn from(key: EntityKey) -> Self {
        key.0
    }
}

/// Position in a changelog.
///
/// Sequence ids start at 1 for the first entry; 0 means "nothing
/// processed yet" and is where every fresh checkpoint starts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceId(i64);

impl SequenceId {
    /// Creates a sequence id from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the position before the first entry.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next position.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw sequence value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SequenceId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<SequenceId> for i64 {
    fn from(id: SequenceId) -> Self {
        id.0
    }
}

/// Identity of one refresh worker, used as the owner of view locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Creates a new random worker id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
