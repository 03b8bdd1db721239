//! Change notifications emitted by the backing store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One entry of a collection's change feed.
///
/// Insert/Update carry the full new record; Delete carries only the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: String,
    pub kind: ChangeKind,
    pub id: String,
    pub record: Option<Value>,
    /// Emission counter of the backing store. Informational only.
    pub sequence: u64,
}

impl ChangeNotification {
    pub fn insert(table: impl Into<String>, id: impl Into<String>, record: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            id: id.into(),
            record: Some(record),
            sequence: 0,
        }
    }

    pub fn update(table: impl Into<String>, id: impl Into<String>, record: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            id: id.into(),
            record: Some(record),
            sequence: 0,
        }
    }

    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            id: id.into(),
            record: None,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}
