//! Local mirror of one collection and the rules for folding changes into it.
//!
//! Invariants:
//! - at most one row per id; the last applied version wins
//! - newest inserts first; when over the limit the tail (oldest) is evicted
//! - an Update for an unknown id is dropped, never turned into a row
//! - an Insert for an id already deleted, or already evicted by the limit,
//!   is ignored
//! - `version` only moves when the rows actually change

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use range_core::{ChangeKind, ChangeNotification, SyncRecord};

use crate::store::StoreError;

/// Deleted or evicted ids remembered to reject late duplicate Inserts.
const TOMBSTONE_CAPACITY: usize = 1024;

/// A change notification decoded into the collection's record type.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange<T> {
    Insert(T),
    Update(T),
    Delete(String),
}

impl<T: SyncRecord> RecordChange<T> {
    pub fn decode(notification: &ChangeNotification) -> Result<Self, StoreError> {
        let record = || -> Result<T, StoreError> {
            let value = notification.record.clone().ok_or_else(|| StoreError::Decode {
                table: notification.table.clone(),
                reason: format!("{:?} for {} carries no record", notification.kind, notification.id),
            })?;
            decode_record(&notification.table, value)
        };
        Ok(match notification.kind {
            ChangeKind::Insert => RecordChange::Insert(record()?),
            ChangeKind::Update => RecordChange::Update(record()?),
            ChangeKind::Delete => RecordChange::Delete(notification.id.clone()),
        })
    }
}

pub(crate) fn decode_record<T: SyncRecord>(table: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode {
        table: table.to_string(),
        reason: e.to_string(),
    })
}

/// Bounded set of recently dropped ids, oldest forgotten first.
#[derive(Debug, Default)]
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl Tombstones {
    fn insert(&mut self, id: &str) {
        if self.ids.insert(id.to_string()) {
            self.order.push_back(id.to_string());
            while self.order.len() > TOMBSTONE_CAPACITY {
                if let Some(old) = self.order.pop_front() {
                    self.ids.remove(&old);
                }
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn remove(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|old| old != id);
        }
    }

    fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.order.retain(|id| keep(id.as_str()));
        self.ids.retain(|id| keep(id.as_str()));
    }
}

/// Ordered, deduplicated, optionally bounded record cache.
///
/// Rows are kept newest first: each new Insert goes to the front and the
/// oldest row falls off the back once `limit` is exceeded. Inserting A, B, C
/// with a limit of 2 leaves `[C, B]`.
#[derive(Debug)]
pub struct CollectionCache<T> {
    rows: Arc<Vec<T>>,
    limit: Option<usize>,
    tombstones: Tombstones,
    evicted: Tombstones,
    version: u64,
}

impl<T: SyncRecord> CollectionCache<T> {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            rows: Arc::new(Vec::new()),
            limit,
            tombstones: Tombstones::default(),
            evicted: Tombstones::default(),
            version: 0,
        }
    }

    /// Current rows. The `Arc` is replaced, not mutated, while anyone holds it.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.rows)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.rows.iter().find(|r| r.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows.iter().position(|r| r.id() == id)
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    /// Fold one change in. Returns whether the rows changed.
    pub fn apply(&mut self, change: RecordChange<T>) -> bool {
        match change {
            RecordChange::Insert(record) => self.insert(record),
            RecordChange::Update(record) => self.replace(record),
            RecordChange::Delete(id) => self.remove(&id),
        }
    }

    /// Insert or replace in place. Deleted and evicted ids stay out.
    pub fn insert(&mut self, record: T) -> bool {
        self.upsert(record, false)
    }

    fn upsert(&mut self, record: T, replaying: bool) -> bool {
        if self.tombstones.contains(record.id()) {
            log::trace!("Ignoring insert of deleted record {}", record.id());
            return false;
        }
        if let Some(pos) = self.position(record.id()) {
            Arc::make_mut(&mut self.rows)[pos] = record;
            self.bump();
            return true;
        }
        // A duplicate of an Insert that has since aged out of the window.
        if !replaying && self.evicted.contains(record.id()) {
            log::trace!("Ignoring insert of evicted record {}", record.id());
            return false;
        }

        self.evicted.remove(record.id());
        let rows = Arc::make_mut(&mut self.rows);
        rows.insert(0, record);
        if let Some(limit) = self.limit {
            let keep = limit.min(rows.len());
            for dropped in rows.drain(keep..) {
                self.evicted.insert(dropped.id());
            }
        }
        self.bump();
        true
    }

    /// Replace the row with the same id, keeping its position.
    pub fn replace(&mut self, record: T) -> bool {
        match self.position(record.id()) {
            Some(pos) => {
                Arc::make_mut(&mut self.rows)[pos] = record;
                self.bump();
                true
            }
            None => {
                log::trace!("Dropping update for unknown record {}", record.id());
                false
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.tombstones.insert(id);
        match self.position(id) {
            Some(pos) => {
                Arc::make_mut(&mut self.rows).remove(pos);
                self.bump();
                true
            }
            None => false,
        }
    }

    /// Swap in an authoritative bulk read. Keeps the first row per id and
    /// trims to the limit. Returns the retained row count.
    pub fn replace_all(&mut self, records: Vec<T>) -> usize {
        let mut seen = HashSet::new();
        let mut rows: Vec<T> = records
            .into_iter()
            .filter(|r| seen.insert(r.id().to_string()))
            .collect();
        if let Some(limit) = self.limit {
            let keep = limit.min(rows.len());
            for dropped in rows.drain(keep..) {
                self.evicted.insert(dropped.id());
            }
        }
        self.tombstones.retain(|id| !seen.contains(id));
        self.evicted.retain(|id| !rows.iter().any(|r| r.id() == id));
        self.rows = Arc::new(rows);
        self.bump();
        self.rows.len()
    }

    /// Swap in a bulk read, then replay, in delivery order, the changes the
    /// feed delivered after the read was issued. Rows evicted earlier in the
    /// replay may come back when a later replayed Insert pushes them out
    /// again, so the window ends where sequential delivery would leave it.
    /// Returns the final row count.
    pub fn rebase(&mut self, records: Vec<T>, replay: &[RecordChange<T>]) -> usize {
        self.replace_all(records);
        for change in replay {
            match change.clone() {
                RecordChange::Insert(record) => self.upsert(record, true),
                RecordChange::Update(record) => self.replace(record),
                RecordChange::Delete(id) => self.remove(&id),
            };
        }
        self.rows.len()
    }

    /// Forget everything, tombstones included.
    pub fn clear(&mut self) {
        self.tombstones = Tombstones::default();
        self.evicted = Tombstones::default();
        if !self.rows.is_empty() {
            self.rows = Arc::new(Vec::new());
            self.bump();
        }
    }
}
