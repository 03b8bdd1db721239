//! In-process backing store.
//!
//! Tables are insertion-ordered JSON objects. Every write emits a
//! [`ChangeNotification`] through the table's broadcast group, so any number
//! of stores can mirror the same table. The server hosts one of these; tests
//! use it directly, with fault switches to simulate outages.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use range_core::{ChangeKind, ChangeNotification, SortDirection};

use crate::backend::{Backend, BackendError, ChangeStream, QueryOptions, SubscriptionId};

/// Broadcast buffer per table.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

struct Table {
    rows: Vec<(String, Map<String, Value>)>,
    feed: broadcast::Sender<ChangeNotification>,
}

impl Table {
    fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity);
        Self {
            rows: Vec::new(),
            feed,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows.iter().position(|(row_id, _)| row_id == id)
    }
}

/// Backing store held entirely in memory.
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Table>>,
    subscriptions: RwLock<HashMap<SubscriptionId, String>>,
    feed_capacity: usize,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// `capacity` bounds how far a subscriber may fall behind before it lags.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            feed_capacity: capacity.max(1),
            sequence: AtomicU64::new(0),
            next_subscription: AtomicU64::new(1),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `query` fail with `Unavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail with `Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Drop every live change feed. Subscribers observe a closed stream.
    pub async fn disconnect_streams(&self) {
        let mut tables = self.tables.write().await;
        for table in tables.values_mut() {
            let (feed, _) = broadcast::channel(self.feed_capacity);
            table.feed = feed;
        }
        self.subscriptions.write().await.clear();
        log::info!("Dropped all change feeds");
    }

    /// Push a raw notification onto a table's feed without touching rows.
    ///
    /// Lets tests replay duplicates or out-of-order deliveries.
    pub async fn emit(&self, notification: ChangeNotification) -> usize {
        let mut tables = self.tables.write().await;
        let table = tables
            .entry(notification.table.clone())
            .or_insert_with(|| Table::new(self.feed_capacity));
        table.feed.send(notification).unwrap_or(0)
    }

    /// Number of rows currently stored in `table`.
    pub async fn row_count(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, |t| t.rows.len())
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_writes(&self) -> Result<(), BackendError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }

    fn publish(&self, table: &Table, name: &str, kind: ChangeKind, id: &str, record: Option<Value>) {
        let notification = ChangeNotification {
            table: name.to_string(),
            kind,
            id: id.to_string(),
            record,
            sequence: self.next_sequence(),
        };
        let receivers = table.feed.send(notification).unwrap_or(0);
        log::trace!("{kind:?} {name}/{id} fanned out to {receivers} subscribers");
    }

    async fn do_query(&self, table: &str, options: &QueryOptions) -> Result<Vec<Value>, BackendError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("reads disabled".into()));
        }
        let tables = self.tables.read().await;
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<&Map<String, Value>> = t.rows.iter().map(|(_, row)| row).collect();
        rows.sort_by(|a, b| {
            compare_field(a.get(&options.order_field), b.get(&options.order_field), options.direction)
        });
        if let Some(limit) = options.limit {
            rows.truncate(limit);
        }
        Ok(rows.into_iter().map(|row| Value::Object(row.clone())).collect())
    }

    async fn do_insert(&self, table: &str, payload: Value) -> Result<Value, BackendError> {
        self.check_writes()?;
        let Value::Object(mut row) = payload else {
            return Err(BackendError::InvalidPayload("record must be a JSON object".into()));
        };

        let id = match row.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Null) | None => Uuid::new_v4().to_string(),
            Some(Value::String(_)) => Uuid::new_v4().to_string(),
            Some(other) => {
                return Err(BackendError::InvalidPayload(format!("id must be a string, got {other}")))
            }
        };
        row.insert("id".into(), Value::String(id.clone()));
        row.entry("created_at")
            .or_insert_with(|| Value::String(range_core::now_millis().to_string()));

        let mut tables = self.tables.write().await;
        let t = tables
            .entry(table.to_string())
            .or_insert_with(|| Table::new(self.feed_capacity));
        if t.position(&id).is_some() {
            return Err(BackendError::Conflict { table: table.into(), id });
        }

        let stored = Value::Object(row.clone());
        t.rows.push((id.clone(), row));
        self.publish(t, table, ChangeKind::Insert, &id, Some(stored.clone()));
        Ok(stored)
    }

    async fn do_patch(&self, table: &str, id: &str, partial: Value) -> Result<Value, BackendError> {
        self.check_writes()?;
        let Value::Object(changes) = partial else {
            return Err(BackendError::InvalidPayload("patch must be a JSON object".into()));
        };

        let mut tables = self.tables.write().await;
        let not_found = || BackendError::NotFound { table: table.into(), id: id.into() };
        let t = tables.get_mut(table).ok_or_else(not_found)?;
        let pos = t.position(id).ok_or_else(not_found)?;

        let row = &mut t.rows[pos].1;
        for (key, value) in changes {
            // The key is immutable once assigned.
            if key != "id" {
                row.insert(key, value);
            }
        }
        let stored = Value::Object(row.clone());
        self.publish(t, table, ChangeKind::Update, id, Some(stored.clone()));
        Ok(stored)
    }

    async fn do_delete(&self, table: &str, id: &str) -> Result<(), BackendError> {
        self.check_writes()?;
        let mut tables = self.tables.write().await;
        let not_found = || BackendError::NotFound { table: table.into(), id: id.into() };
        let t = tables.get_mut(table).ok_or_else(not_found)?;
        let pos = t.position(id).ok_or_else(not_found)?;

        t.rows.remove(pos);
        self.publish(t, table, ChangeKind::Delete, id, None);
        Ok(())
    }

    async fn do_subscribe(&self, table: &str) -> Result<ChangeStream, BackendError> {
        let rx = {
            let mut tables = self.tables.write().await;
            tables
                .entry(table.to_string())
                .or_insert_with(|| Table::new(self.feed_capacity))
                .feed
                .subscribe()
        };
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.write().await.insert(id, table.to_string());
        log::debug!("Opened change feed {id} on {table}");
        Ok(ChangeStream::from_broadcast(id, table, rx))
    }
}

impl Backend for MemoryBackend {
    fn query<'a>(
        &'a self,
        table: &'a str,
        options: &'a QueryOptions,
    ) -> BoxFuture<'a, Result<Vec<Value>, BackendError>> {
        Box::pin(self.do_query(table, options))
    }

    fn insert<'a>(&'a self, table: &'a str, payload: Value) -> BoxFuture<'a, Result<Value, BackendError>> {
        Box::pin(self.do_insert(table, payload))
    }

    fn patch<'a>(
        &'a self,
        table: &'a str,
        id: &'a str,
        partial: Value,
    ) -> BoxFuture<'a, Result<Value, BackendError>> {
        Box::pin(self.do_patch(table, id, partial))
    }

    fn delete<'a>(&'a self, table: &'a str, id: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(self.do_delete(table, id))
    }

    fn subscribe<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<ChangeStream, BackendError>> {
        Box::pin(self.do_subscribe(table))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        // The receiver side is dropped by the caller; only bookkeeping here.
        if let Ok(mut subs) = self.subscriptions.try_write() {
            subs.remove(&id);
        }
    }
}

/// Order two JSON field values. Missing or null values always sort last.
fn compare_field(a: Option<&Value>, b: Option<&Value>, direction: SortDirection) -> CmpOrdering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => CmpOrdering::Equal,
        (None, Some(_)) => CmpOrdering::Greater,
        (Some(_), None) => CmpOrdering::Less,
        (Some(a), Some(b)) => {
            let ord = compare_values(a, b);
            match direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            }
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        // Mixed types: numbers, then strings, then everything else.
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(field: &str, direction: SortDirection, limit: Option<usize>) -> QueryOptions {
        QueryOptions {
            order_field: field.into(),
            direction,
            limit,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_id() {
        let backend = MemoryBackend::new();
        let stored = backend.insert("iocs", json!({"value": "1.2.3.4"})).await.unwrap();
        let id = stored["id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert!(stored.get("created_at").is_some());
        assert_eq!(backend.row_count("iocs").await, 1);
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates_and_non_objects() {
        let backend = MemoryBackend::new();
        backend.insert("iocs", json!({"id": "a"})).await.unwrap();
        assert!(matches!(
            backend.insert("iocs", json!({"id": "a"})).await,
            Err(BackendError::Conflict { .. })
        ));
        assert!(matches!(
            backend.insert("iocs", json!([1, 2])).await,
            Err(BackendError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_query_orders_and_limits() {
        let backend = MemoryBackend::new();
        for (id, score) in [("a", 3.0), ("b", 9.5), ("c", 1.0)] {
            backend.insert("network_assets", json!({"id": id, "risk_score": score})).await.unwrap();
        }
        backend.insert("network_assets", json!({"id": "d"})).await.unwrap();

        let rows = backend
            .query("network_assets", &opts("risk_score", SortDirection::Descending, None))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b", "a", "c", "d"]);

        let rows = backend
            .query("network_assets", &opts("risk_score", SortDirection::Ascending, Some(2)))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_query_unknown_table_is_empty() {
        let backend = MemoryBackend::new();
        let rows = backend
            .query("nope", &opts("id", SortDirection::Ascending, None))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_patch_merges_and_keeps_id() {
        let backend = MemoryBackend::new();
        backend.insert("investigations", json!({"id": "inv", "status": "open", "title": "x"})).await.unwrap();
        let stored = backend
            .patch("investigations", "inv", json!({"status": "closed", "id": "hijack"}))
            .await
            .unwrap();
        assert_eq!(stored["status"], "closed");
        assert_eq!(stored["title"], "x");
        assert_eq!(stored["id"], "inv");
    }

    #[tokio::test]
    async fn test_missing_records_not_found() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.patch("iocs", "ghost", json!({})).await,
            Err(BackendError::NotFound { .. })
        ));
        assert!(matches!(
            backend.delete("iocs", "ghost").await,
            Err(BackendError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_writes_emit_notifications_in_order() {
        let backend = MemoryBackend::new();
        let mut stream = backend.subscribe("iocs").await.unwrap();

        backend.insert("iocs", json!({"id": "a"})).await.unwrap();
        backend.patch("iocs", "a", json!({"active": true})).await.unwrap();
        backend.delete("iocs", "a").await.unwrap();

        let kinds = [
            stream.recv().await.unwrap(),
            stream.recv().await.unwrap(),
            stream.recv().await.unwrap(),
        ];
        assert_eq!(kinds[0].kind, ChangeKind::Insert);
        assert_eq!(kinds[1].kind, ChangeKind::Update);
        assert_eq!(kinds[1].record.as_ref().unwrap()["active"], true);
        assert_eq!(kinds[2].kind, ChangeKind::Delete);
        assert!(kinds[2].record.is_none());
        assert!(kinds[0].sequence < kinds[1].sequence && kinds[1].sequence < kinds[2].sequence);
    }

    #[tokio::test]
    async fn test_fault_switches() {
        let backend = MemoryBackend::new();
        backend.set_fail_writes(true);
        assert!(matches!(
            backend.insert("iocs", json!({})).await,
            Err(BackendError::Unavailable(_))
        ));
        backend.set_fail_writes(false);

        backend.set_fail_reads(true);
        assert!(backend
            .query("iocs", &opts("id", SortDirection::Ascending, None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_disconnect_closes_streams() {
        let backend = MemoryBackend::new();
        let mut stream = backend.subscribe("iocs").await.unwrap();
        assert_eq!(backend.active_subscriptions().await, 1);

        backend.disconnect_streams().await;
        assert_eq!(stream.recv().await, Err(crate::backend::StreamError::Closed));
        assert_eq!(backend.active_subscriptions().await, 0);
    }

    #[test]
    fn test_compare_field_missing_last() {
        let one = json!(1);
        assert_eq!(compare_field(None, Some(&one), SortDirection::Descending), CmpOrdering::Greater);
        assert_eq!(compare_field(Some(&one), None, SortDirection::Ascending), CmpOrdering::Less);
        let ts_a = json!("2024-01-01T00:00:00Z");
        let ts_b = json!("2024-06-01T00:00:00Z");
        assert_eq!(compare_field(Some(&ts_a), Some(&ts_b), SortDirection::Descending), CmpOrdering::Greater);
    }
}
