//! Generic collection sync store.
//!
//! One instance mirrors one table. Lifecycle:
//!
//! ```text
//!  new() ──► subscribe() ──► initialize() ──► ... ──► teardown()/close()
//!               │                 │
//!               ▼                 ▼
//!        pump task applies   bulk read fills the
//!        Insert/Update/Delete  cache, loaded = true
//!               │
//!        stream closed ──► backoff ──► resubscribe ──► full resync
//! ```
//!
//! All mutation paths take the state write lock and check `closed` first,
//! so nothing touches the cache once `close()` has returned.
//!
//! While a bulk read is in flight every change applied to the cache is also
//! journaled. When the read lands, its rows replace the cache and the journal
//! is replayed on top, so a change delivered during the read is never lost
//! to the older result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use range_core::{CollectionConfig, SyncRecord};

use crate::backend::{Backend, BackendError, ChangeStream, QueryOptions, StreamError, SubscriptionId};
use crate::cache::{decode_record, CollectionCache, RecordChange};

/// Errors returned by store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to decode {table} record: {reason}")]
    Decode { table: String, reason: String },

    #[error("failed to encode {table} payload: {reason}")]
    Encode { table: String, reason: String },

    #[error("change stream for {table} is stale: {reason}")]
    Stale { table: String, reason: String },

    #[error("store is closed")]
    Closed,
}

/// Health of the change feed behind a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Never subscribed.
    Idle,
    Live,
    /// Feed dropped; backing off before resubscribing.
    Reconnecting,
    /// Gave up reconnecting. The cache is no longer kept current.
    Stale,
    Closed,
}

/// Backoff schedule for resubscribing after a dropped feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Store tuning.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub reconnect: ReconnectPolicy,
}

/// Proof of an open subscription, handed back to [`CollectionStore::teardown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    table: String,
    token: u64,
}

impl SubscriptionHandle {
    pub fn table(&self) -> &str {
        &self.table
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

struct StoreState<T> {
    cache: CollectionCache<T>,
    loaded: bool,
    last_error: Option<StoreError>,
    stream: StreamState,
    closed: bool,
    token: Option<u64>,
    subscription: Option<SubscriptionId>,
    pump: Option<JoinHandle<()>>,
    /// Bulk reads in flight.
    fetches: usize,
    /// Changes applied since the oldest in-flight read began.
    journal: Vec<RecordChange<T>>,
}

impl<T: SyncRecord> StoreState<T> {
    fn apply(&mut self, change: RecordChange<T>) -> bool {
        if self.fetches > 0 {
            self.journal.push(change.clone());
        }
        self.cache.apply(change)
    }

    /// Register a bulk read. Returns its offset into the journal.
    fn begin_fetch(&mut self) -> usize {
        self.fetches += 1;
        self.journal.len()
    }

    /// Land the rows of a read begun at `base`.
    fn rebase(&mut self, base: usize, records: Vec<T>) -> usize {
        let replay = self.journal.get(base..).unwrap_or_default();
        self.cache.rebase(records, replay)
    }

    fn end_fetch(&mut self) {
        self.fetches = self.fetches.saturating_sub(1);
        if self.fetches == 0 {
            self.journal.clear();
        }
    }
}

struct Shared<T> {
    backend: Arc<dyn Backend>,
    config: CollectionConfig,
    options: StoreOptions,
    state: RwLock<StoreState<T>>,
    version_tx: watch::Sender<u64>,
}

/// Eventually consistent local mirror of one remote collection.
pub struct CollectionStore<T: SyncRecord> {
    shared: Arc<Shared<T>>,
}

impl<T: SyncRecord> Clone for CollectionStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: SyncRecord> CollectionStore<T> {
    pub fn new(backend: Arc<dyn Backend>, config: CollectionConfig, options: StoreOptions) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                backend,
                state: RwLock::new(StoreState {
                    cache: CollectionCache::new(config.limit),
                    loaded: false,
                    last_error: None,
                    stream: StreamState::Idle,
                    closed: false,
                    token: None,
                    subscription: None,
                    pump: None,
                    fetches: 0,
                    journal: Vec::new(),
                }),
                config,
                options,
                version_tx,
            }),
        }
    }

    /// Store with `T`'s default ordering and retention.
    pub fn with_defaults(backend: Arc<dyn Backend>) -> Self {
        Self::new(backend, T::collection_config(), StoreOptions::default())
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.shared.config
    }

    pub fn table(&self) -> &str {
        &self.shared.config.table
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// One bulk read into the cache.
    ///
    /// `loaded` becomes true whatever the outcome. On failure the cache is
    /// left empty and the error is kept in [`last_error`](Self::last_error).
    pub async fn initialize(&self) -> Result<usize, StoreError> {
        let base = {
            let mut state = self.shared.state.write().await;
            if state.closed {
                return Err(StoreError::Closed);
            }
            state.begin_fetch()
        };
        let fetched = self.shared.fetch().await;
        let mut state = self.shared.state.write().await;
        if state.closed {
            state.end_fetch();
            return Err(StoreError::Closed);
        }

        let outcome = match fetched {
            Ok(records) => {
                let count = state.rebase(base, records);
                state.last_error = None;
                log::info!("Loaded {count} {} records", self.table());
                Ok(count)
            }
            Err(e) => {
                log::warn!("Initial load of {} failed: {e}", self.table());
                state.last_error = Some(e.clone());
                Err(e)
            }
        };
        state.end_fetch();
        state.loaded = true;
        self.shared.publish(&state);
        outcome
    }

    /// Open the change feed and start applying notifications.
    ///
    /// Subscribing twice returns the handle of the live subscription.
    pub async fn subscribe(&self) -> Result<SubscriptionHandle, StoreError> {
        {
            let state = self.shared.state.read().await;
            if state.closed {
                return Err(StoreError::Closed);
            }
            if let Some(token) = state.token {
                return Ok(self.handle(token));
            }
        }

        let stream = self.shared.backend.subscribe(self.table()).await?;

        let mut state = self.shared.state.write().await;
        if state.closed || state.token.is_some() {
            // Lost a race with close() or another subscribe().
            self.shared.backend.unsubscribe(stream.id());
            return match state.token {
                Some(token) if !state.closed => Ok(self.handle(token)),
                _ => Err(StoreError::Closed),
            };
        }

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        state.token = Some(token);
        state.subscription = Some(stream.id());
        state.stream = StreamState::Live;
        state.pump = Some(tokio::spawn(Arc::clone(&self.shared).pump(stream)));
        log::debug!("Subscribed to {} changes", self.table());
        Ok(self.handle(token))
    }

    /// Subscribe, then load. Notifications delivered during the load are
    /// replayed over its rows.
    pub async fn start(&self) -> Result<SubscriptionHandle, StoreError> {
        let handle = self.subscribe().await?;
        // A failed load is recorded in last_error; the feed stays up.
        let _ = self.initialize().await;
        Ok(handle)
    }

    /// Release the subscription named by `handle` and close the store.
    pub async fn teardown(&self, handle: &SubscriptionHandle) {
        let current = self.shared.state.read().await.token;
        if current.is_some() && current != Some(handle.token) {
            log::debug!("Ignoring teardown with a stale handle for {}", handle.table);
            return;
        }
        self.close().await;
    }

    /// Stop all mutation and release the feed. Safe to call repeatedly.
    pub async fn close(&self) {
        let (pump, subscription) = {
            let mut state = self.shared.state.write().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.stream = StreamState::Closed;
            state.token = None;
            (state.pump.take(), state.subscription.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(id) = subscription {
            self.shared.backend.unsubscribe(id);
        }
        log::debug!("Closed {} store", self.table());
    }

    /// Forget loaded data so `initialize` can run again from scratch.
    pub async fn reset(&self) {
        let mut state = self.shared.state.write().await;
        if state.closed {
            return;
        }
        state.cache.clear();
        state.loaded = false;
        state.last_error = None;
        self.shared.publish(&state);
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    /// Create a record remotely. Any `id` in the draft is ignored when empty.
    ///
    /// While the feed is live the Insert notification updates the cache.
    /// Without a live feed the confirmed record is upserted directly.
    pub async fn add<D: Serialize + ?Sized>(&self, draft: &D) -> Result<T, StoreError> {
        let mut payload = self.encode(draft)?;
        if let Some(obj) = payload.as_object_mut() {
            let blank = match obj.get("id") {
                Some(Value::String(id)) => id.is_empty(),
                Some(Value::Null) => true,
                _ => false,
            };
            if blank {
                obj.remove("id");
            }
        }

        let stored = self.shared.backend.insert(self.table(), payload).await?;
        let record: T = decode_record(self.table(), stored)?;

        let mut state = self.shared.state.write().await;
        if !state.closed
            && state.stream != StreamState::Live
            && state.apply(RecordChange::Insert(record.clone()))
        {
            self.shared.publish(&state);
        }
        Ok(record)
    }

    /// Patch record `id` remotely.
    ///
    /// While the feed is live the Update notification refreshes the cache,
    /// in server order with other clients' writes. Without a live feed the
    /// returned record replaces the cached row in place.
    pub async fn update<P: Serialize + ?Sized>(&self, id: &str, partial: &P) -> Result<T, StoreError> {
        let partial = self.encode(partial)?;
        let stored = self.shared.backend.patch(self.table(), id, partial).await?;
        let record: T = decode_record(self.table(), stored)?;

        let mut state = self.shared.state.write().await;
        if !state.closed
            && state.stream != StreamState::Live
            && state.apply(RecordChange::Update(record.clone()))
        {
            self.shared.publish(&state);
        }
        Ok(record)
    }

    /// Delete record `id` remotely and drop it locally.
    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.shared.backend.delete(self.table(), id).await?;

        let mut state = self.shared.state.write().await;
        if !state.closed && state.apply(RecordChange::Delete(id.to_string())) {
            self.shared.publish(&state);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    pub async fn snapshot(&self) -> Arc<Vec<T>> {
        self.shared.state.read().await.cache.snapshot()
    }

    /// Snapshot and the cache version it belongs to, read atomically.
    pub async fn versioned_snapshot(&self) -> (u64, Arc<Vec<T>>) {
        let state = self.shared.state.read().await;
        (state.cache.version(), state.cache.snapshot())
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        self.shared.state.read().await.cache.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.shared.state.read().await.cache.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_loaded(&self) -> bool {
        self.shared.state.read().await.loaded
    }

    pub async fn last_error(&self) -> Option<StoreError> {
        self.shared.state.read().await.last_error.clone()
    }

    pub async fn stream_state(&self) -> StreamState {
        self.shared.state.read().await.stream
    }

    pub async fn version(&self) -> u64 {
        self.shared.state.read().await.cache.version()
    }

    /// Receiver that ticks with the cache version on every mutation.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.shared.version_tx.subscribe()
    }

    fn handle(&self, token: u64) -> SubscriptionHandle {
        SubscriptionHandle {
            table: self.table().to_string(),
            token,
        }
    }

    fn encode<S: Serialize + ?Sized>(&self, value: &S) -> Result<Value, StoreError> {
        serde_json::to_value(value).map_err(|e| StoreError::Encode {
            table: self.table().to_string(),
            reason: e.to_string(),
        })
    }
}

impl<T: SyncRecord> Shared<T> {
    fn publish(&self, state: &StoreState<T>) {
        self.version_tx.send_replace(state.cache.version());
    }

    /// Bulk read and decode. Undecodable rows are skipped.
    async fn fetch(&self) -> Result<Vec<T>, StoreError> {
        let options = QueryOptions::from(&self.config);
        let rows = self.backend.query(&self.config.table, &options).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_record::<T>(&self.config.table, row) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping row: {e}"),
            }
        }
        Ok(records)
    }

    /// Apply notifications until the store closes or the feed is lost for good.
    async fn pump(self: Arc<Self>, mut stream: ChangeStream) {
        loop {
            match stream.recv().await {
                Ok(notification) => {
                    let change = match RecordChange::<T>::decode(&notification) {
                        Ok(change) => change,
                        Err(e) => {
                            log::warn!("Dropping notification #{}: {e}", notification.sequence);
                            continue;
                        }
                    };
                    let mut state = self.state.write().await;
                    if state.closed {
                        return;
                    }
                    if state.apply(change) {
                        self.publish(&state);
                    }
                }
                Err(StreamError::Lagged(skipped)) => {
                    log::warn!("{} feed skipped {skipped} notifications, resyncing", self.config.table);
                    if !self.resync().await {
                        return;
                    }
                }
                Err(StreamError::Closed) => match self.reconnect().await {
                    Some(next) => stream = next,
                    None => return,
                },
            }
        }
    }

    /// Replace the cache from a fresh bulk read. Returns false once closed.
    async fn resync(&self) -> bool {
        let base = {
            let mut state = self.state.write().await;
            if state.closed {
                return false;
            }
            state.begin_fetch()
        };
        let fetched = self.fetch().await;
        let mut state = self.state.write().await;
        if state.closed {
            state.end_fetch();
            return false;
        }
        match fetched {
            Ok(records) => {
                let count = state.rebase(base, records);
                state.last_error = None;
                self.publish(&state);
                log::info!("Resynced {count} {} records", self.config.table);
            }
            Err(e) => {
                log::warn!("Resync of {} failed: {e}", self.config.table);
                state.last_error = Some(e);
            }
        }
        state.end_fetch();
        true
    }

    /// Resubscribe with backoff, then resync. `None` when closed or out of attempts.
    async fn reconnect(&self) -> Option<ChangeStream> {
        let policy = &self.options.reconnect;
        {
            let mut state = self.state.write().await;
            if state.closed {
                return None;
            }
            state.stream = StreamState::Reconnecting;
            state.subscription = None;
        }
        log::info!("{} feed dropped, reconnecting", self.config.table);

        let mut attempt = 0;
        loop {
            attempt += 1;
            tokio::time::sleep(policy.delay_for(attempt)).await;

            match self.backend.subscribe(&self.config.table).await {
                Ok(stream) => {
                    {
                        let mut state = self.state.write().await;
                        if state.closed {
                            self.backend.unsubscribe(stream.id());
                            return None;
                        }
                        state.subscription = Some(stream.id());
                    }
                    if !self.resync().await {
                        return None;
                    }
                    let mut state = self.state.write().await;
                    if state.closed {
                        return None;
                    }
                    state.stream = StreamState::Live;
                    log::info!("{} feed restored after {attempt} attempt(s)", self.config.table);
                    return Some(stream);
                }
                Err(e) => {
                    log::debug!("Resubscribe attempt {attempt} for {} failed: {e}", self.config.table);
                    if policy.exhausted(attempt) {
                        let mut state = self.state.write().await;
                        if !state.closed {
                            state.stream = StreamState::Stale;
                            state.token = None;
                            state.last_error = Some(StoreError::Stale {
                                table: self.config.table.clone(),
                                reason: e.to_string(),
                            });
                        }
                        log::warn!("Giving up on {} feed after {attempt} attempts", self.config.table);
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use futures_util::future::BoxFuture;
    use range_core::{ChangeNotification, Ioc, SecurityEvent, Severity};
    use serde_json::json;

    fn fast_options() -> StoreOptions {
        StoreOptions {
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                max_attempts: None,
            },
        }
    }

    fn ioc_store(backend: &Arc<MemoryBackend>, limit: Option<usize>) -> CollectionStore<Ioc> {
        let mut config = CollectionConfig::iocs();
        config.limit = limit;
        CollectionStore::new(backend.clone(), config, fast_options())
    }

    /// Wait until `cond` holds for the store, or fail after a second.
    async fn eventually<T, F>(store: &CollectionStore<T>, cond: F)
    where
        T: SyncRecord,
        F: Fn(&[T]) -> bool,
    {
        let mut rx = store.watch();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if cond(store.snapshot().await.as_slice()) {
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            assert!(!remaining.is_zero(), "condition not reached in time");
            let _ = tokio::time::timeout(remaining, rx.changed()).await;
        }
    }

    fn ids(rows: &[Ioc]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    /// A write by another client, landed while one of our calls is in flight.
    enum Interleave {
        InsertDuringQuery(Value),
        DeleteDuringQuery(&'static str),
        PatchDuringPatch(Value),
    }

    /// Backend whose reads and patches return only after another client's
    /// write has been committed and fanned out.
    struct InterleavingBackend {
        inner: Arc<MemoryBackend>,
        pending: std::sync::Mutex<Option<Interleave>>,
    }

    impl InterleavingBackend {
        fn new(inner: Arc<MemoryBackend>, write: Interleave) -> Arc<Self> {
            Arc::new(Self {
                inner,
                pending: std::sync::Mutex::new(Some(write)),
            })
        }

        /// The pending write, if it belongs to a patch (or to a query).
        fn take(&self, during_patch: bool) -> Option<Interleave> {
            let mut pending = self.pending.lock().unwrap();
            match *pending {
                Some(Interleave::PatchDuringPatch(_)) if !during_patch => None,
                Some(Interleave::InsertDuringQuery(_) | Interleave::DeleteDuringQuery(_)) if during_patch => None,
                _ => pending.take(),
            }
        }

        async fn settle() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    impl Backend for InterleavingBackend {
        fn query<'a>(
            &'a self,
            table: &'a str,
            options: &'a QueryOptions,
        ) -> BoxFuture<'a, Result<Vec<Value>, BackendError>> {
            Box::pin(async move {
                let rows = self.inner.query(table, options).await?;
                match self.take(false) {
                    Some(Interleave::InsertDuringQuery(row)) => {
                        self.inner.insert(table, row).await?;
                    }
                    Some(Interleave::DeleteDuringQuery(id)) => {
                        self.inner.delete(table, id).await?;
                    }
                    _ => {}
                }
                Self::settle().await;
                Ok(rows)
            })
        }

        fn insert<'a>(&'a self, table: &'a str, payload: Value) -> BoxFuture<'a, Result<Value, BackendError>> {
            self.inner.insert(table, payload)
        }

        fn patch<'a>(
            &'a self,
            table: &'a str,
            id: &'a str,
            partial: Value,
        ) -> BoxFuture<'a, Result<Value, BackendError>> {
            Box::pin(async move {
                let mine = self.inner.patch(table, id, partial).await?;
                if let Some(Interleave::PatchDuringPatch(theirs)) = self.take(true) {
                    self.inner.patch(table, id, theirs).await?;
                    Self::settle().await;
                }
                Ok(mine)
            })
        }

        fn delete<'a>(&'a self, table: &'a str, id: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
            self.inner.delete(table, id)
        }

        fn subscribe<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<ChangeStream, BackendError>> {
            self.inner.subscribe(table)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.inner.unsubscribe(id)
        }
    }

    #[test]
    fn test_reconnect_policy_backoff() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1000));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[tokio::test]
    async fn test_initialize_loads_ordered_and_bounded() {
        let backend = Arc::new(MemoryBackend::new());
        for (id, seen) in [("a", "2024-01-01"), ("b", "2024-03-01"), ("c", "2024-02-01")] {
            backend.insert("iocs", json!({"id": id, "last_seen": seen})).await.unwrap();
        }
        let store = ioc_store(&backend, Some(2));
        assert!(!store.is_loaded().await);

        assert_eq!(store.initialize().await.unwrap(), 2);
        assert!(store.is_loaded().await);
        assert_eq!(ids(&store.snapshot().await), vec!["b", "c"]);
        assert!(store.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_empty_still_loaded() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, None);
        assert_eq!(store.initialize().await.unwrap(), 0);
        assert!(store.is_loaded().await);
    }

    #[tokio::test]
    async fn test_initialize_failure_settles_loaded_with_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("iocs", json!({"id": "a"})).await.unwrap();
        backend.set_fail_reads(true);

        let store = ioc_store(&backend, None);
        assert!(store.initialize().await.is_err());
        assert!(store.is_loaded().await);
        assert!(store.is_empty().await);
        assert!(matches!(
            store.last_error().await,
            Some(StoreError::Backend(BackendError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_loaded_only_reverts_on_reset() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, None);
        store.initialize().await.unwrap();
        store.initialize().await.unwrap();
        assert!(store.is_loaded().await);

        store.reset().await;
        assert!(!store.is_loaded().await);
    }

    #[tokio::test]
    async fn test_initialize_skips_undecodable_rows() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("iocs", json!({"id": "ok", "value": "x"})).await.unwrap();
        backend.insert("iocs", json!({"id": "bad", "confidence": "very"})).await.unwrap();

        let store = ioc_store(&backend, None);
        assert_eq!(store.initialize().await.unwrap(), 1);
        assert!(store.get("ok").await.is_some());
    }

    #[tokio::test]
    async fn test_subscription_applies_remote_changes() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, None);
        store.start().await.unwrap();

        let other = ioc_store(&backend, None);
        let created = other
            .add(&Ioc { value: "evil.example".into(), ..Ioc::default() })
            .await
            .unwrap();
        eventually(&store, |rows| rows.len() == 1).await;

        other.update(&created.id, &json!({"active": true})).await.unwrap();
        eventually(&store, |rows| rows.first().is_some_and(|r| r.active)).await;

        other.remove(&created.id).await.unwrap();
        eventually(&store, |rows| rows.is_empty()).await;
    }

    #[tokio::test]
    async fn test_limit_two_evicts_first_insert() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, Some(2));
        store.subscribe().await.unwrap();

        for id in ["A", "B", "C"] {
            backend.insert("iocs", json!({"id": id})).await.unwrap();
        }
        eventually(&store, |rows| ids(rows) == vec!["C", "B"]).await;
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_notifications() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, None);
        store.subscribe().await.unwrap();

        let insert = ChangeNotification::insert("iocs", "A", json!({"id": "A", "value": "a"}));
        backend.emit(insert.clone()).await;
        backend.emit(insert).await;
        backend
            .emit(ChangeNotification::update("iocs", "X", json!({"id": "X", "value": "ghost"})))
            .await;
        backend
            .emit(ChangeNotification::insert("iocs", "B", json!({"id": "B", "value": "b"})))
            .await;

        eventually(&store, |rows| rows.len() == 2).await;
        assert_eq!(ids(&store.snapshot().await), vec!["B", "A"]);
        assert!(store.get("X").await.is_none());
    }

    #[tokio::test]
    async fn test_add_without_feed_upserts_confirmed_record() {
        let backend = Arc::new(MemoryBackend::new());
        let store: CollectionStore<SecurityEvent> =
            CollectionStore::new(backend.clone(), CollectionConfig::security_events(), fast_options());

        let event = store
            .add(&SecurityEvent {
                event_type: "brute_force".into(),
                severity: Severity::High,
                ..SecurityEvent::default()
            })
            .await
            .unwrap();
        assert!(!event.id.is_empty());
        assert_eq!(store.get(&event.id).await.unwrap().severity, Severity::High);
    }

    #[tokio::test]
    async fn test_add_with_live_feed_does_not_duplicate() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, None);
        store.subscribe().await.unwrap();

        let created = store.add(&json!({"value": "1.2.3.4"})).await.unwrap();
        eventually(&store, |rows| rows.len() == 1).await;
        // A replayed Insert for the same record stays a single row.
        backend
            .emit(ChangeNotification::insert(
                "iocs",
                created.id.clone(),
                serde_json::to_value(&created).unwrap(),
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_untouched() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("iocs", json!({"id": "a", "value": "x"})).await.unwrap();
        let store = ioc_store(&backend, None);
        store.initialize().await.unwrap();
        let before = store.version().await;

        backend.set_fail_writes(true);
        assert!(store.add(&json!({"value": "y"})).await.is_err());
        assert!(store.update("a", &json!({"value": "z"})).await.is_err());
        assert!(store.remove("a").await.is_err());

        assert_eq!(store.version().await, before);
        assert_eq!(store.get("a").await.unwrap().value, "x");
    }

    #[tokio::test]
    async fn test_remove_missing_id_errors() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("iocs", json!({"id": "a"})).await.unwrap();
        let store = ioc_store(&backend, None);
        store.initialize().await.unwrap();

        let err = store.remove("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(BackendError::NotFound { .. })));
        assert_eq!(ids(&store.snapshot().await), vec!["a"]);
    }

    #[tokio::test]
    async fn test_update_and_remove_apply_locally() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("iocs", json!({"id": "a", "value": "x"})).await.unwrap();
        let store = ioc_store(&backend, None);
        store.initialize().await.unwrap();

        let updated = store.update("a", &json!({"value": "y"})).await.unwrap();
        assert_eq!(updated.value, "y");
        assert_eq!(store.get("a").await.unwrap().value, "y");

        store.remove("a").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_insert_during_initial_load_is_kept() {
        let memory = Arc::new(MemoryBackend::new());
        memory.insert("iocs", json!({"id": "early"})).await.unwrap();
        let backend = InterleavingBackend::new(
            memory.clone(),
            Interleave::InsertDuringQuery(json!({"id": "late"})),
        );
        let store: CollectionStore<Ioc> = CollectionStore::new(backend, CollectionConfig::iocs(), fast_options());

        store.start().await.unwrap();
        eventually(&store, |rows| rows.len() == 2).await;
        assert!(store.get("late").await.is_some());
        let options = QueryOptions::from(&CollectionConfig::iocs());
        assert_eq!(memory.query("iocs", &options).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_during_initial_load_stays_deleted() {
        let memory = Arc::new(MemoryBackend::new());
        memory.insert("iocs", json!({"id": "gone"})).await.unwrap();
        let backend = InterleavingBackend::new(memory.clone(), Interleave::DeleteDuringQuery("gone"));
        let store: CollectionStore<Ioc> = CollectionStore::new(backend, CollectionConfig::iocs(), fast_options());

        store.start().await.unwrap();
        eventually(&store, |rows| rows.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("gone").await.is_none());
        assert!(store.is_loaded().await);
    }

    #[tokio::test]
    async fn test_update_response_never_overrides_newer_remote_write() {
        let memory = Arc::new(MemoryBackend::new());
        memory.insert("iocs", json!({"id": "a", "value": "original"})).await.unwrap();
        let backend = InterleavingBackend::new(
            memory.clone(),
            Interleave::PatchDuringPatch(json!({"value": "theirs"})),
        );
        let store: CollectionStore<Ioc> = CollectionStore::new(backend, CollectionConfig::iocs(), fast_options());
        store.start().await.unwrap();

        let returned = store.update("a", &json!({"value": "mine"})).await.unwrap();
        assert_eq!(returned.value, "mine");

        eventually(&store, |rows| rows.first().is_some_and(|r| r.value == "theirs")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("a").await.unwrap().value, "theirs");
    }

    #[tokio::test]
    async fn test_remote_writes_during_reload_survive() {
        let memory = Arc::new(MemoryBackend::new());
        let store = ioc_store(&memory, None);
        store.start().await.unwrap();
        store.initialize().await.unwrap();

        // A second load races a burst of inserts and deletes.
        let writer = {
            let memory = memory.clone();
            tokio::spawn(async move {
                for i in 0..30 {
                    memory.insert("iocs", json!({"id": format!("w{i}")})).await.unwrap();
                    if i % 3 == 0 {
                        memory.delete("iocs", &format!("w{i}")).await.unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        store.initialize().await.unwrap();
        writer.await.unwrap();

        eventually(&store, |rows| rows.len() == 20).await;
        let mut local: Vec<String> = store.snapshot().await.iter().map(|r| r.id.clone()).collect();
        let mut remote: Vec<String> = memory
            .query("iocs", &QueryOptions::from(store.config()))
            .await
            .unwrap()
            .iter()
            .map(|row| row["id"].as_str().unwrap().to_string())
            .collect();
        local.sort();
        remote.sort();
        assert_eq!(local, remote);
    }

    #[tokio::test]
    async fn test_teardown_stops_mutation() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, None);
        let handle = store.subscribe().await.unwrap();

        backend.insert("iocs", json!({"id": "a"})).await.unwrap();
        eventually(&store, |rows| rows.len() == 1).await;

        store.teardown(&handle).await;
        store.teardown(&handle).await;
        assert_eq!(store.stream_state().await, StreamState::Closed);

        backend.insert("iocs", json!({"id": "b"})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.initialize().await, Err(StoreError::Closed));
        assert!(matches!(store.subscribe().await, Err(StoreError::Closed)));
        assert_eq!(backend.active_subscriptions().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_twice_returns_same_handle() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, None);
        let first = store.subscribe().await.unwrap();
        let second = store.subscribe().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.active_subscriptions().await, 1);
    }

    #[tokio::test]
    async fn test_reconnect_resyncs_missed_changes() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, None);
        store.start().await.unwrap();

        backend.disconnect_streams().await;
        // Written while the feed is down; only a resync can pick it up.
        backend.insert("iocs", json!({"id": "missed"})).await.unwrap();

        eventually(&store, |rows| ids(rows) == vec!["missed"]).await;
        let mut waited = 0;
        while store.stream_state().await != StreamState::Live && waited < 100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(store.stream_state().await, StreamState::Live);

        backend.insert("iocs", json!({"id": "after"})).await.unwrap();
        eventually(&store, |rows| rows.len() == 2).await;
    }

    #[tokio::test]
    async fn test_lagged_feed_triggers_resync() {
        let backend = Arc::new(MemoryBackend::with_capacity(2));
        let store = ioc_store(&backend, None);
        store.subscribe().await.unwrap();

        // Burst past the feed capacity before the pump gets scheduled.
        for i in 0..20 {
            backend.insert("iocs", json!({"id": format!("ioc-{i}")})).await.unwrap();
        }
        eventually(&store, |rows| rows.len() == 20).await;
    }

    #[tokio::test]
    async fn test_watch_ticks_on_change() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ioc_store(&backend, None);
        let mut rx = store.watch();
        store.subscribe().await.unwrap();

        backend.insert("iocs", json!({"id": "a"})).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*rx.borrow() >= 1);
    }
}
