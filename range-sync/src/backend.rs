//! Contract with the remote backing store.
//!
//! ```text
//! CollectionStore ──query/insert/patch/delete──► dyn Backend
//!        ▲                                          │
//!        └──────────── ChangeStream ◄───subscribe───┘
//! ```
//!
//! Records cross this boundary as JSON objects; the store decodes them into
//! typed records. The trait is object-safe so one backend handle, created at
//! process start, is passed as `Arc<dyn Backend>` to every store.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use range_core::{ChangeNotification, CollectionConfig, SortDirection};

/// Errors reported by a backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum BackendError {
    #[error("record {id} not found in {table}")]
    NotFound { table: String, id: String },

    #[error("record {id} already exists in {table}")]
    Conflict { table: String, id: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Ordering and limit for a bulk read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub order_field: String,
    pub direction: SortDirection,
    pub limit: Option<usize>,
}

impl From<&CollectionConfig> for QueryOptions {
    fn from(config: &CollectionConfig) -> Self {
        Self {
            order_field: config.order_field.clone(),
            direction: config.direction,
            limit: config.limit,
        }
    }
}

/// Identifies one open change feed on a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Why a change stream stopped yielding notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The feed is gone. Subscribe again to resume.
    #[error("change stream closed")]
    Closed,

    /// The receiver fell behind and `0` notifications were skipped.
    #[error("change stream lagged by {0} notifications")]
    Lagged(u64),
}

/// Item type for channel-backed streams.
pub type StreamItem = Result<ChangeNotification, StreamError>;

enum StreamSource {
    Broadcast(broadcast::Receiver<ChangeNotification>),
    Channel(mpsc::UnboundedReceiver<StreamItem>),
}

/// A live change feed for one table.
pub struct ChangeStream {
    id: SubscriptionId,
    table: String,
    source: StreamSource,
}

impl ChangeStream {
    /// Stream fed by an in-process broadcast group.
    pub fn from_broadcast(
        id: SubscriptionId,
        table: impl Into<String>,
        rx: broadcast::Receiver<ChangeNotification>,
    ) -> Self {
        Self {
            id,
            table: table.into(),
            source: StreamSource::Broadcast(rx),
        }
    }

    /// Stream fed by a transport task. Dropping the sender closes the stream.
    pub fn from_channel(
        id: SubscriptionId,
        table: impl Into<String>,
        rx: mpsc::UnboundedReceiver<StreamItem>,
    ) -> Self {
        Self {
            id,
            table: table.into(),
            source: StreamSource::Channel(rx),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Next notification for this table.
    ///
    /// Notifications for other tables (which a shared transport could
    /// deliver) are skipped.
    pub async fn recv(&mut self) -> StreamItem {
        loop {
            let item = match &mut self.source {
                StreamSource::Broadcast(rx) => match rx.recv().await {
                    Ok(n) => Ok(n),
                    Err(broadcast::error::RecvError::Lagged(n)) => Err(StreamError::Lagged(n)),
                    Err(broadcast::error::RecvError::Closed) => Err(StreamError::Closed),
                },
                StreamSource::Channel(rx) => rx.recv().await.unwrap_or(Err(StreamError::Closed)),
            };
            match item {
                Ok(n) if n.table != self.table => continue,
                other => return other,
            }
        }
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("id", &self.id)
            .field("table", &self.table)
            .finish()
    }
}

/// A remote collection store.
pub trait Backend: Send + Sync {
    /// Bulk read of `table`, ordered and optionally limited.
    fn query<'a>(
        &'a self,
        table: &'a str,
        options: &'a QueryOptions,
    ) -> BoxFuture<'a, Result<Vec<Value>, BackendError>>;

    /// Create a record. The backend assigns `id` when the payload has none
    /// and returns the full stored record.
    fn insert<'a>(&'a self, table: &'a str, payload: Value)
        -> BoxFuture<'a, Result<Value, BackendError>>;

    /// Shallow-merge `partial` into record `id`; returns the stored record.
    fn patch<'a>(
        &'a self,
        table: &'a str,
        id: &'a str,
        partial: Value,
    ) -> BoxFuture<'a, Result<Value, BackendError>>;

    fn delete<'a>(&'a self, table: &'a str, id: &'a str) -> BoxFuture<'a, Result<(), BackendError>>;

    /// Open a change feed for `table`.
    fn subscribe<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<ChangeStream, BackendError>>;

    /// Release a change feed. Fire-and-forget; never blocks.
    fn unsubscribe(&self, id: SubscriptionId);
}
