//! WebSocket client for a remote `SyncServer`.
//!
//! Provides:
//! - request/response multiplexing by request id
//! - change streams and presence channels routed by server-assigned ids
//! - lazy reconnection: the next request after a drop dials again
//!
//! A dropped socket fails every pending request with
//! `BackendError::Transport` and ends every open change stream and presence
//! channel, so stores fall into their own reconnect path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use range_core::PresenceRecord;

use crate::backend::{Backend, BackendError, ChangeStream, QueryOptions, StreamError, StreamItem, SubscriptionId};
use crate::presence::{PresenceChannel, PresenceError, PresenceEvent, PresenceLink, PresenceTransport};
use crate::protocol::{from_json, to_json, Reply, Request, WireMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// `close()` was called; no further dialing.
    Closed,
}

/// Where a reply's server-assigned id should be routed.
enum Route {
    Stream {
        table: String,
        tx: mpsc::UnboundedSender<StreamItem>,
    },
    Presence {
        tx: mpsc::UnboundedSender<PresenceEvent>,
    },
}

struct Pending {
    generation: u64,
    reply: oneshot::Sender<Result<Reply, BackendError>>,
    route: Option<Route>,
}

struct Connection {
    generation: u64,
    out_tx: mpsc::UnboundedSender<WireMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct ClientInner {
    url: String,
    state: Mutex<ConnectionState>,
    connection: Mutex<Option<Connection>>,
    dial: tokio::sync::Mutex<()>,
    pending: Mutex<HashMap<u64, Pending>>,
    streams: Mutex<HashMap<u64, mpsc::UnboundedSender<StreamItem>>>,
    channels: Mutex<HashMap<u64, mpsc::UnboundedSender<PresenceEvent>>>,
    next_request: AtomicU64,
    next_generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn connection_lost() -> BackendError {
    BackendError::Transport("connection lost".into())
}

impl ClientInner {
    fn current(&self) -> Option<(u64, mpsc::UnboundedSender<WireMessage>)> {
        lock(&self.connection)
            .as_ref()
            .map(|c| (c.generation, c.out_tx.clone()))
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    /// Live connection, dialing a new one when there is none.
    async fn ensure_connected(self: &Arc<Self>) -> Result<(u64, mpsc::UnboundedSender<WireMessage>), BackendError> {
        if let Some(current) = self.current() {
            return Ok(current);
        }
        let _dialing = self.dial.lock().await;
        if let Some(current) = self.current() {
            return Ok(current);
        }
        if *lock(&self.state) == ConnectionState::Closed {
            return Err(BackendError::Transport("client closed".into()));
        }

        *lock(&self.state) = ConnectionState::Connecting;
        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                *lock(&self.state) = ConnectionState::Disconnected;
                log::debug!("Failed to connect to {}: {e}", self.url);
                return Err(BackendError::Unavailable(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        // Writer task: outgoing queue to the socket.
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let encoded = match msg.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: route frames until the socket ends.
        let weak: Weak<ClientInner> = Arc::downgrade(self);
        let pong_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let Some(inner) = weak.upgrade() else { return };
                match msg {
                    Ok(Message::Binary(data)) => match WireMessage::decode(&data) {
                        Ok(WireMessage::Ping) => {
                            let _ = pong_tx.send(WireMessage::Pong);
                        }
                        Ok(frame) => inner.route(frame),
                        Err(e) => log::warn!("Failed to decode frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.disconnected(generation);
            }
        });

        *lock(&self.connection) = Some(Connection {
            generation,
            out_tx: out_tx.clone(),
            reader,
            writer,
        });
        *lock(&self.state) = ConnectionState::Connected;
        log::info!("Connected to sync server at {}", self.url);
        Ok((generation, out_tx))
    }

    /// Tear down state belonging to `generation`.
    fn disconnected(&self, generation: u64) {
        let connection = {
            let mut current = lock(&self.connection);
            if current.as_ref().map(|c| c.generation) != Some(generation) {
                return;
            }
            current.take()
        };
        if let Some(connection) = connection {
            connection.writer.abort();
            connection.reader.abort();
        }
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Disconnected;
            }
        }

        let failed: Vec<Pending> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.generation == generation)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for p in failed {
            let _ = p.reply.send(Err(connection_lost()));
        }
        // Dropping the senders ends every stream and channel.
        lock(&self.streams).clear();
        lock(&self.channels).clear();
        log::warn!("Lost connection to sync server at {}", self.url);
    }

    fn route(&self, frame: WireMessage) {
        match frame {
            WireMessage::Response { request_id, result } => {
                let Some(pending) = lock(&self.pending).remove(&request_id) else {
                    log::trace!("Response for untracked request {request_id}");
                    return;
                };
                match (&result, pending.route) {
                    (Ok(Reply::Subscribed { subscription_id }), Some(Route::Stream { table, tx })) => {
                        log::debug!("Change feed {subscription_id} open for {table}");
                        lock(&self.streams).insert(*subscription_id, tx);
                    }
                    (Ok(Reply::Opened { channel_id }), Some(Route::Presence { tx })) => {
                        lock(&self.channels).insert(*channel_id, tx);
                    }
                    _ => {}
                }
                let _ = pending.reply.send(result);
            }
            WireMessage::Change { subscription_id, change } => {
                let item = match change.into_notification() {
                    Ok(notification) => Ok(notification),
                    Err(e) => {
                        log::warn!("Dropping undecodable change on feed {subscription_id}: {e}");
                        return;
                    }
                };
                self.push_stream(subscription_id, item);
            }
            WireMessage::Lagged { subscription_id, skipped } => {
                self.push_stream(subscription_id, Err(StreamError::Lagged(skipped)));
            }
            WireMessage::StreamClosed { subscription_id } => {
                lock(&self.streams).remove(&subscription_id);
            }
            WireMessage::Presence { channel_id, event } => {
                if let Some(tx) = lock(&self.channels).get(&channel_id) {
                    let _ = tx.send(event);
                }
            }
            WireMessage::Pong => {}
            other => log::debug!("Ignoring unexpected frame from server: {other:?}"),
        }
    }

    fn push_stream(&self, subscription_id: u64, item: StreamItem) {
        let mut streams = lock(&self.streams);
        if let Some(tx) = streams.get(&subscription_id) {
            if tx.send(item).is_err() {
                streams.remove(&subscription_id);
            }
        }
    }

    /// Send `request` and wait for its response.
    ///
    /// With `on_generation`, fails instead of dialing when that connection is gone.
    async fn call(
        self: &Arc<Self>,
        request: Request,
        route: Option<Route>,
        on_generation: Option<u64>,
    ) -> Result<Reply, BackendError> {
        let (generation, out_tx) = match on_generation {
            Some(generation) => match self.current() {
                Some(current) if current.0 == generation => current,
                _ => return Err(connection_lost()),
            },
            None => self.ensure_connected().await?,
        };

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, Pending { generation, reply, route });

        if !self.is_current(generation) || out_tx.send(WireMessage::request(request_id, request)).is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(connection_lost());
        }
        rx.await.map_err(|_| connection_lost())?
    }

    /// Fire-and-forget on `generation`; dropped if that connection is gone.
    fn notify(&self, generation: Option<u64>, request: Request) {
        if let Some((current, out_tx)) = self.current() {
            if generation.is_none_or(|g| g == current) {
                let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
                let _ = out_tx.send(WireMessage::request(request_id, request));
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(connection) = lock(&self.connection).take() {
            connection.reader.abort();
            connection.writer.abort();
        }
    }
}

/// Connection to a remote sync server, usable as a [`Backend`] and a
/// [`PresenceTransport`].
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Dial `url` (e.g. `ws://127.0.0.1:9090`).
    pub async fn connect(url: impl Into<String>) -> Result<Self, BackendError> {
        let client = Self::lazy(url);
        client.inner.ensure_connected().await?;
        Ok(client)
    }

    /// Client that dials on first use.
    pub fn lazy(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                url: url.into(),
                state: Mutex::new(ConnectionState::Disconnected),
                connection: Mutex::new(None),
                dial: tokio::sync::Mutex::new(()),
                pending: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Drop the socket without closing the client. The next call redials.
    pub fn disconnect(&self) {
        if let Some((generation, _)) = self.inner.current() {
            self.inner.disconnected(generation);
        }
    }

    /// Drop the socket and refuse further calls.
    pub fn close(&self) {
        *lock(&self.inner.state) = ConnectionState::Closed;
        self.disconnect();
    }

    async fn row(&self, request: Request) -> Result<Value, BackendError> {
        match self.inner.call(request, None, None).await? {
            Reply::Row(row) => Ok(from_json(&row)?),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(reply: &Reply) -> BackendError {
    BackendError::Transport(format!("unexpected reply: {reply:?}"))
}

impl Backend for SyncClient {
    fn query<'a>(
        &'a self,
        table: &'a str,
        options: &'a QueryOptions,
    ) -> BoxFuture<'a, Result<Vec<Value>, BackendError>> {
        Box::pin(async move {
            let request = Request::Query {
                table: table.to_string(),
                options: options.clone(),
            };
            match self.inner.call(request, None, None).await? {
                Reply::Rows(rows) => rows
                    .iter()
                    .map(|row| from_json(row).map_err(BackendError::from))
                    .collect(),
                other => Err(unexpected(&other)),
            }
        })
    }

    fn insert<'a>(&'a self, table: &'a str, payload: Value) -> BoxFuture<'a, Result<Value, BackendError>> {
        Box::pin(async move {
            self.row(Request::Insert {
                table: table.to_string(),
                payload: to_json(&payload)?,
            })
            .await
        })
    }

    fn patch<'a>(
        &'a self,
        table: &'a str,
        id: &'a str,
        partial: Value,
    ) -> BoxFuture<'a, Result<Value, BackendError>> {
        Box::pin(async move {
            self.row(Request::Patch {
                table: table.to_string(),
                id: id.to_string(),
                partial: to_json(&partial)?,
            })
            .await
        })
    }

    fn delete<'a>(&'a self, table: &'a str, id: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let request = Request::Delete {
                table: table.to_string(),
                id: id.to_string(),
            };
            match self.inner.call(request, None, None).await? {
                Reply::Done => Ok(()),
                other => Err(unexpected(&other)),
            }
        })
    }

    fn subscribe<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<ChangeStream, BackendError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let route = Route::Stream {
                table: table.to_string(),
                tx,
            };
            let request = Request::Subscribe {
                table: table.to_string(),
            };
            match self.inner.call(request, Some(route), None).await? {
                Reply::Subscribed { subscription_id } => Ok(ChangeStream::from_channel(
                    SubscriptionId(subscription_id),
                    table,
                    rx,
                )),
                other => Err(unexpected(&other)),
            }
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if lock(&self.inner.streams).remove(&id.0).is_some() {
            self.inner.notify(None, Request::Unsubscribe { subscription_id: id.0 });
        }
    }
}

impl PresenceTransport for SyncClient {
    fn open<'a>(&'a self, panel_id: &'a str) -> BoxFuture<'a, Result<PresenceChannel, PresenceError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let request = Request::PresenceOpen {
                panel_id: panel_id.to_string(),
            };
            let reply = self
                .inner
                .call(request, Some(Route::Presence { tx }), None)
                .await
                .map_err(|e| PresenceError::Transport(e.to_string()))?;
            let channel_id = match reply {
                Reply::Opened { channel_id } => channel_id,
                other => return Err(PresenceError::Transport(unexpected(&other).to_string())),
            };
            let generation = self
                .inner
                .current()
                .map(|(generation, _)| generation)
                .ok_or(PresenceError::Closed)?;

            let link = RemoteLink {
                inner: Arc::clone(&self.inner),
                channel_id,
                generation,
                closed: AtomicBool::new(false),
            };
            Ok(PresenceChannel::new(panel_id, rx, Arc::new(link)))
        })
    }
}

/// Presence channel bound to one server connection.
struct RemoteLink {
    inner: Arc<ClientInner>,
    channel_id: u64,
    generation: u64,
    closed: AtomicBool,
}

impl PresenceLink for RemoteLink {
    fn track(&self, record: PresenceRecord) -> BoxFuture<'_, Result<(), PresenceError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PresenceError::Closed);
            }
            let request = Request::PresenceTrack {
                channel_id: self.channel_id,
                record,
            };
            match self.inner.call(request, None, Some(self.generation)).await {
                Ok(_) => Ok(()),
                Err(e) => Err(PresenceError::Transport(e.to_string())),
            }
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.is_current(self.generation) {
            lock(&self.inner.channels).remove(&self.channel_id);
            self.inner.notify(
                Some(self.generation),
                Request::PresenceClose {
                    channel_id: self.channel_id,
                },
            );
        }
    }
}

impl Drop for RemoteLink {
    fn drop(&mut self) {
        self.close();
    }
}
