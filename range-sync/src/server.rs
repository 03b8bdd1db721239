//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! SyncClient A ──┐                      ┌── MemoryBackend (tables + change feeds)
//!                ├── connection task ───┤
//! SyncClient B ──┘   (one per socket)   └── PresenceHub (panel groups)
//! ```
//!
//! Each connection keeps:
//! - a forwarder task per open change subscription
//! - a presence channel per `PresenceOpen`, closed when the socket goes away
//!   so the other panel members receive `Leave`
//!
//! All outbound frames go through one unbounded queue, so a `Response` always
//! reaches the client before anything its forwarder sends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::backend::{Backend, BackendError, ChangeStream, StreamError, SubscriptionId};
use crate::hub::PresenceHub;
use crate::memory::MemoryBackend;
use crate::presence::PresenceLink;
use crate::protocol::{from_json, to_json, Reply, Request, WireMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-subscriber buffer for change feeds and presence groups
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_subscriptions: u64,
    pub active_presence_channels: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    backend: Arc<MemoryBackend>,
    hub: PresenceHub,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let backend = Arc::new(MemoryBackend::with_capacity(config.broadcast_capacity));
        let hub = PresenceHub::new(config.broadcast_capacity);
        Self::with_parts(config, backend, hub)
    }

    /// Serve an existing backend and hub, e.g. one shared with in-process stores.
    pub fn with_parts(config: ServerConfig, backend: Arc<MemoryBackend>, hub: PresenceHub) -> Self {
        Self {
            config,
            backend,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                addr,
                backend: Arc::clone(&self.backend),
                hub: self.hub.clone(),
                stats: Arc::clone(&self.stats),
                heartbeat: Duration::from_secs(self.config.heartbeat_interval_secs.max(1)),
                subscriptions: HashMap::new(),
                channels: HashMap::new(),
                next_channel: 1,
            };
            tokio::spawn(async move {
                if let Err(e) = connection.run(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    pub fn hub(&self) -> &PresenceHub {
        &self.hub
    }
}

struct PresenceBridge {
    link: Arc<dyn PresenceLink>,
    forwarder: JoinHandle<()>,
}

/// Per-socket state.
struct Connection {
    addr: SocketAddr,
    backend: Arc<MemoryBackend>,
    hub: PresenceHub,
    stats: Arc<RwLock<ServerStats>>,
    heartbeat: Duration,
    subscriptions: HashMap<u64, JoinHandle<()>>,
    channels: HashMap<u64, PresenceBridge>,
    next_channel: u64,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
        log::info!("WebSocket connection established from {}", self.addr);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        let outcome = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match WireMessage::decode(&data) {
                                Ok(WireMessage::Request { request_id, request }) => {
                                    self.handle_request(request_id, request, &out_tx).await;
                                }
                                Ok(WireMessage::Ping) => {
                                    let _ = out_tx.send(WireMessage::Pong);
                                }
                                Ok(WireMessage::Pong) => {}
                                Ok(other) => {
                                    log::debug!("Ignoring unexpected frame from {}: {other:?}", self.addr);
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {}: {e}", self.addr);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }
                        Some(Ok(_)) => {}
                    },

                    Some(outbound) = out_rx.recv() => {
                        let encoded = outbound.encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Binary(WireMessage::Ping.encode()?.into())).await?;
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        self.cleanup().await;
        outcome
    }

    async fn handle_request(
        &mut self,
        request_id: u64,
        request: Request,
        out: &mpsc::UnboundedSender<WireMessage>,
    ) {
        let result = match request {
            Request::Subscribe { table } => match self.backend.subscribe(&table).await {
                Ok(stream) => {
                    let id = stream.id();
                    // Response first, then the forwarder may start sending.
                    let _ = out.send(WireMessage::response(
                        request_id,
                        Ok(Reply::Subscribed { subscription_id: id.0 }),
                    ));
                    let forwarder = tokio::spawn(forward_changes(stream, out.clone()));
                    self.subscriptions.insert(id.0, forwarder);
                    self.stats.write().await.active_subscriptions += 1;
                    return;
                }
                Err(e) => Err(e),
            },

            Request::Unsubscribe { subscription_id } => {
                if let Some(forwarder) = self.subscriptions.remove(&subscription_id) {
                    forwarder.abort();
                    self.backend.unsubscribe(SubscriptionId(subscription_id));
                    let mut s = self.stats.write().await;
                    s.active_subscriptions = s.active_subscriptions.saturating_sub(1);
                }
                Ok(Reply::Done)
            }

            Request::PresenceOpen { panel_id } => {
                let channel_id = self.next_channel;
                self.next_channel += 1;

                let (mut events, link) = self.hub.open_channel(&panel_id).into_parts();
                let _ = out.send(WireMessage::response(request_id, Ok(Reply::Opened { channel_id })));

                let out = out.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if out.send(WireMessage::Presence { channel_id, event }).is_err() {
                            break;
                        }
                    }
                });
                self.channels.insert(channel_id, PresenceBridge { link, forwarder });
                self.stats.write().await.active_presence_channels += 1;
                log::debug!("{} opened presence channel {channel_id} on {panel_id}", self.addr);
                return;
            }

            Request::PresenceTrack { channel_id, record } => match self.channels.get(&channel_id) {
                Some(bridge) => bridge
                    .link
                    .track(record)
                    .await
                    .map(|()| Reply::Done)
                    .map_err(|e| BackendError::Transport(e.to_string())),
                None => Err(BackendError::Transport(format!("unknown presence channel {channel_id}"))),
            },

            Request::PresenceClose { channel_id } => {
                if self.close_channel(channel_id) {
                    let mut s = self.stats.write().await;
                    s.active_presence_channels = s.active_presence_channels.saturating_sub(1);
                }
                Ok(Reply::Done)
            }

            data => dispatch(&*self.backend, data).await,
        };
        let _ = out.send(WireMessage::response(request_id, result));
    }

    fn close_channel(&mut self, channel_id: u64) -> bool {
        match self.channels.remove(&channel_id) {
            Some(bridge) => {
                bridge.forwarder.abort();
                bridge.link.close();
                true
            }
            None => false,
        }
    }

    async fn cleanup(&mut self) {
        let subscriptions: Vec<u64> = self.subscriptions.keys().copied().collect();
        for id in &subscriptions {
            if let Some(forwarder) = self.subscriptions.remove(id) {
                forwarder.abort();
            }
            self.backend.unsubscribe(SubscriptionId(*id));
        }

        let channels: Vec<u64> = self.channels.keys().copied().collect();
        for id in &channels {
            self.close_channel(*id);
        }

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_subscriptions = s.active_subscriptions.saturating_sub(subscriptions.len() as u64);
        s.active_presence_channels = s.active_presence_channels.saturating_sub(channels.len() as u64);
        log::debug!(
            "Released {} subscriptions and {} presence channels for {}",
            subscriptions.len(),
            channels.len(),
            self.addr
        );
    }
}

/// Serve a data request against the backend.
async fn dispatch(backend: &dyn Backend, request: Request) -> Result<Reply, BackendError> {
    match request {
        Request::Query { table, options } => {
            let rows = backend.query(&table, &options).await?;
            let rows = rows.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
            Ok(Reply::Rows(rows))
        }
        Request::Insert { table, payload } => {
            let stored = backend.insert(&table, from_json(&payload)?).await?;
            Ok(Reply::Row(to_json(&stored)?))
        }
        Request::Patch { table, id, partial } => {
            let stored = backend.patch(&table, &id, from_json(&partial)?).await?;
            Ok(Reply::Row(to_json(&stored)?))
        }
        Request::Delete { table, id } => {
            backend.delete(&table, &id).await?;
            Ok(Reply::Done)
        }
        other => Err(BackendError::Transport(format!("request not served here: {other:?}"))),
    }
}

async fn forward_changes(mut stream: ChangeStream, out: mpsc::UnboundedSender<WireMessage>) {
    let subscription_id = stream.id().0;
    loop {
        let frame = match stream.recv().await {
            Ok(notification) => match WireMessage::change(stream.id(), &notification) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Dropping unencodable change on {}: {e}", stream.table());
                    continue;
                }
            },
            Err(StreamError::Lagged(skipped)) => WireMessage::Lagged { subscription_id, skipped },
            Err(StreamError::Closed) => {
                let _ = out.send(WireMessage::StreamClosed { subscription_id });
                return;
            }
        };
        if out.send(frame).is_err() {
            return;
        }
    }
}
