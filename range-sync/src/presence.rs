//! Live cursor presence for a shared dashboard panel.
//!
//! ## Architecture
//!
//! ```text
//! pointer move ──► CursorBroadcaster::update_pointer()   (normalize 0..=100)
//!                        │
//!                        ▼  every 100ms, latest position only
//!                  PresenceLink::track(record)
//!                        │
//!                        ▼
//!              substrate (PresenceHub / SyncServer)
//!                        │  Sync / Join / Leave
//!                        ▼
//!              PresenceRoom::handle_event()  (self filtered out)
//! ```
//!
//! The substrate owns membership. A client that vanishes without a goodbye
//! is dropped by the substrate when its channel closes, and peers get a
//! `Leave` from there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use range_core::{normalize_pointer, CursorColor, PresenceRecord};

// ───────────────────────────────────────────────────────────────────
// Events and the peer room
// ───────────────────────────────────────────────────────────────────

/// Membership change delivered by the presence substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceEvent {
    /// Authoritative membership, replaces whatever the room held.
    Sync { peers: Vec<PresenceRecord> },
    /// A peer joined or re-broadcast its position.
    Join { peer: PresenceRecord },
    Leave { client_id: Uuid },
}

/// Remote peers on one panel, as seen by one local client.
#[derive(Debug)]
pub struct PresenceRoom {
    local_id: Uuid,
    peers: HashMap<Uuid, PresenceRecord>,
    closed: bool,
}

impl PresenceRoom {
    pub fn new(local_id: Uuid) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            closed: false,
        }
    }

    /// Fold one event in. Returns whether the peer map changed.
    ///
    /// Records for the local client never enter the map.
    pub fn handle_event(&mut self, event: &PresenceEvent) -> bool {
        if self.closed {
            return false;
        }
        match event {
            PresenceEvent::Sync { peers } => {
                self.peers = peers
                    .iter()
                    .filter(|p| p.client_id != self.local_id)
                    .map(|p| (p.client_id, p.clone()))
                    .collect();
                true
            }
            PresenceEvent::Join { peer } => {
                if peer.client_id == self.local_id {
                    return false;
                }
                self.peers.insert(peer.client_id, peer.clone());
                true
            }
            PresenceEvent::Leave { client_id } => self.peers.remove(client_id).is_some(),
        }
    }

    /// Peers ordered by join time, then id.
    pub fn peers(&self) -> Vec<PresenceRecord> {
        let mut peers: Vec<PresenceRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.client_id.cmp(&b.client_id)));
        peers
    }

    pub fn peer(&self, client_id: &Uuid) -> Option<&PresenceRecord> {
        self.peers.get(client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Drop all peers and ignore every later event.
    pub fn close(&mut self) {
        self.closed = true;
        self.peers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

// ───────────────────────────────────────────────────────────────────
// Transport seam
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("presence channel closed")]
    Closed,

    #[error("presence transport error: {0}")]
    Transport(String),
}

/// Outbound half of an open presence channel.
pub trait PresenceLink: Send + Sync {
    /// Broadcast the local record to the panel.
    fn track(&self, record: PresenceRecord) -> BoxFuture<'_, Result<(), PresenceError>>;

    /// Leave the panel. Never blocks; later `track` calls fail.
    fn close(&self);
}

/// An open presence channel on one panel.
pub struct PresenceChannel {
    panel_id: String,
    events: mpsc::UnboundedReceiver<PresenceEvent>,
    link: Arc<dyn PresenceLink>,
}

impl PresenceChannel {
    pub fn new(
        panel_id: impl Into<String>,
        events: mpsc::UnboundedReceiver<PresenceEvent>,
        link: Arc<dyn PresenceLink>,
    ) -> Self {
        Self {
            panel_id: panel_id.into(),
            events,
            link,
        }
    }

    pub fn panel_id(&self) -> &str {
        &self.panel_id
    }

    pub async fn track(&self, record: PresenceRecord) -> Result<(), PresenceError> {
        self.link.track(record).await
    }

    /// Next membership event; `None` once the substrate has gone away.
    pub async fn recv(&mut self) -> Option<PresenceEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        self.link.close();
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<PresenceEvent>, Arc<dyn PresenceLink>) {
        (self.events, self.link)
    }
}

impl std::fmt::Debug for PresenceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceChannel")
            .field("panel_id", &self.panel_id)
            .finish()
    }
}

/// Something that can open presence channels.
pub trait PresenceTransport: Send + Sync {
    fn open<'a>(&'a self, panel_id: &'a str) -> BoxFuture<'a, Result<PresenceChannel, PresenceError>>;
}

// ───────────────────────────────────────────────────────────────────
// Cursor broadcaster
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub panel_id: String,
    pub display_name: String,
    /// Re-broadcast period.
    pub interval: Duration,
}

impl BroadcasterConfig {
    pub fn new(panel_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            panel_id: panel_id.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            panel_id: "main".into(),
            display_name: "Analyst".into(),
            interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterState {
    /// Channel open, no membership snapshot yet.
    Joining,
    Synced,
    Left,
}

struct BroadcasterShared {
    room: Mutex<PresenceRoom>,
    local: Mutex<PresenceRecord>,
    state: Mutex<BroadcasterState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shares this client's cursor on a panel and tracks everyone else's.
pub struct CursorBroadcaster {
    client_id: Uuid,
    panel_id: String,
    shared: Arc<BroadcasterShared>,
    link: Arc<dyn PresenceLink>,
    ticker: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl CursorBroadcaster {
    /// Open the panel channel, announce ourselves, and start re-broadcasting.
    pub async fn join(
        transport: &dyn PresenceTransport,
        config: BroadcasterConfig,
    ) -> Result<Self, PresenceError> {
        let client_id = Uuid::new_v4();
        let local = PresenceRecord::new(client_id, config.display_name.clone(), config.panel_id.clone());

        let channel = transport.open(&config.panel_id).await?;
        let (mut events, link) = channel.into_parts();

        let shared = Arc::new(BroadcasterShared {
            room: Mutex::new(PresenceRoom::new(client_id)),
            local: Mutex::new(local.clone()),
            state: Mutex::new(BroadcasterState::Joining),
        });

        if let Err(e) = link.track(local).await {
            log::debug!("Initial presence broadcast on {} failed: {e}", config.panel_id);
        }

        let receiver = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let synced = matches!(event, PresenceEvent::Sync { .. });
                    lock(&shared.room).handle_event(&event);
                    if synced {
                        let mut state = lock(&shared.state);
                        if *state == BroadcasterState::Joining {
                            *state = BroadcasterState::Synced;
                        }
                    }
                }
                log::debug!("Presence event stream ended");
            })
        };

        let ticker = {
            let shared = Arc::clone(&shared);
            let link = Arc::clone(&link);
            let period = config.interval.max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // First tick fires immediately; the join broadcast already covered it.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let record = {
                        let mut local = lock(&shared.local);
                        local.last_seen_at = range_core::now_millis();
                        local.clone()
                    };
                    log::trace!("Broadcasting cursor {} at ({}, {})", record.client_id, record.x, record.y);
                    if let Err(e) = link.track(record).await {
                        log::debug!("Presence broadcast failed, retrying next tick: {e}");
                    }
                }
            })
        };

        log::info!("Joined presence on panel {}", config.panel_id);
        Ok(Self {
            client_id,
            panel_id: config.panel_id,
            shared,
            link,
            ticker: Some(ticker),
            receiver: Some(receiver),
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn panel_id(&self) -> &str {
        &self.panel_id
    }

    pub fn color(&self) -> CursorColor {
        lock(&self.shared.local).color
    }

    /// Record a raw pointer sample relative to a `width` x `height` panel.
    pub fn update_pointer(&self, px: f32, py: f32, width: f32, height: f32) {
        let (x, y) = normalize_pointer(px, py, width, height);
        self.set_position(x, y);
    }

    /// Set the already-normalized position. Sent on the next tick.
    pub fn set_position(&self, x: f32, y: f32) {
        let mut local = lock(&self.shared.local);
        local.x = x.clamp(0.0, 100.0);
        local.y = y.clamp(0.0, 100.0);
    }

    /// The record the next tick will send.
    pub fn local(&self) -> PresenceRecord {
        lock(&self.shared.local).clone()
    }

    /// Send the current position without waiting for the next tick.
    pub async fn broadcast_now(&self) -> Result<(), PresenceError> {
        if self.state() == BroadcasterState::Left {
            return Err(PresenceError::Closed);
        }
        let record = {
            let mut local = lock(&self.shared.local);
            local.last_seen_at = range_core::now_millis();
            local.clone()
        };
        self.link.track(record).await
    }

    /// Everyone else on the panel.
    pub fn peers(&self) -> Vec<PresenceRecord> {
        lock(&self.shared.room).peers()
    }

    pub fn state(&self) -> BroadcasterState {
        *lock(&self.shared.state)
    }

    /// Stop broadcasting and leave. No goodbye is sent; the substrate
    /// announces the departure when the channel closes.
    pub fn leave(&mut self) {
        {
            let mut state = lock(&self.shared.state);
            if *state == BroadcasterState::Left {
                return;
            }
            *state = BroadcasterState::Left;
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        lock(&self.shared.room).close();
        self.link.close();
        log::info!("Left presence on panel {}", self.panel_id);
    }
}

impl Drop for CursorBroadcaster {
    fn drop(&mut self) {
        self.leave();
    }
}

impl std::fmt::Debug for CursorBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorBroadcaster")
            .field("client_id", &self.client_id)
            .field("panel_id", &self.panel_id)
            .field("state", &self.state())
            .finish()
    }
}
