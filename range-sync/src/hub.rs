//! In-process presence substrate.
//!
//! One broadcast group per panel. Every open channel gets its own forwarder
//! task that relays the group's events, so a slow consumer lags on its own
//! receiver instead of stalling the panel. A lagging forwarder recovers by
//! sending a fresh `Sync`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use range_core::PresenceRecord;

use crate::presence::{PresenceChannel, PresenceError, PresenceEvent, PresenceLink, PresenceTransport};

/// Default per-receiver buffer for a panel's broadcast group.
pub const DEFAULT_HUB_CAPACITY: usize = 256;

/// Channels on one panel and what each has announced.
struct PanelGroup {
    sender: broadcast::Sender<PresenceEvent>,
    /// Channel id to its last tracked record (`None` until it tracks).
    members: HashMap<u64, Option<PresenceRecord>>,
}

impl PanelGroup {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: HashMap::new(),
        }
    }

    fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut peers: Vec<PresenceRecord> = self.members.values().flatten().cloned().collect();
        peers.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.client_id.cmp(&b.client_id)));
        peers
    }
}

struct HubInner {
    panels: Mutex<HashMap<String, PanelGroup>>,
    capacity: usize,
    next_channel: AtomicU64,
}

impl HubInner {
    fn panels(&self) -> MutexGuard<'_, HashMap<String, PanelGroup>> {
        self.panels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self, panel_id: &str) -> Option<Vec<PresenceRecord>> {
        self.panels().get(panel_id).map(PanelGroup::snapshot)
    }

    fn track(&self, panel_id: &str, channel: u64, record: PresenceRecord) -> Result<(), PresenceError> {
        let mut panels = self.panels();
        let group = panels.get_mut(panel_id).ok_or(PresenceError::Closed)?;
        let slot = group.members.get_mut(&channel).ok_or(PresenceError::Closed)?;
        *slot = Some(record.clone());
        let receivers = group.sender.send(PresenceEvent::Join { peer: record }).unwrap_or(0);
        log::trace!("Presence update on {panel_id} fanned out to {receivers} channels");
        Ok(())
    }

    fn depart(&self, panel_id: &str, channel: u64) {
        let mut panels = self.panels();
        let Some(group) = panels.get_mut(panel_id) else {
            return;
        };
        if let Some(Some(record)) = group.members.remove(&channel) {
            let _ = group.sender.send(PresenceEvent::Leave {
                client_id: record.client_id,
            });
            log::debug!("{} left panel {panel_id}", record.display_name);
        }
        if group.members.is_empty() {
            panels.remove(panel_id);
            log::debug!("Removed empty presence panel {panel_id}");
        }
    }
}

/// Panel-scoped presence groups shared by every channel opened through it.
#[derive(Clone)]
pub struct PresenceHub {
    inner: Arc<HubInner>,
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}

impl PresenceHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                panels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    /// Join `panel_id`. The first event on the channel is a `Sync` with the
    /// current membership. Must be called inside a tokio runtime.
    pub fn open_channel(&self, panel_id: &str) -> PresenceChannel {
        let channel = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::unbounded_channel();

        // Subscribe and snapshot under one lock so no event falls between.
        let rx = {
            let mut panels = self.inner.panels();
            let group = panels
                .entry(panel_id.to_string())
                .or_insert_with(|| PanelGroup::new(self.inner.capacity));
            group.members.insert(channel, None);
            let _ = tx.send(PresenceEvent::Sync {
                peers: group.snapshot(),
            });
            group.sender.subscribe()
        };

        let forwarder = tokio::spawn(forward(Arc::clone(&self.inner), panel_id.to_string(), rx, tx));
        log::debug!("Opened presence channel {channel} on {panel_id}");

        let link = HubLink {
            inner: Arc::clone(&self.inner),
            panel_id: panel_id.to_string(),
            channel,
            forwarder: Mutex::new(Some(forwarder)),
            closed: AtomicBool::new(false),
        };
        PresenceChannel::new(panel_id, events, Arc::new(link))
    }

    /// Tracked members of `panel_id`.
    pub fn members(&self, panel_id: &str) -> Vec<PresenceRecord> {
        self.inner.snapshot(panel_id).unwrap_or_default()
    }

    /// Number of panels with at least one open channel.
    pub fn panel_count(&self) -> usize {
        self.inner.panels().len()
    }
}

impl PresenceTransport for PresenceHub {
    fn open<'a>(&'a self, panel_id: &'a str) -> BoxFuture<'a, Result<PresenceChannel, PresenceError>> {
        Box::pin(async move { Ok(self.open_channel(panel_id)) })
    }
}

async fn forward(
    inner: Arc<HubInner>,
    panel_id: String,
    mut rx: broadcast::Receiver<PresenceEvent>,
    tx: mpsc::UnboundedSender<PresenceEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("Presence forwarder on {panel_id} lagged by {skipped}, resending membership");
                match inner.snapshot(&panel_id) {
                    Some(peers) => PresenceEvent::Sync { peers },
                    None => return,
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}

struct HubLink {
    inner: Arc<HubInner>,
    panel_id: String,
    channel: u64,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PresenceLink for HubLink {
    fn track(&self, record: PresenceRecord) -> BoxFuture<'_, Result<(), PresenceError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PresenceError::Closed);
            }
            self.inner.track(&self.panel_id, self.channel, record)
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        self.inner.depart(&self.panel_id, self.channel);
    }
}

impl Drop for HubLink {
    fn drop(&mut self) {
        self.close();
    }
}
