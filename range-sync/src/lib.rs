//! # range-sync — Realtime collection sync and presence for the cyber range
//!
//! Keeps local mirrors of remote security collections current and shares
//! live cursors between analysts on the same dashboard panel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  query/insert/patch/delete  ┌──────────────────┐
//! │ CollectionStore  │ ──────────────────────────► │ dyn Backend      │
//! │ (one per table)  │ ◄────── ChangeStream ────── │ Memory / Client  │
//! └────────┬─────────┘                             └────────┬─────────┘
//!          │ version ticks                                  │ WebSocket
//!          ▼                                                ▼
//! ┌──────────────────┐                             ┌──────────────────┐
//! │ NetworkAssetStore│                             │ SyncServer       │
//! │ memoized views   │                             │ + PresenceHub    │
//! └──────────────────┘                             └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`backend`] — Backend trait, change streams, backend errors
//! - [`memory`] — In-process backend with live change feeds
//! - [`cache`] — Pure reconciliation of change notifications
//! - [`store`] — Collection store lifecycle, writes, reconnect policy
//! - [`collections`] — Per-entity stores and the dashboard bundle
//! - [`assets`] — Network assets with memoized derived views
//! - [`presence`] — Cursor broadcaster and peer room
//! - [`hub`] — In-process presence substrate
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket client implementing Backend and PresenceTransport

pub mod assets;
pub mod backend;
pub mod cache;
pub mod client;
pub mod collections;
pub mod hub;
pub mod memory;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use assets::{AssetViews, NetworkAssetStore};
pub use backend::{
    Backend, BackendError, ChangeStream, QueryOptions, StreamError, StreamItem, SubscriptionId,
};
pub use cache::{CollectionCache, RecordChange};
pub use client::{ConnectionState, SyncClient};
pub use collections::{
    open_store, CampaignStore, InvestigationStore, IocStore, RangeStores, SecurityEventStore,
    ThreatActorStore,
};
pub use hub::PresenceHub;
pub use memory::MemoryBackend;
pub use presence::{
    BroadcasterConfig, BroadcasterState, CursorBroadcaster, PresenceChannel, PresenceError,
    PresenceEvent, PresenceLink, PresenceRoom, PresenceTransport,
};
pub use protocol::{ProtocolError, Reply, Request, WireChange, WireMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{
    CollectionStore, ReconnectPolicy, StoreError, StoreOptions, StreamState, SubscriptionHandle,
};
