//! # range-core — Shared record types for the cyber range sync layer
//!
//! Everything here is plain data plus pure functions. No I/O, no runtime.
//!
//! ## Modules
//!
//! - [`record`] — `SyncRecord` trait and per-collection ordering config
//! - [`change`] — Insert/Update/Delete change notifications
//! - [`entities`] — The six synced security collections
//! - [`views`] — Derived projections over network assets
//! - [`presence`] — Ephemeral cursor presence records

pub mod change;
pub mod entities;
pub mod presence;
pub mod record;
pub mod views;

pub use change::{ChangeKind, ChangeNotification};
pub use entities::{
    AttackCampaign, Investigation, Ioc, NetworkAsset, SecurityEvent, Severity, ThreatActor,
    VulnerabilityFinding,
};
pub use presence::{normalize_pointer, CursorColor, PresenceRecord, CURSOR_PALETTE};
pub use record::{CollectionConfig, SortDirection, SyncRecord};
pub use views::{
    assets_by_zone, compromised_assets, vulnerability_correlation, VulnerabilityCorrelation,
    UNKNOWN_ZONE,
};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
