//! Record contract shared by every synced collection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record that can be mirrored from a remote collection.
///
/// The sync engine only ever looks at `id`; every other field is payload.
pub trait SyncRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Backing-store table this record type lives in.
    const TABLE: &'static str;

    /// Opaque identifier assigned by the backing store.
    fn id(&self) -> &str;

    /// Default ordering and retention for this record type.
    fn collection_config() -> CollectionConfig;
}

/// Sort direction for the initial bulk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl Default for SortDirection {
    fn default() -> Self {
        SortDirection::Descending
    }
}

/// Per-collection sync configuration: which table, how to order the bulk
/// read, and how many records to retain locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub table: String,
    pub order_field: String,
    pub direction: SortDirection,
    /// Retention bound. `None` keeps everything.
    pub limit: Option<usize>,
}

impl CollectionConfig {
    pub fn new(
        table: impl Into<String>,
        order_field: impl Into<String>,
        direction: SortDirection,
    ) -> Self {
        Self {
            table: table.into(),
            order_field: order_field.into(),
            direction,
            limit: None,
        }
    }

    /// Cap the local cache at `limit` records.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Drop any retention bound.
    pub fn unbounded(mut self) -> Self {
        self.limit = None;
        self
    }

    pub fn security_events() -> Self {
        Self::new("security_events", "detected_at", SortDirection::Descending).with_limit(100)
    }

    pub fn iocs() -> Self {
        Self::new("iocs", "last_seen", SortDirection::Descending).with_limit(200)
    }

    pub fn threat_actors() -> Self {
        Self::new("threat_actors", "last_seen", SortDirection::Descending)
    }

    pub fn attack_campaigns() -> Self {
        Self::new("attack_campaigns", "start_time", SortDirection::Descending)
    }

    pub fn investigations() -> Self {
        Self::new("investigations", "created_at", SortDirection::Descending)
    }

    pub fn network_assets() -> Self {
        Self::new("network_assets", "risk_score", SortDirection::Descending)
    }
}
