//! The six security collections mirrored by the dashboard.
//!
//! Field sets are what the panels read. Anything else the backing store
//! returns is kept in `extra` so a decode/encode pass never loses data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::record::{CollectionConfig, SyncRecord};

/// Severity scale shared by events, IOCs, findings and investigations.
///
/// Declaration order is rank order: `Critical` sorts first.
/// Unrecognized strings decode as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    #[serde(other)]
    Unknown,
}

impl Severity {
    /// 0 = most severe.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
            Severity::Unknown => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Unknown => "unknown",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Unknown
    }
}

macro_rules! sync_record {
    ($ty:ty, $table:literal, $config:ident) => {
        impl SyncRecord for $ty {
            const TABLE: &'static str = $table;

            fn id(&self) -> &str {
                &self.id
            }

            fn collection_config() -> CollectionConfig {
                CollectionConfig::$config()
            }
        }
    };
}

/// A detection surfaced by the SIEM views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub destination_ip: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub detected_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

sync_record!(SecurityEvent, "security_events", security_events);

/// Indicator of compromise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ioc {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// ip, domain, hash, url, email...
    #[serde(default)]
    pub ioc_type: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub first_seen: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

sync_record!(Ioc, "iocs", iocs);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreatActor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub motivation: Option<String>,
    #[serde(default)]
    pub sophistication: Option<String>,
    #[serde(default)]
    pub active: bool,
    /// MITRE ATT&CK technique ids.
    #[serde(default)]
    pub ttps: Vec<String>,
    #[serde(default)]
    pub first_seen: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

sync_record!(ThreatActor, "threat_actors", threat_actors);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttackCampaign {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub threat_actor_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

sync_record!(AttackCampaign, "attack_campaigns", attack_campaigns);

/// Incident-response case tracked on the IR board.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Investigation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Severity,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub related_event_ids: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

sync_record!(Investigation, "investigations", investigations);

/// One vulnerability reported against an asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityFinding {
    pub cve: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub title: Option<String>,
}

impl VulnerabilityFinding {
    pub fn new(cve: impl Into<String>, severity: Severity) -> Self {
        Self {
            cve: cve.into(),
            severity,
            title: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkAsset {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub asset_type: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    /// Network segment, e.g. "DMZ". Missing means unknown.
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub compromised: bool,
    #[serde(default)]
    pub risk_score: f64,
    #[serde(default)]
    pub vulnerabilities: Vec<VulnerabilityFinding>,
    #[serde(default)]
    pub last_scan: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NetworkAsset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_finding(mut self, cve: impl Into<String>, severity: Severity) -> Self {
        self.vulnerabilities.push(VulnerabilityFinding::new(cve, severity));
        self
    }

    pub fn compromised(mut self) -> Self {
        self.compromised = true;
        self
    }
}

sync_record!(NetworkAsset, "network_assets", network_assets);
