//! Derived projections over the network-asset collection.
//!
//! Pure and deterministic: same asset slice in, same output out.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::entities::{NetworkAsset, Severity};

/// Zone key for assets with no zone attribute.
pub const UNKNOWN_ZONE: &str = "Unknown";

/// All findings for one CVE across the asset inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityCorrelation {
    pub cve: String,
    /// Most severe severity reported for this CVE.
    pub severity: Severity,
    /// Number of findings, one per (asset, finding) pair.
    pub count: usize,
    /// Affected asset names in first-observation order, deduplicated.
    pub assets: Vec<String>,
}

/// Group every finding by CVE, most severe first.
///
/// Ties keep the order in which each CVE was first observed.
pub fn vulnerability_correlation(assets: &[NetworkAsset]) -> Vec<VulnerabilityCorrelation> {
    let mut groups: Vec<VulnerabilityCorrelation> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for asset in assets {
        for finding in &asset.vulnerabilities {
            let slot = match index.get(finding.cve.as_str()) {
                Some(&slot) => slot,
                None => {
                    index.insert(finding.cve.as_str(), groups.len());
                    groups.push(VulnerabilityCorrelation {
                        cve: finding.cve.clone(),
                        severity: finding.severity,
                        count: 0,
                        assets: Vec::new(),
                    });
                    groups.len() - 1
                }
            };

            let group = &mut groups[slot];
            group.count += 1;
            if finding.severity < group.severity {
                group.severity = finding.severity;
            }
            if !group.assets.iter().any(|name| name == &asset.name) {
                group.assets.push(asset.name.clone());
            }
        }
    }

    // Stable sort keeps first-observation order within a severity.
    groups.sort_by_key(|g| g.severity.rank());
    groups
}

/// Partition assets by zone. Blank or missing zones land under [`UNKNOWN_ZONE`].
pub fn assets_by_zone(assets: &[NetworkAsset]) -> BTreeMap<String, Vec<NetworkAsset>> {
    let mut zones: BTreeMap<String, Vec<NetworkAsset>> = BTreeMap::new();
    for asset in assets {
        let zone = asset
            .zone
            .as_deref()
            .map(str::trim)
            .filter(|z| !z.is_empty())
            .unwrap_or(UNKNOWN_ZONE);
        zones.entry(zone.to_string()).or_default().push(asset.clone());
    }
    zones
}

pub fn compromised_assets(assets: &[NetworkAsset]) -> Vec<NetworkAsset> {
    assets.iter().filter(|a| a.compromised).cloned().collect()
}
