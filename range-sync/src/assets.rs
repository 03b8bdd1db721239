//! Network-asset store with memoized derived views.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use range_core::{
    assets_by_zone, compromised_assets, vulnerability_correlation, NetworkAsset,
    VulnerabilityCorrelation,
};

use crate::backend::Backend;
use crate::store::{CollectionStore, StoreOptions};

/// Views computed from one cache version.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetViews {
    pub version: u64,
    pub correlation: Vec<VulnerabilityCorrelation>,
    pub by_zone: BTreeMap<String, Vec<NetworkAsset>>,
    pub compromised: Vec<NetworkAsset>,
}

impl AssetViews {
    pub fn compute(version: u64, assets: &[NetworkAsset]) -> Self {
        Self {
            version,
            correlation: vulnerability_correlation(assets),
            by_zone: assets_by_zone(assets),
            compromised: compromised_assets(assets),
        }
    }
}

/// [`CollectionStore`] of network assets that also serves the derived views.
///
/// Views are recomputed only when the cache version has moved since the
/// last call.
#[derive(Clone)]
pub struct NetworkAssetStore {
    inner: CollectionStore<NetworkAsset>,
    memo: Arc<Mutex<Option<Arc<AssetViews>>>>,
}

impl NetworkAssetStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::from_store(CollectionStore::with_defaults(backend))
    }

    pub fn with_options(backend: Arc<dyn Backend>, options: StoreOptions) -> Self {
        Self::from_store(CollectionStore::new(
            backend,
            range_core::CollectionConfig::network_assets(),
            options,
        ))
    }

    pub fn from_store(inner: CollectionStore<NetworkAsset>) -> Self {
        Self {
            inner,
            memo: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn views(&self) -> Arc<AssetViews> {
        let (version, assets) = self.inner.versioned_snapshot().await;

        if let Ok(memo) = self.memo.lock() {
            if let Some(views) = memo.as_ref().filter(|v| v.version == version) {
                return Arc::clone(views);
            }
        }

        let views = Arc::new(AssetViews::compute(version, &assets));
        log::trace!("Recomputed asset views at version {version}");
        if let Ok(mut memo) = self.memo.lock() {
            // Never replace a newer memo with an older one.
            if memo.as_ref().is_none_or(|m| m.version <= version) {
                *memo = Some(Arc::clone(&views));
            }
        }
        views
    }

    pub async fn vulnerability_correlation(&self) -> Vec<VulnerabilityCorrelation> {
        self.views().await.correlation.clone()
    }

    pub async fn assets_by_zone(&self) -> BTreeMap<String, Vec<NetworkAsset>> {
        self.views().await.by_zone.clone()
    }

    pub async fn compromised_assets(&self) -> Vec<NetworkAsset> {
        self.views().await.compromised.clone()
    }
}

impl Deref for NetworkAssetStore {
    type Target = CollectionStore<NetworkAsset>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
