//! Per-entity stores and the dashboard bundle.

use std::sync::Arc;

use range_core::{AttackCampaign, Investigation, Ioc, SecurityEvent, SyncRecord, ThreatActor};

use crate::assets::NetworkAssetStore;
use crate::backend::Backend;
use crate::store::{CollectionStore, StoreError, SubscriptionHandle};

pub type SecurityEventStore = CollectionStore<SecurityEvent>;
pub type IocStore = CollectionStore<Ioc>;
pub type ThreatActorStore = CollectionStore<ThreatActor>;
pub type CampaignStore = CollectionStore<AttackCampaign>;
pub type InvestigationStore = CollectionStore<Investigation>;

/// Store for `T` using its default ordering and retention.
pub fn open_store<T: SyncRecord>(backend: Arc<dyn Backend>) -> CollectionStore<T> {
    CollectionStore::with_defaults(backend)
}

/// All six collections behind one backend.
#[derive(Clone)]
pub struct RangeStores {
    pub security_events: SecurityEventStore,
    pub iocs: IocStore,
    pub threat_actors: ThreatActorStore,
    pub campaigns: CampaignStore,
    pub investigations: InvestigationStore,
    pub network_assets: NetworkAssetStore,
}

impl RangeStores {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            security_events: open_store(backend.clone()),
            iocs: open_store(backend.clone()),
            threat_actors: open_store(backend.clone()),
            campaigns: open_store(backend.clone()),
            investigations: open_store(backend.clone()),
            network_assets: NetworkAssetStore::new(backend),
        }
    }

    /// Load every collection. Each store records its own failure; the
    /// first error is returned after all loads have settled.
    pub async fn initialize_all(&self) -> Result<(), StoreError> {
        let results = [
            self.security_events.initialize().await.map(drop),
            self.iocs.initialize().await.map(drop),
            self.threat_actors.initialize().await.map(drop),
            self.campaigns.initialize().await.map(drop),
            self.investigations.initialize().await.map(drop),
            self.network_assets.initialize().await.map(drop),
        ];
        results.into_iter().collect()
    }

    /// Open every change feed. Stops at the first failure.
    pub async fn subscribe_all(&self) -> Result<Vec<SubscriptionHandle>, StoreError> {
        Ok(vec![
            self.security_events.subscribe().await?,
            self.iocs.subscribe().await?,
            self.threat_actors.subscribe().await?,
            self.campaigns.subscribe().await?,
            self.investigations.subscribe().await?,
            self.network_assets.subscribe().await?,
        ])
    }

    pub async fn close_all(&self) {
        self.security_events.close().await;
        self.iocs.close().await;
        self.threat_actors.close().await;
        self.campaigns.close().await;
        self.investigations.close().await;
        self.network_assets.close().await;
    }
}
