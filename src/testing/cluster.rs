//! In-process cluster for transfer scenarios.
//!
//! Every peer gets a [`LocalShardStore`] wrapped in a [`FaultyStore`], so a
//! test can inject failures per peer and operation. All peers share one
//! registry, ownership map, coordinator and write router, as they would on
//! the peer holding cluster metadata.

use crate::api::ClusterControl;
use crate::cluster::ownership::CollectionCatalog;
use crate::cluster::registry::PeerTable;
use crate::cluster::router::WriteRouter;
use crate::config::{StoreConfig, TransferConfig};
use crate::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::error::Result;
use crate::storage::{LocalShardStore, LocalStores, ShardStore};
use crate::testing::failpoint::{FailpointRegistry, FaultyStore};
use crate::transfer::{
    InMemoryTransferJournal, ShardTransfer, TransferCoordinator, TransferId, TransferMethod,
    TransferRequest,
};
use crate::types::{PeerId, PeerInfo, Point, PointId, ShardKey};
use std::sync::Arc;
use tracing::info;

/// Configuration for a [`LocalCluster`].
#[derive(Debug, Clone)]
pub struct LocalClusterConfig {
    /// Number of peers, with ids `1..=peers`.
    pub peers: usize,

    /// Transfer settings for the coordinator.
    pub transfer: TransferConfig,

    /// Settings for every peer's store.
    pub store: StoreConfig,
}

impl Default for LocalClusterConfig {
    fn default() -> Self {
        Self {
            peers: 3,
            transfer: TransferConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl LocalClusterConfig {
    pub fn new(peers: usize) -> Self {
        Self {
            peers,
            ..Default::default()
        }
    }

    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

/// A cluster whose peers live in one process.
pub struct LocalCluster {
    registry: Arc<PeerTable>,
    catalog: Arc<CollectionCatalog>,
    provider: Arc<LocalStores>,
    stores: Vec<Arc<LocalShardStore>>,
    failpoints: Vec<Arc<FailpointRegistry>>,
    journal: Arc<InMemoryTransferJournal>,
    coordinator: TransferCoordinator,
    router: Arc<WriteRouter>,
    control: ClusterControl,
}

impl LocalCluster {
    pub fn new(config: LocalClusterConfig) -> Self {
        let registry = Arc::new(PeerTable::new(PeerInfo::new(1, addr(1)), 3));
        let provider = Arc::new(LocalStores::new());
        let mut stores = Vec::with_capacity(config.peers);
        let mut failpoints = Vec::with_capacity(config.peers);

        for peer_id in 1..=config.peers as PeerId {
            if peer_id != 1 {
                registry.join(peer_id, addr(peer_id));
            }
            let store = Arc::new(LocalShardStore::new(peer_id, config.store.clone()));
            let faults = Arc::new(FailpointRegistry::new());
            provider.insert(Arc::new(FaultyStore::new(store.clone(), faults.clone())));
            stores.push(store);
            failpoints.push(faults);
        }

        let catalog = Arc::new(CollectionCatalog::new());
        let journal = Arc::new(InMemoryTransferJournal::new());
        let router = Arc::new(WriteRouter::new(
            catalog.clone(),
            provider.clone(),
            config.transfer.write_timeout,
            config.transfer.retry_backoff,
        ));
        let coordinator = TransferCoordinator::new(
            config.transfer,
            registry.clone(),
            catalog.clone(),
            provider.clone(),
            journal.clone(),
        );
        let control = ClusterControl::new(
            registry.clone(),
            catalog.clone(),
            provider.clone(),
            coordinator.clone(),
            router.clone(),
        );

        info!(peers = config.peers, "Local cluster started");
        Self {
            registry,
            catalog,
            provider,
            stores,
            failpoints,
            journal,
            coordinator,
            router,
            control,
        }
    }

    pub fn registry(&self) -> &Arc<PeerTable> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<CollectionCatalog> {
        &self.catalog
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    pub fn router(&self) -> &Arc<WriteRouter> {
        &self.router
    }

    pub fn control(&self) -> &ClusterControl {
        &self.control
    }

    pub fn journal(&self) -> &Arc<InMemoryTransferJournal> {
        &self.journal
    }

    /// The store of `peer_id`, bypassing failpoints.
    pub fn store(&self, peer_id: PeerId) -> &Arc<LocalShardStore> {
        &self.stores[peer_id as usize - 1]
    }

    /// Failpoints guarding the store of `peer_id`.
    pub fn failpoints(&self, peer_id: PeerId) -> &Arc<FailpointRegistry> {
        &self.failpoints[peer_id as usize - 1]
    }

    /// Create a collection over every peer.
    pub async fn create_collection(
        &self,
        name: &str,
        shard_count: u32,
        replication_factor: usize,
    ) -> Result<()> {
        self.control
            .create_collection(name, shard_count, replication_factor)
            .await?;
        Ok(())
    }

    /// Upsert points `ids` through the write router.
    pub async fn upsert(&self, collection: &str, ids: std::ops::Range<PointId>) -> Result<usize> {
        let points = ids.map(point).collect();
        self.router.upsert(collection, points).await
    }

    /// Start moving `key` from one peer to another.
    pub async fn move_shard(
        &self,
        key: &ShardKey,
        from: PeerId,
        to: PeerId,
        method: TransferMethod,
    ) -> Result<TransferId> {
        self.coordinator
            .initiate_transfer(TransferRequest::new(key.clone(), from, to).with_method(method))
            .await
    }

    /// Wait for a transfer to reach a terminal state.
    pub async fn wait(&self, id: TransferId) -> Result<ShardTransfer> {
        self.coordinator.wait_transfer(id).await
    }

    /// Make `peer_id` unreachable: its store disappears and the registry
    /// declares it dead.
    pub fn kill(&self, peer_id: PeerId) {
        self.provider.remove(peer_id);
        for _ in 0..3 {
            self.registry.mark_failed(peer_id);
        }
        info!(peer_id, "Peer killed");
    }

    /// Bring a killed peer back with the store it had.
    pub fn revive(&self, peer_id: PeerId) {
        let store: Arc<dyn ShardStore> = Arc::new(FaultyStore::new(
            self.store(peer_id).clone(),
            self.failpoints(peer_id).clone(),
        ));
        self.provider.insert(store);
        self.registry.mark_seen(peer_id);
        info!(peer_id, "Peer revived");
    }

    /// Compare every shard's replicas.
    pub async fn check_consistency(&self, collection: &str) -> Result<Vec<ConsistencyReport>> {
        ConsistencyChecker::new(self.provider.clone())
            .check_collection(&self.catalog, collection)
            .await
    }

    /// Distinct points of `collection`, counting each shard once on its
    /// first owner.
    pub async fn point_count(&self, collection: &str) -> Result<u64> {
        let layout = self.catalog.layout(collection)?;
        let mut total = 0;
        for (shard_id, placement) in &layout.shards {
            if let Some(owner) = placement.replicas.first() {
                total += self
                    .store(*owner)
                    .point_count(&ShardKey::new(collection, *shard_id));
            }
        }
        Ok(total)
    }
}

fn addr(peer_id: PeerId) -> String {
    format!("127.0.0.1:{}", 6334 + peer_id)
}

/// The point written for `id`.
pub fn point(id: PointId) -> Point {
    Point::new(id, vec![id as f32, (id % 13) as f32, 1.0])
        .with_payload("bucket", (id % 4).to_string())
}
