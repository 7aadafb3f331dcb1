//! Routes client writes to the current replica set of each shard.

use crate::cluster::ownership::CollectionCatalog;
use crate::error::{Error, Result};
use crate::storage::ShardStoreProvider;
use crate::types::{Mutation, PeerId, Point, PointId, ShardId, ShardKey};
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use twox_hash::XxHash64;

/// Seed used for point-to-shard hashing. Changing it reshuffles every
/// collection.
pub const ROUTING_SEED: u64 = 0;

/// Shard a point id belongs to.
pub fn shard_for_point(id: PointId, shard_count: u32) -> ShardId {
    let mut hasher = XxHash64::with_seed(ROUTING_SEED);
    id.hash(&mut hasher);
    (hasher.finish() % shard_count.max(1) as u64) as ShardId
}

/// Client write path.
pub struct WriteRouter {
    catalog: Arc<CollectionCatalog>,
    stores: Arc<dyn ShardStoreProvider>,
    write_timeout: Duration,
    retry_backoff: Duration,
}

impl WriteRouter {
    pub fn new(
        catalog: Arc<CollectionCatalog>,
        stores: Arc<dyn ShardStoreProvider>,
        write_timeout: Duration,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            catalog,
            stores,
            write_timeout,
            retry_backoff,
        }
    }

    /// Upsert points. Returns how many were written.
    pub async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<usize> {
        let mutations = points.into_iter().map(Mutation::Upsert).collect();
        self.apply(collection, mutations).await
    }

    /// Delete points by id. Returns how many deletes were written.
    pub async fn delete(&self, collection: &str, ids: Vec<PointId>) -> Result<usize> {
        let mutations = ids.into_iter().map(Mutation::Delete).collect();
        self.apply(collection, mutations).await
    }

    async fn apply(&self, collection: &str, mutations: Vec<Mutation>) -> Result<usize> {
        let layout = self.catalog.layout(collection)?;

        let mut by_shard: BTreeMap<ShardId, Vec<Mutation>> = BTreeMap::new();
        for mutation in mutations {
            let shard_id = shard_for_point(mutation.point_id(), layout.shard_count);
            by_shard.entry(shard_id).or_default().push(mutation);
        }

        let mut written = 0;
        for (shard_id, mutations) in by_shard {
            let key = ShardKey::new(collection, shard_id);
            for mutation in mutations {
                self.write(&key, mutation).await?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Write one mutation to every replica of `key`.
    ///
    /// Replicas that refuse because they are sealed or gone are retried
    /// against the re-resolved replica set until the write timeout. A
    /// replica that accepted the write is never written again.
    pub async fn write(&self, key: &ShardKey, mutation: Mutation) -> Result<()> {
        let deadline = Instant::now() + self.write_timeout;
        let mut done: HashSet<PeerId> = HashSet::new();
        let mut backoff = self.retry_backoff;
        let mut attempt = 0u32;

        loop {
            let pending: Vec<PeerId> = self
                .catalog
                .owners(key)?
                .into_iter()
                .filter(|p| !done.contains(p))
                .collect();

            let mut retry: Option<Error> = None;
            for peer_id in pending {
                let result = match self.stores.store(peer_id) {
                    Ok(store) => store.write(key, mutation.clone()).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(_) => {
                        done.insert(peer_id);
                    }
                    Err(e) if e.is_retryable_write() => retry = Some(e),
                    Err(e) => return Err(e),
                }
            }

            let Some(error) = retry else {
                return Ok(());
            };

            attempt += 1;
            if Instant::now() + backoff > deadline {
                tracing::warn!(
                    shard = %key,
                    point_id = mutation.point_id(),
                    attempt,
                    error = %error,
                    "Write timed out waiting for replica set"
                );
                return Err(Error::Timeout);
            }
            tracing::debug!(
                shard = %key,
                point_id = mutation.point_id(),
                attempt,
                error = %error,
                "Retrying write"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(200));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::{LocalShardStore, LocalStores, ReplicaState, ShardStore};

    struct Fixture {
        catalog: Arc<CollectionCatalog>,
        stores: Arc<LocalStores>,
        locals: Vec<Arc<LocalShardStore>>,
    }

    async fn fixture(replication_factor: usize) -> Fixture {
        let catalog = Arc::new(CollectionCatalog::new());
        let layout = catalog
            .create_collection("benchmark", 4, replication_factor, &[1, 2, 3])
            .unwrap();

        let stores = Arc::new(LocalStores::new());
        let mut locals = Vec::new();
        for peer_id in 1..=3 {
            let store = Arc::new(LocalShardStore::new(peer_id, StoreConfig::default()));
            for (shard_id, placement) in &layout.shards {
                if placement.has_replica(peer_id) {
                    store
                        .create_replica(&ShardKey::new("benchmark", *shard_id))
                        .await
                        .unwrap();
                }
            }
            stores.insert(store.clone());
            locals.push(store);
        }
        Fixture { catalog, stores, locals }
    }

    fn router(f: &Fixture, timeout: Duration) -> WriteRouter {
        WriteRouter::new(
            f.catalog.clone(),
            f.stores.clone(),
            timeout,
            Duration::from_millis(2),
        )
    }

    #[test]
    fn test_shard_for_point_is_stable() {
        for id in 0..100 {
            let shard = shard_for_point(id, 6);
            assert!(shard < 6);
            assert_eq!(shard, shard_for_point(id, 6));
        }
        assert_eq!(shard_for_point(42, 1), 0);
    }

    #[tokio::test]
    async fn test_upsert_reaches_every_replica() {
        let f = fixture(2).await;
        let router = router(&f, Duration::from_secs(1));
        let points = (0..40).map(|i| Point::new(i, vec![i as f32])).collect();
        assert_eq!(router.upsert("benchmark", points).await.unwrap(), 40);

        let total: u64 = f
            .locals
            .iter()
            .flat_map(|s| s.keys().into_iter().map(move |k| s.point_count(&k)))
            .sum();
        assert_eq!(total, 80);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let f = fixture(1).await;
        let router = router(&f, Duration::from_secs(1));
        assert!(matches!(
            router.upsert("missing", vec![Point::new(1, vec![0.0])]).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sealed_replica_times_out() {
        let f = fixture(1).await;
        let id = 7;
        let key = ShardKey::new("benchmark", shard_for_point(id, 4));
        let owner = f.catalog.owners(&key).unwrap()[0];
        let store = f.stores.store(owner).unwrap();
        store.set_state(&key, ReplicaState::Sealed).await.unwrap();

        let router = router(&f, Duration::from_millis(30));
        assert!(matches!(
            router.upsert("benchmark", vec![Point::new(id, vec![1.0])]).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_write_follows_ownership_flip() {
        let f = fixture(1).await;
        let id = 11;
        let key = ShardKey::new("benchmark", shard_for_point(id, 4));
        let from = f.catalog.owners(&key).unwrap()[0];
        let to = (1..=3).find(|p| *p != from).unwrap();

        let source = f.stores.store(from).unwrap();
        let dest = f.stores.store(to).unwrap();
        source.set_state(&key, ReplicaState::Sealed).await.unwrap();
        let (blob, _) = source.snapshot(&key).await.unwrap();
        dest.load_snapshot(&key, blob).await.unwrap();
        f.catalog.begin_receiving(&key, from, to).unwrap();

        let catalog = f.catalog.clone();
        let flip_key = key.clone();
        let flip = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            dest.set_state(&flip_key, ReplicaState::Active).await.unwrap();
            catalog.cutover(&flip_key, from, to).unwrap();
        });

        let router = router(&f, Duration::from_secs(2));
        router
            .upsert("benchmark", vec![Point::new(id, vec![3.0])])
            .await
            .unwrap();
        flip.await.unwrap();

        let dest = f.stores.store(to).unwrap();
        assert_eq!(dest.scroll(&key, id, 1).await.unwrap()[0].id, id);
        assert_eq!(source.current_sequence(&key).await.unwrap(), 0);
    }
}
