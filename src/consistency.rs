//! Replica consistency checks.
//!
//! Scrolls every replica of a shard and reports points missing on some
//! replicas and points whose vector or payload differs between replicas.

use crate::cluster::ownership::CollectionCatalog;
use crate::error::Result;
use crate::storage::ShardStoreProvider;
use crate::types::{PeerId, Point, PointId, ShardKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Default number of points fetched per scroll request.
pub const DEFAULT_PAGE_SIZE: usize = 512;

/// A point absent from some replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingPoint {
    pub point_id: PointId,
    pub present_on: Vec<PeerId>,
    pub missing_on: Vec<PeerId>,
}

/// Which part of a point differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    Vector,
    Payload,
}

/// A point that differs between two replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub point_id: PointId,
    /// Replica the point was compared against.
    pub reference: PeerId,
    pub peer_id: PeerId,
    pub kind: MismatchKind,
}

/// Result of checking one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub key: ShardKey,
    /// Points held by each replica.
    pub point_counts: BTreeMap<PeerId, usize>,
    pub missing: Vec<MissingPoint>,
    pub mismatched: Vec<Mismatch>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Compares replicas through the store interface.
pub struct ConsistencyChecker {
    stores: Arc<dyn ShardStoreProvider>,
    page_size: usize,
}

impl ConsistencyChecker {
    pub fn new(stores: Arc<dyn ShardStoreProvider>) -> Self {
        Self {
            stores,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn load(&self, key: &ShardKey, peer_id: PeerId) -> Result<BTreeMap<PointId, Point>> {
        let store = self.stores.store(peer_id)?;
        let mut points = BTreeMap::new();
        let mut offset = 0;
        loop {
            let page = store.scroll(key, offset, self.page_size).await?;
            let full = page.len() == self.page_size;
            let last = page.last().map(|p| p.id);
            points.extend(page.into_iter().map(|p| (p.id, p)));
            match last.and_then(|id| id.checked_add(1)) {
                Some(next) if full => offset = next,
                _ => return Ok(points),
            }
        }
    }

    /// Compare the copies of `key` held by `peers`.
    pub async fn check_shard(&self, key: &ShardKey, peers: &[PeerId]) -> Result<ConsistencyReport> {
        let mut replicas = Vec::with_capacity(peers.len());
        for peer_id in peers {
            replicas.push((*peer_id, self.load(key, *peer_id).await?));
        }

        let ids: BTreeSet<PointId> = replicas
            .iter()
            .flat_map(|(_, points)| points.keys().copied())
            .collect();

        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        for id in ids {
            let (present, absent): (Vec<_>, Vec<_>) =
                replicas.iter().partition(|(_, points)| points.contains_key(&id));
            if !absent.is_empty() {
                missing.push(MissingPoint {
                    point_id: id,
                    present_on: present.iter().map(|(p, _)| *p).collect(),
                    missing_on: absent.iter().map(|(p, _)| *p).collect(),
                });
            }

            let Some(((reference, first), rest)) = present.split_first() else {
                continue;
            };
            let expected = &first[&id];
            for (peer_id, points) in rest {
                let point = &points[&id];
                if point.vector != expected.vector {
                    mismatched.push(Mismatch {
                        point_id: id,
                        reference: *reference,
                        peer_id: *peer_id,
                        kind: MismatchKind::Vector,
                    });
                }
                if point.payload != expected.payload {
                    mismatched.push(Mismatch {
                        point_id: id,
                        reference: *reference,
                        peer_id: *peer_id,
                        kind: MismatchKind::Payload,
                    });
                }
            }
        }

        let report = ConsistencyReport {
            key: key.clone(),
            point_counts: replicas.iter().map(|(p, points)| (*p, points.len())).collect(),
            missing,
            mismatched,
        };
        if report.is_consistent() {
            info!(shard = %key, replicas = peers.len(), "Replicas consistent");
        } else {
            warn!(
                shard = %key,
                missing = report.missing.len(),
                mismatched = report.mismatched.len(),
                "Replicas diverge"
            );
        }
        Ok(report)
    }

    /// Check every shard of `collection` against its current replica set.
    pub async fn check_collection(
        &self,
        catalog: &CollectionCatalog,
        collection: &str,
    ) -> Result<Vec<ConsistencyReport>> {
        let layout = catalog.layout(collection)?;
        let mut reports = Vec::with_capacity(layout.shards.len());
        for (shard_id, placement) in &layout.shards {
            let key = ShardKey::new(collection, *shard_id);
            reports.push(self.check_shard(&key, &placement.replicas).await?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::{LocalShardStore, LocalStores, ShardStore};
    use crate::types::Mutation;

    fn key() -> ShardKey {
        ShardKey::new("benchmark", 2)
    }

    async fn replicas() -> (Arc<LocalStores>, Arc<LocalShardStore>, Arc<LocalShardStore>) {
        let provider = Arc::new(LocalStores::new());
        let a = Arc::new(LocalShardStore::new(1, StoreConfig::default()));
        let b = Arc::new(LocalShardStore::new(2, StoreConfig::default()));
        provider.insert(a.clone());
        provider.insert(b.clone());
        for store in [&a, &b] {
            store.create_replica(&key()).await.unwrap();
            for id in 0..25 {
                store
                    .write(&key(), Mutation::Upsert(Point::new(id, vec![id as f32])))
                    .await
                    .unwrap();
            }
        }
        (provider, a, b)
    }

    #[tokio::test]
    async fn test_identical_replicas() {
        let (provider, _, _) = replicas().await;
        let checker = ConsistencyChecker::new(provider).with_page_size(7);
        let report = checker.check_shard(&key(), &[1, 2]).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.point_counts[&1], 25);
        assert_eq!(report.point_counts[&2], 25);
    }

    #[tokio::test]
    async fn test_reports_divergence() {
        let (provider, a, b) = replicas().await;
        a.write(&key(), Mutation::Delete(4)).await.unwrap();
        b.write(&key(), Mutation::Upsert(Point::new(9, vec![-1.0])))
            .await
            .unwrap();
        b.write(
            &key(),
            Mutation::Upsert(Point::new(10, vec![10.0]).with_payload("color", "red")),
        )
        .await
        .unwrap();

        let checker = ConsistencyChecker::new(provider).with_page_size(4);
        let report = checker.check_shard(&key(), &[1, 2]).await.unwrap();
        assert!(!report.is_consistent());
        assert_eq!(
            report.missing,
            vec![MissingPoint {
                point_id: 4,
                present_on: vec![2],
                missing_on: vec![1],
            }]
        );
        let kinds: Vec<_> = report.mismatched.iter().map(|m| (m.point_id, m.kind)).collect();
        assert_eq!(kinds, vec![(9, MismatchKind::Vector), (10, MismatchKind::Payload)]);
    }
}
