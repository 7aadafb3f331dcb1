//! Versioned shard ownership map.
//!
//! Maps collection -> shard -> replica peers, plus peers currently receiving
//! a copy. Every mutation happens inside one write-lock critical section and
//! bumps the catalog version, so readers see either the old or the new
//! owner set, never a mix.

use crate::error::{Error, Result};
use crate::types::{PeerId, ShardId, ShardKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::fs;
use tracing::info;

/// Placement of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlacement {
    /// Peers holding an active replica.
    pub replicas: Vec<PeerId>,
    /// Peers receiving a copy through an in-flight transfer.
    pub receiving: BTreeSet<PeerId>,
    /// Incremented on every change of this shard.
    pub version: u64,
}

impl ShardPlacement {
    fn new(replicas: Vec<PeerId>) -> Self {
        Self {
            replicas,
            receiving: BTreeSet::new(),
            version: 1,
        }
    }

    /// Whether `peer_id` holds an active replica.
    pub fn has_replica(&self, peer_id: PeerId) -> bool {
        self.replicas.contains(&peer_id)
    }

    /// Whether `peer_id` is receiving a copy.
    pub fn is_receiving(&self, peer_id: PeerId) -> bool {
        self.receiving.contains(&peer_id)
    }
}

/// Shard layout of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionLayout {
    pub name: String,
    pub shard_count: u32,
    pub replication_factor: usize,
    pub shards: BTreeMap<ShardId, ShardPlacement>,
}

/// Role of a peer for one of its local shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRole {
    /// Owns an active replica.
    Replica,
    /// Mid-transfer destination.
    Receiving,
}

/// Serializable catalog contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogState {
    pub version: u64,
    pub collections: BTreeMap<String, CollectionLayout>,
}

/// The ownership map.
#[derive(Debug, Default)]
pub struct CollectionCatalog {
    state: RwLock<CatalogState>,
}

impl CollectionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current catalog version.
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Create a collection, placing replicas round-robin over `peers`.
    pub fn create_collection(
        &self,
        name: &str,
        shard_count: u32,
        replication_factor: usize,
        peers: &[PeerId],
    ) -> Result<CollectionLayout> {
        if shard_count == 0 {
            return Err(Error::conflict("shard_count must be at least 1"));
        }
        if replication_factor == 0 || replication_factor > peers.len() {
            return Err(Error::conflict(format!(
                "replication factor {} cannot be placed on {} peers",
                replication_factor,
                peers.len()
            )));
        }

        let mut state = self.state.write();
        if state.collections.contains_key(name) {
            return Err(Error::conflict(format!("collection {} already exists", name)));
        }

        let shards = (0..shard_count)
            .map(|shard_id| {
                let replicas = (0..replication_factor)
                    .map(|r| peers[(shard_id as usize + r) % peers.len()])
                    .collect();
                (shard_id, ShardPlacement::new(replicas))
            })
            .collect();

        let layout = CollectionLayout {
            name: name.to_string(),
            shard_count,
            replication_factor,
            shards,
        };
        state.collections.insert(name.to_string(), layout.clone());
        state.version += 1;

        info!(
            collection = name,
            shard_count,
            replication_factor,
            version = state.version,
            "Collection created"
        );
        Ok(layout)
    }

    /// Whether the collection exists.
    pub fn contains(&self, name: &str) -> bool {
        self.state.read().collections.contains_key(name)
    }

    /// Layout of a collection.
    pub fn layout(&self, name: &str) -> Result<CollectionLayout> {
        self.state
            .read()
            .collections
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("collection {}", name)))
    }

    /// Names of all collections.
    pub fn collection_names(&self) -> Vec<String> {
        self.state.read().collections.keys().cloned().collect()
    }

    /// Placement of one shard.
    pub fn placement(&self, key: &ShardKey) -> Result<ShardPlacement> {
        let state = self.state.read();
        lookup(&state, key).cloned()
    }

    /// Current replica peers of a shard.
    pub fn owners(&self, key: &ShardKey) -> Result<Vec<PeerId>> {
        Ok(self.placement(key)?.replicas)
    }

    /// Mark `to` as receiving a copy of a shard owned by `from`.
    ///
    /// Fails with `InvalidShard` if `from` does not own the shard and with
    /// `Conflict` if `to` already holds or is receiving it.
    pub fn begin_receiving(&self, key: &ShardKey, from: PeerId, to: PeerId) -> Result<u64> {
        let mut state = self.state.write();
        let placement = lookup_mut(&mut state, key)?;
        check_move(key, placement, from, to)?;

        placement.receiving.insert(to);
        placement.version += 1;
        state.version += 1;
        Ok(state.version)
    }

    /// Clear the receiving marker of `to`. Returns whether one was set.
    pub fn abort_receiving(&self, key: &ShardKey, to: PeerId) -> bool {
        let mut state = self.state.write();
        let removed = match lookup_mut(&mut state, key) {
            Ok(placement) => {
                let removed = placement.receiving.remove(&to);
                if removed {
                    placement.version += 1;
                }
                removed
            }
            Err(_) => false,
        };
        if removed {
            state.version += 1;
        }
        removed
    }

    /// Atomically replace `from` by `to` in the replica set.
    ///
    /// `to` must be receiving and `from` must still be a replica. Returns the
    /// new placement version.
    pub fn cutover(&self, key: &ShardKey, from: PeerId, to: PeerId) -> Result<u64> {
        let mut state = self.state.write();
        let placement = lookup_mut(&mut state, key)?;

        if !placement.is_receiving(to) {
            return Err(Error::conflict(format!(
                "peer {} is not receiving shard {}",
                to, key
            )));
        }
        let slot = placement
            .replicas
            .iter()
            .position(|p| *p == from)
            .ok_or_else(|| Error::InvalidShard {
                shard_id: key.shard_id,
                reason: format!("peer {} no longer owns the shard", from),
            })?;

        placement.replicas[slot] = to;
        placement.receiving.remove(&to);
        placement.version += 1;
        let shard_version = placement.version;
        state.version += 1;

        info!(
            shard = %key,
            from,
            to,
            shard_version,
            version = state.version,
            "Ownership flipped"
        );
        Ok(shard_version)
    }

    /// Shards `peer_id` owns or is receiving, ordered by shard id.
    pub fn local_shards(
        &self,
        collection: &str,
        peer_id: PeerId,
    ) -> Result<Vec<(ShardId, LocalRole)>> {
        let state = self.state.read();
        let layout = state
            .collections
            .get(collection)
            .ok_or_else(|| Error::NotFound(format!("collection {}", collection)))?;

        Ok(layout
            .shards
            .iter()
            .filter_map(|(shard_id, placement)| {
                if placement.has_replica(peer_id) {
                    Some((*shard_id, LocalRole::Replica))
                } else if placement.is_receiving(peer_id) {
                    Some((*shard_id, LocalRole::Receiving))
                } else {
                    None
                }
            })
            .collect())
    }

    /// Replicas of the collection hosted by peers other than `peer_id`.
    pub fn remote_shards(
        &self,
        collection: &str,
        peer_id: PeerId,
    ) -> Result<Vec<(ShardId, PeerId)>> {
        let state = self.state.read();
        let layout = state
            .collections
            .get(collection)
            .ok_or_else(|| Error::NotFound(format!("collection {}", collection)))?;

        Ok(layout
            .shards
            .iter()
            .flat_map(|(shard_id, placement)| {
                placement
                    .replicas
                    .iter()
                    .filter(|p| **p != peer_id)
                    .map(move |p| (*shard_id, *p))
            })
            .collect())
    }

    /// Copy of the whole catalog.
    pub fn export(&self) -> CatalogState {
        self.state.read().clone()
    }

    /// Replace the catalog if `incoming` is newer. Returns whether it was
    /// installed.
    pub fn install(&self, incoming: CatalogState) -> bool {
        let mut state = self.state.write();
        if incoming.version <= state.version {
            return false;
        }
        *state = incoming;
        true
    }

    /// Persist the catalog (write to temp, then rename).
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = bincode::serialize(&self.export())
            .map_err(|e| Error::Internal(format!("catalog encode: {}", e)))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load a persisted catalog. A missing file yields an empty catalog.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = match fs::read(path.as_ref()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let state: CatalogState = bincode::deserialize(&bytes)
            .map_err(|e| Error::Corrupt(format!("catalog: {}", e)))?;
        Ok(Self {
            state: RwLock::new(state),
        })
    }
}

fn lookup<'a>(state: &'a CatalogState, key: &ShardKey) -> Result<&'a ShardPlacement> {
    let layout = state
        .collections
        .get(&key.collection)
        .ok_or_else(|| Error::NotFound(format!("collection {}", key.collection)))?;
    layout.shards.get(&key.shard_id).ok_or_else(|| Error::InvalidShard {
        shard_id: key.shard_id,
        reason: format!(
            "collection {} has {} shards",
            key.collection, layout.shard_count
        ),
    })
}

fn lookup_mut<'a>(state: &'a mut CatalogState, key: &ShardKey) -> Result<&'a mut ShardPlacement> {
    let layout = state
        .collections
        .get_mut(&key.collection)
        .ok_or_else(|| Error::NotFound(format!("collection {}", key.collection)))?;
    let shard_count = layout.shard_count;
    layout
        .shards
        .get_mut(&key.shard_id)
        .ok_or_else(|| Error::InvalidShard {
            shard_id: key.shard_id,
            reason: format!("collection {} has {} shards", key.collection, shard_count),
        })
}

/// Validate that `from -> to` is a legal move for `placement`.
pub fn check_move(
    key: &ShardKey,
    placement: &ShardPlacement,
    from: PeerId,
    to: PeerId,
) -> Result<()> {
    if !placement.has_replica(from) {
        return Err(Error::InvalidShard {
            shard_id: key.shard_id,
            reason: format!("peer {} does not own the shard", from),
        });
    }
    if placement.has_replica(to) {
        return Err(Error::conflict(format!(
            "peer {} already holds shard {}",
            to, key
        )));
    }
    if placement.is_receiving(to) {
        return Err(Error::conflict(format!(
            "peer {} is already receiving shard {}",
            to, key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> CollectionCatalog {
        let catalog = CollectionCatalog::new();
        catalog.create_collection("benchmark", 6, 1, &[1, 2, 3]).unwrap();
        catalog
    }

    #[test]
    fn test_round_robin_placement() {
        let catalog = catalog();
        let layout = catalog.layout("benchmark").unwrap();
        assert_eq!(layout.shards.len(), 6);
        assert_eq!(catalog.owners(&ShardKey::new("benchmark", 0)).unwrap(), vec![1]);
        assert_eq!(catalog.owners(&ShardKey::new("benchmark", 4)).unwrap(), vec![2]);

        let rf2 = CollectionCatalog::new();
        rf2.create_collection("c", 3, 2, &[1, 2, 3]).unwrap();
        assert_eq!(rf2.owners(&ShardKey::new("c", 2)).unwrap(), vec![3, 1]);
        assert!(rf2.create_collection("c", 3, 2, &[1, 2, 3]).is_err());
        assert!(rf2.create_collection("d", 3, 4, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_lookup_errors() {
        let catalog = catalog();
        assert!(matches!(
            catalog.placement(&ShardKey::new("missing", 0)),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            catalog.placement(&ShardKey::new("benchmark", 6)),
            Err(Error::InvalidShard { shard_id: 6, .. })
        ));
    }

    #[test]
    fn test_begin_receiving_validates() {
        let catalog = catalog();
        let key = ShardKey::new("benchmark", 3); // owned by 1

        assert!(matches!(
            catalog.begin_receiving(&key, 2, 3),
            Err(Error::InvalidShard { .. })
        ));
        catalog.begin_receiving(&key, 1, 2).unwrap();
        assert!(matches!(
            catalog.begin_receiving(&key, 1, 2),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            catalog.begin_receiving(&key, 1, 1),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_cutover_flips_owner() {
        let catalog = catalog();
        let key = ShardKey::new("benchmark", 3);
        let before = catalog.version();

        assert!(catalog.cutover(&key, 1, 2).is_err());
        catalog.begin_receiving(&key, 1, 2).unwrap();
        let shard_version = catalog.cutover(&key, 1, 2).unwrap();

        let placement = catalog.placement(&key).unwrap();
        assert_eq!(placement.replicas, vec![2]);
        assert!(placement.receiving.is_empty());
        assert_eq!(placement.version, shard_version);
        assert!(catalog.version() > before);
    }

    #[test]
    fn test_local_and_remote_shards() {
        let catalog = catalog();
        let key = ShardKey::new("benchmark", 1); // owned by 2
        catalog.begin_receiving(&key, 2, 1).unwrap();

        let local = catalog.local_shards("benchmark", 1).unwrap();
        assert_eq!(
            local,
            vec![
                (0, LocalRole::Replica),
                (1, LocalRole::Receiving),
                (3, LocalRole::Replica)
            ]
        );

        let remote = catalog.remote_shards("benchmark", 1).unwrap();
        assert_eq!(remote, vec![(1, 2), (2, 3), (4, 2), (5, 3)]);

        assert!(catalog.abort_receiving(&key, 1));
        assert!(!catalog.abort_receiving(&key, 1));
        assert_eq!(catalog.local_shards("benchmark", 1).unwrap().len(), 2);
    }

    #[test]
    fn test_install_only_newer() {
        let catalog = catalog();
        let exported = catalog.export();
        let fresh = CollectionCatalog::new();
        assert!(fresh.install(exported.clone()));
        assert!(!fresh.install(exported));
        assert!(fresh.contains("benchmark"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.bin");

        let missing = CollectionCatalog::load(&path).await.unwrap();
        assert_eq!(missing.version(), 0);

        let catalog = catalog();
        catalog.save(&path).await.unwrap();
        let loaded = CollectionCatalog::load(&path).await.unwrap();
        assert_eq!(loaded.export(), catalog.export());
    }
}
