//! Shard store: the per-peer holder of shard replicas.
//!
//! The coordinator only talks to stores through the [`ShardStore`] trait so
//! that a local in-memory store and a remote peer look the same.

use crate::config::StoreConfig;
use crate::error::{Error, Result, StorageError};
use crate::storage::snapshot::SnapshotBlob;
use crate::storage::wal::Wal;
use crate::types::{Mutation, MutationRecord, PeerId, Point, PointId, SeqNo, ShardKey};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle state of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    /// Serving reads and client writes.
    Active,
    /// Receiving a copy; applies replicated records only.
    Partial,
    /// Frozen for cutover; client writes are rejected.
    Sealed,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaState::Active => write!(f, "active"),
            ReplicaState::Partial => write!(f, "partial"),
            ReplicaState::Sealed => write!(f, "sealed"),
        }
    }
}

/// Metadata describing one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Write history this replica belongs to.
    pub lineage: Uuid,
    /// Last applied WAL sequence.
    pub applied_seq: SeqNo,
    /// Oldest WAL sequence still readable.
    pub wal_first_seq: SeqNo,
    /// Number of stored points.
    pub point_count: u64,
    /// Current state.
    pub state: ReplicaState,
}

impl ReplicaInfo {
    /// Whether `from ..= applied_seq` can still be read from this replica.
    pub fn retains_from(&self, from: SeqNo) -> bool {
        from >= self.wal_first_seq
    }
}

/// Narrow storage interface used by the transfer coordinator and router.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Peer hosting this store.
    fn peer_id(&self) -> PeerId;

    /// Produce a consistent point-in-time snapshot and the sequence it
    /// reflects.
    async fn snapshot(&self, key: &ShardKey) -> Result<(SnapshotBlob, SeqNo)>;

    /// Replace (or create) the replica from a snapshot. The replica becomes
    /// [`ReplicaState::Partial`] and adopts the snapshot's lineage. Returns
    /// the snapshot sequence.
    async fn load_snapshot(&self, key: &ShardKey, blob: SnapshotBlob) -> Result<SeqNo>;

    /// Read WAL records with `from <= seq <= to`, at most `limit` of them.
    async fn read_wal(
        &self,
        key: &ShardKey,
        from: SeqNo,
        to: SeqNo,
        limit: usize,
    ) -> Result<Vec<MutationRecord>>;

    /// Apply a replicated record.
    ///
    /// Records at or below the applied sequence are skipped; a record that
    /// does not directly follow it is a sequence gap. Returns the applied
    /// sequence afterwards.
    async fn apply(&self, key: &ShardKey, record: MutationRecord) -> Result<SeqNo>;

    /// Apply records in order.
    async fn apply_batch(&self, key: &ShardKey, records: Vec<MutationRecord>) -> Result<SeqNo> {
        let mut applied = self.current_sequence(key).await?;
        for record in records {
            applied = self.apply(key, record).await?;
        }
        Ok(applied)
    }

    /// Last applied sequence of the replica.
    async fn current_sequence(&self, key: &ShardKey) -> Result<SeqNo>;

    /// Replica metadata, or `None` if this store holds no copy.
    async fn replica_info(&self, key: &ShardKey) -> Result<Option<ReplicaInfo>>;

    /// Create an empty active replica with a fresh lineage. No-op if one
    /// exists.
    async fn create_replica(&self, key: &ShardKey) -> Result<()>;

    /// Apply a client mutation. Only active replicas accept writes.
    async fn write(&self, key: &ShardKey, mutation: Mutation) -> Result<SeqNo>;

    /// Change replica state. Returns the applied sequence at the moment of
    /// the change; sealing therefore reports the final sequence.
    async fn set_state(&self, key: &ShardKey, state: ReplicaState) -> Result<SeqNo>;

    /// Remove the replica. Returns whether a copy existed.
    async fn drop_replica(&self, key: &ShardKey) -> Result<bool>;

    /// Points with `id >= offset`, ordered by id.
    async fn scroll(&self, key: &ShardKey, offset: PointId, limit: usize) -> Result<Vec<Point>>;

    /// Discard WAL records up to `up_to`. Returns how many were removed.
    async fn compact_wal(&self, key: &ShardKey, up_to: SeqNo) -> Result<usize>;
}

/// Lazy cursor over a WAL range, fetched page by page.
pub struct WalRange {
    store: Arc<dyn ShardStore>,
    key: ShardKey,
    next: SeqNo,
    to: SeqNo,
    page_size: usize,
}

impl WalRange {
    /// Cursor over `from ..= to` on `store`.
    pub fn new(
        store: Arc<dyn ShardStore>,
        key: ShardKey,
        from: SeqNo,
        to: SeqNo,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            key,
            next: from,
            to,
            page_size: page_size.max(1),
        }
    }

    /// Next sequence the cursor will request.
    pub fn position(&self) -> SeqNo {
        self.next
    }

    /// Fetch the next page. `None` once the range is exhausted or the source
    /// has nothing beyond the current position.
    ///
    /// Fails with [`StorageError::Truncated`] if the range predates the
    /// retained WAL.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<MutationRecord>>> {
        if self.next > self.to {
            return Ok(None);
        }
        let records = self
            .store
            .read_wal(&self.key, self.next, self.to, self.page_size)
            .await?;
        match records.last() {
            Some(last) => {
                self.next = last.seq + 1;
                Ok(Some(records))
            }
            None => Ok(None),
        }
    }
}

/// Convenience constructor for [`WalRange`].
pub fn wal_range(
    store: Arc<dyn ShardStore>,
    key: &ShardKey,
    from: SeqNo,
    to: SeqNo,
    page_size: usize,
) -> WalRange {
    WalRange::new(store, key.clone(), from, to, page_size)
}

/// Resolves the store of a peer.
pub trait ShardStoreProvider: Send + Sync {
    /// Store handle for `peer_id`.
    fn store(&self, peer_id: PeerId) -> Result<Arc<dyn ShardStore>>;
}

/// Provider backed by a map of in-process stores.
#[derive(Default)]
pub struct LocalStores {
    stores: RwLock<HashMap<PeerId, Arc<dyn ShardStore>>>,
}

impl LocalStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under its peer id.
    pub fn insert(&self, store: Arc<dyn ShardStore>) {
        self.stores.write().insert(store.peer_id(), store);
    }

    /// Unregister a peer's store. Later lookups report the peer unreachable.
    pub fn remove(&self, peer_id: PeerId) -> Option<Arc<dyn ShardStore>> {
        self.stores.write().remove(&peer_id)
    }
}

impl ShardStoreProvider for LocalStores {
    fn store(&self, peer_id: PeerId) -> Result<Arc<dyn ShardStore>> {
        self.stores
            .read()
            .get(&peer_id)
            .cloned()
            .ok_or_else(|| Error::Unreachable {
                peer_id,
                reason: "no store registered".into(),
            })
    }
}

/// One replica held in memory.
struct Replica {
    lineage: Uuid,
    points: BTreeMap<PointId, Point>,
    wal: Wal,
    state: ReplicaState,
}

impl Replica {
    fn new(retention: usize) -> Self {
        Self {
            lineage: Uuid::new_v4(),
            points: BTreeMap::new(),
            wal: Wal::new(retention),
            state: ReplicaState::Active,
        }
    }

    fn applied_seq(&self) -> SeqNo {
        self.wal.last_seq()
    }

    fn apply_mutation(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::Upsert(point) => {
                self.points.insert(point.id, point.clone());
            }
            Mutation::Delete(id) => {
                self.points.remove(id);
            }
        }
    }

    fn info(&self) -> ReplicaInfo {
        ReplicaInfo {
            lineage: self.lineage,
            applied_seq: self.applied_seq(),
            wal_first_seq: self.wal.first_seq(),
            point_count: self.points.len() as u64,
            state: self.state,
        }
    }
}

/// In-memory shard store with a mutex per replica.
pub struct LocalShardStore {
    peer_id: PeerId,
    config: StoreConfig,
    replicas: RwLock<HashMap<ShardKey, Arc<Mutex<Replica>>>>,
}

impl LocalShardStore {
    /// Create an empty store for `peer_id`.
    pub fn new(peer_id: PeerId, config: StoreConfig) -> Self {
        Self {
            peer_id,
            config,
            replicas: RwLock::new(HashMap::new()),
        }
    }

    /// Keys of every replica held, regardless of state.
    pub fn keys(&self) -> Vec<ShardKey> {
        let mut keys: Vec<_> = self.replicas.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of points in a replica, 0 if absent.
    pub fn point_count(&self, key: &ShardKey) -> u64 {
        self.replica(key)
            .map(|r| r.lock().points.len() as u64)
            .unwrap_or(0)
    }

    fn replica(&self, key: &ShardKey) -> Option<Arc<Mutex<Replica>>> {
        self.replicas.read().get(key).cloned()
    }

    fn require(&self, key: &ShardKey) -> Result<Arc<Mutex<Replica>>> {
        self.replica(key).ok_or(Error::ReplicaNotFound {
            peer_id: self.peer_id,
            shard_id: key.shard_id,
        })
    }
}

#[async_trait]
impl ShardStore for LocalShardStore {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn snapshot(&self, key: &ShardKey) -> Result<(SnapshotBlob, SeqNo)> {
        let replica = self.require(key)?;
        let (lineage, seq, points) = {
            let guard = replica.lock();
            let points: Vec<Point> = guard.points.values().cloned().collect();
            (guard.lineage, guard.applied_seq(), points)
        };

        let blob = SnapshotBlob::encode(lineage, seq, &points, self.config.compress_snapshots)?;
        tracing::debug!(
            peer_id = self.peer_id,
            shard = %key,
            seq,
            points = points.len(),
            bytes = blob.len(),
            "Snapshot taken"
        );
        Ok((blob, seq))
    }

    async fn load_snapshot(&self, key: &ShardKey, blob: SnapshotBlob) -> Result<SeqNo> {
        let decoded = blob.decode()?;
        let seq = decoded.header.seq;
        let replica = Replica {
            lineage: decoded.header.lineage,
            points: decoded.points.into_iter().map(|p| (p.id, p)).collect(),
            wal: Wal::starting_after(seq, self.config.wal_retention),
            state: ReplicaState::Partial,
        };
        let count = replica.points.len();

        self.replicas
            .write()
            .insert(key.clone(), Arc::new(Mutex::new(replica)));

        tracing::debug!(
            peer_id = self.peer_id,
            shard = %key,
            seq,
            points = count,
            "Snapshot loaded"
        );
        Ok(seq)
    }

    async fn read_wal(
        &self,
        key: &ShardKey,
        from: SeqNo,
        to: SeqNo,
        limit: usize,
    ) -> Result<Vec<MutationRecord>> {
        let replica = self.require(key)?;
        let guard = replica.lock();
        Ok(guard.wal.read(from, to, limit)?)
    }

    async fn apply(&self, key: &ShardKey, record: MutationRecord) -> Result<SeqNo> {
        let replica = self.require(key)?;
        let mut guard = replica.lock();
        let applied = guard.applied_seq();
        if record.seq <= applied {
            return Ok(applied);
        }
        if record.seq != applied + 1 {
            return Err(StorageError::SequenceGap {
                expected: applied + 1,
                got: record.seq,
            }
            .into());
        }

        guard.apply_mutation(&record.mutation);
        guard.wal.append_record(record)?;
        Ok(guard.applied_seq())
    }

    async fn current_sequence(&self, key: &ShardKey) -> Result<SeqNo> {
        let replica = self.require(key)?;
        let seq = replica.lock().applied_seq();
        Ok(seq)
    }

    async fn replica_info(&self, key: &ShardKey) -> Result<Option<ReplicaInfo>> {
        Ok(self.replica(key).map(|r| r.lock().info()))
    }

    async fn create_replica(&self, key: &ShardKey) -> Result<()> {
        let mut replicas = self.replicas.write();
        if !replicas.contains_key(key) {
            replicas.insert(
                key.clone(),
                Arc::new(Mutex::new(Replica::new(self.config.wal_retention))),
            );
            tracing::debug!(peer_id = self.peer_id, shard = %key, "Replica created");
        }
        Ok(())
    }

    async fn write(&self, key: &ShardKey, mutation: Mutation) -> Result<SeqNo> {
        let replica = self.require(key)?;
        let mut guard = replica.lock();
        match guard.state {
            ReplicaState::Active => {}
            ReplicaState::Sealed => {
                return Err(Error::ShardSealed {
                    peer_id: self.peer_id,
                    shard_id: key.shard_id,
                })
            }
            ReplicaState::Partial => {
                return Err(Error::ReplicaNotFound {
                    peer_id: self.peer_id,
                    shard_id: key.shard_id,
                })
            }
        }

        guard.apply_mutation(&mutation);
        Ok(guard.wal.append(mutation))
    }

    async fn set_state(&self, key: &ShardKey, state: ReplicaState) -> Result<SeqNo> {
        let replica = self.require(key)?;
        let mut guard = replica.lock();
        let previous = guard.state;
        guard.state = state;
        let seq = guard.applied_seq();
        if previous != state {
            tracing::debug!(
                peer_id = self.peer_id,
                shard = %key,
                from = %previous,
                to = %state,
                seq,
                "Replica state changed"
            );
        }
        Ok(seq)
    }

    async fn drop_replica(&self, key: &ShardKey) -> Result<bool> {
        let removed = self.replicas.write().remove(key).is_some();
        if removed {
            tracing::debug!(peer_id = self.peer_id, shard = %key, "Replica dropped");
        }
        Ok(removed)
    }

    async fn scroll(&self, key: &ShardKey, offset: PointId, limit: usize) -> Result<Vec<Point>> {
        let replica = self.require(key)?;
        let guard = replica.lock();
        Ok(guard
            .points
            .range(offset..)
            .take(limit)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn compact_wal(&self, key: &ShardKey, up_to: SeqNo) -> Result<usize> {
        let replica = self.require(key)?;
        let removed = replica.lock().wal.compact(up_to);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ShardKey {
        ShardKey::new("benchmark", 3)
    }

    fn upsert(id: PointId) -> Mutation {
        Mutation::Upsert(Point::new(id, vec![id as f32, 1.0]))
    }

    async fn store_with(points: u64) -> LocalShardStore {
        let store = LocalShardStore::new(1, StoreConfig::default());
        store.create_replica(&key()).await.unwrap();
        for id in 0..points {
            store.write(&key(), upsert(id)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_write_and_sequence() {
        let store = store_with(5).await;
        assert_eq!(store.current_sequence(&key()).await.unwrap(), 5);
        assert_eq!(store.write(&key(), Mutation::Delete(0)).await.unwrap(), 6);
        assert_eq!(store.point_count(&key()), 4);
    }

    #[tokio::test]
    async fn test_snapshot_load_adopts_lineage() {
        let source = store_with(10).await;
        let (blob, seq) = source.snapshot(&key()).await.unwrap();
        assert_eq!(seq, 10);

        let dest = LocalShardStore::new(2, StoreConfig::default());
        assert_eq!(dest.load_snapshot(&key(), blob).await.unwrap(), 10);

        let src_info = source.replica_info(&key()).await.unwrap().unwrap();
        let dst_info = dest.replica_info(&key()).await.unwrap().unwrap();
        assert_eq!(dst_info.lineage, src_info.lineage);
        assert_eq!(dst_info.applied_seq, 10);
        assert_eq!(dst_info.point_count, 10);
        assert_eq!(dst_info.state, ReplicaState::Partial);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let source = store_with(3).await;
        let dest = LocalShardStore::new(2, StoreConfig::default());
        let (blob, _) = source.snapshot(&key()).await.unwrap();
        dest.load_snapshot(&key(), blob).await.unwrap();

        let record = MutationRecord::new(4, upsert(100));
        assert_eq!(dest.apply(&key(), record.clone()).await.unwrap(), 4);
        assert_eq!(dest.apply(&key(), record).await.unwrap(), 4);
        assert_eq!(dest.point_count(&key()), 4);

        // Old records are skipped too.
        let old = MutationRecord::new(2, Mutation::Delete(0));
        assert_eq!(dest.apply(&key(), old).await.unwrap(), 4);
        assert_eq!(dest.point_count(&key()), 4);
    }

    #[tokio::test]
    async fn test_apply_gap_is_corrupt() {
        let dest = store_with(0).await;
        let err = dest
            .apply(&key(), MutationRecord::new(3, upsert(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Corrupt);
    }

    #[tokio::test]
    async fn test_sealed_rejects_writes() {
        let store = store_with(2).await;
        assert_eq!(
            store.set_state(&key(), ReplicaState::Sealed).await.unwrap(),
            2
        );
        assert!(matches!(
            store.write(&key(), upsert(9)).await,
            Err(Error::ShardSealed { peer_id: 1, shard_id: 3 })
        ));

        store.set_state(&key(), ReplicaState::Active).await.unwrap();
        assert_eq!(store.write(&key(), upsert(9)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_partial_rejects_client_writes() {
        let store = store_with(0).await;
        store.set_state(&key(), ReplicaState::Partial).await.unwrap();
        assert!(matches!(
            store.write(&key(), upsert(1)).await,
            Err(Error::ReplicaNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_wal_range_pages() {
        let store: Arc<dyn ShardStore> = Arc::new(store_with(25).await);
        let mut range = wal_range(store, &key(), 6, 25, 8);

        let mut seqs = Vec::new();
        while let Some(batch) = range.next_batch().await.unwrap() {
            assert!(batch.len() <= 8);
            seqs.extend(batch.iter().map(|r| r.seq));
        }
        assert_eq!(seqs, (6..=25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_wal_range_truncated() {
        let store = LocalShardStore::new(1, StoreConfig::default().with_wal_retention(4));
        store.create_replica(&key()).await.unwrap();
        for id in 0..10 {
            store.write(&key(), upsert(id)).await.unwrap();
        }
        let store: Arc<dyn ShardStore> = Arc::new(store);

        let mut range = wal_range(store, &key(), 2, 10, 100);
        assert!(matches!(
            range.next_batch().await,
            Err(Error::Storage(StorageError::Truncated { first_retained: 7, .. }))
        ));
    }

    #[tokio::test]
    async fn test_scroll_and_drop() {
        let store = store_with(10).await;
        let page = store.scroll(&key(), 4, 3).await.unwrap();
        assert_eq!(page.iter().map(|p| p.id).collect::<Vec<_>>(), vec![4, 5, 6]);

        assert!(store.drop_replica(&key()).await.unwrap());
        assert!(!store.drop_replica(&key()).await.unwrap());
        assert!(store.replica_info(&key()).await.unwrap().is_none());
    }

    #[test]
    fn test_local_stores_unknown_peer() {
        let stores = LocalStores::new();
        stores.insert(Arc::new(LocalShardStore::new(1, StoreConfig::default())));
        assert!(stores.store(1).is_ok());
        assert!(matches!(
            stores.store(9),
            Err(Error::Unreachable { peer_id: 9, .. })
        ));
    }
}
