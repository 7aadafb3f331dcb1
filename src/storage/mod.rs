//! Shard storage: replicas, their write-ahead logs and snapshot blobs.

pub mod shard_store;
pub mod snapshot;
pub mod wal;

pub use shard_store::{
    wal_range, LocalShardStore, LocalStores, ReplicaInfo, ReplicaState, ShardStore,
    ShardStoreProvider, WalRange,
};
pub use snapshot::{SnapshotBlob, SnapshotHeader};
pub use wal::Wal;
