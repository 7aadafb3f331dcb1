//! Core types used throughout the crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Peer identifier in the cluster.
pub type PeerId = u64;

/// Shard identifier within a collection.
pub type ShardId = u32;

/// WAL sequence number. `0` means "nothing applied yet".
pub type SeqNo = u64;

/// Point identifier.
pub type PointId = u64;

/// Identifies one shard of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    /// Collection name.
    pub collection: String,
    /// Shard within the collection.
    pub shard_id: ShardId,
}

impl ShardKey {
    /// Create a new shard key.
    pub fn new(collection: impl Into<String>, shard_id: ShardId) -> Self {
        Self {
            collection: collection.into(),
            shard_id,
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.shard_id)
    }
}

/// A stored point: identified vector with an optional flat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Point ID.
    pub id: PointId,
    /// Dense vector.
    pub vector: Vec<f32>,
    /// Payload key/values.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
}

impl Point {
    /// Create a point without payload.
    pub fn new(id: PointId, vector: Vec<f32>) -> Self {
        Self {
            id,
            vector,
            payload: BTreeMap::new(),
        }
    }

    /// Attach a payload entry.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Approximate encoded size in bytes.
    pub fn size(&self) -> usize {
        8 + self.vector.len() * 4
            + self
                .payload
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A single write operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert or replace a point.
    Upsert(Point),
    /// Remove a point.
    Delete(PointId),
}

impl Mutation {
    /// The point this mutation touches.
    pub fn point_id(&self) -> PointId {
        match self {
            Mutation::Upsert(p) => p.id,
            Mutation::Delete(id) => *id,
        }
    }

    /// Approximate encoded size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Mutation::Upsert(p) => p.size(),
            Mutation::Delete(_) => 8,
        }
    }
}

/// A mutation committed to a replica's WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Position in the WAL, strictly increasing and gapless.
    pub seq: SeqNo,
    /// The operation.
    pub mutation: Mutation,
}

impl MutationRecord {
    /// Create a record.
    pub fn new(seq: SeqNo, mutation: Mutation) -> Self {
        Self { seq, mutation }
    }
}

/// Liveness of a peer as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Responding to health checks.
    Live,
    /// Missed at least one health check.
    Suspect,
    /// Missed enough health checks to be treated as gone.
    Dead,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Live => write!(f, "live"),
            PeerStatus::Suspect => write!(f, "suspect"),
            PeerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Information about a peer in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Unique peer identifier.
    pub id: PeerId,
    /// Address of the peer transport.
    pub addr: String,
    /// Current liveness.
    pub status: PeerStatus,
}

impl PeerInfo {
    /// Create a live peer.
    pub fn new(id: PeerId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            status: PeerStatus::Live,
        }
    }

    /// Whether the peer is live.
    pub fn is_live(&self) -> bool {
        self.status == PeerStatus::Live
    }
}
