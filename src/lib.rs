//! Shard relocation for a replicated peer-to-peer point store.
//!
//! This crate moves shard replicas between peers while the shard keeps
//! accepting writes:
//! - **Snapshot** transfers ship a point-in-time copy, then replay the WAL
//!   written since
//! - **WAL delta** transfers ship only the records a stale copy is missing,
//!   falling back to a snapshot when that history is gone
//! - **Cutover** seals the source, drains the tail and flips ownership in one
//!   atomic step
//!
//! # Example
//!
//! ```rust,no_run
//! use ferry::api::{ClusterOperation, ControlCommand, MoveShard};
//! use ferry::transfer::TransferMethod;
//! use ferry::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::start(NodeConfig::new(1, "127.0.0.1:6335".parse()?)).await?;
//!
//!     node.execute(ControlCommand::CreateCollection {
//!         collection: "benchmark".into(),
//!         shard_count: 4,
//!         replication_factor: 1,
//!     })
//!     .await?;
//!
//!     node.execute(ControlCommand::UpdateCluster {
//!         collection: "benchmark".into(),
//!         operation: ClusterOperation::MoveShard(MoveShard {
//!             shard_id: 3,
//!             from_peer_id: 1,
//!             to_peer_id: 2,
//!             method: TransferMethod::WalDelta,
//!         }),
//!     })
//!     .await?;
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        ControlCommand (JSON over TCP)       │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │              ClusterControl                 │
//! │  • cluster_info / update_cluster / upsert   │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌─────────────┐
//! │ Catalog │   │ Transfer │   │ WriteRouter │
//! │(owners) │   │Coordinator│  │             │
//! └─────────┘   └──────────┘   └─────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │   ShardStore (local, or remote over TCP)    │
//! │  • snapshot / read_wal / apply / seal       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Writes**: applied exactly once per replica, ordered by WAL sequence
//! - **Ownership**: readers see the old owner or the new one, never both
//! - **Failure**: a failed or cancelled transfer leaves the source as owner

pub mod api;
pub mod cluster;
pub mod config;
pub mod consistency;
pub mod error;
pub mod metrics;
pub mod network;
pub mod node;
pub mod storage;
pub mod testing;
pub mod transfer;
pub mod types;

pub use api::{ApiResponse, ClusterControl, ControlCommand};
pub use cluster::{CollectionCatalog, PeerRegistry, PeerTable, WriteRouter};
pub use config::{NodeConfig, StoreConfig, TransferConfig};
pub use error::{Error, ErrorKind, Result};
pub use node::Node;
pub use storage::{LocalShardStore, ShardStore, ShardStoreProvider};
pub use transfer::{
    ShardTransfer, TransferCoordinator, TransferId, TransferMethod, TransferRequest, TransferState,
};
pub use types::{Mutation, MutationRecord, PeerId, PeerInfo, Point, PointId, ShardId, ShardKey};

pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot};
