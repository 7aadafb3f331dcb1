//! Testing utilities for shard relocation.
//!
//! - [`failpoint`]: per-operation failure injection for any [`ShardStore`]
//! - [`cluster`]: an in-process cluster with one coordinator and router
//!
//! ```rust,ignore
//! use ferry::testing::{FailpointAction, LocalCluster, LocalClusterConfig};
//!
//! let cluster = LocalCluster::new(LocalClusterConfig::new(3));
//! cluster.create_collection("benchmark", 4, 2).await?;
//! cluster.failpoints(3).enable("load_snapshot", FailpointAction::FailOnce);
//! let id = cluster.move_shard(&key, 1, 3, TransferMethod::Snapshot).await?;
//! let transfer = cluster.wait(id).await?;
//! ```
//!
//! [`ShardStore`]: crate::storage::ShardStore

pub mod cluster;
pub mod failpoint;

#[cfg(test)]
mod transfer_tests;

pub use cluster::{LocalCluster, LocalClusterConfig};
pub use failpoint::{
    FailpointAction, FailpointRegistry, FailpointResult, FailpointStats, FaultyStore,
};
