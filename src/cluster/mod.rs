//! Cluster metadata: peers, shard ownership and write routing.

pub mod ownership;
pub mod registry;
pub mod router;

pub use ownership::{CatalogState, CollectionCatalog, CollectionLayout, LocalRole, ShardPlacement};
pub use registry::{PeerRegistry, PeerTable};
pub use router::{shard_for_point, WriteRouter};
