//! Shard relocation: moving a replica between peers while writes continue.
//!
//! - [`types`]: transfer records and their state machine
//! - [`strategy`]: snapshot and WAL-delta data movement
//! - [`coordinator`]: admission, per-transfer tasks and cutover
//! - [`journal`]: durable record of in-flight transfers
//! - [`throttle`]: shared byte-rate limit
//! - [`metrics`]: transfer counters and histograms

pub mod coordinator;
pub mod journal;
pub mod metrics;
pub mod strategy;
pub mod throttle;
pub mod types;

pub use coordinator::TransferCoordinator;
pub use journal::{FileTransferJournal, InMemoryTransferJournal, TransferJournal};
pub use metrics::{TransferMetrics, TransferMetricsSnapshot};
pub use strategy::Syncer;
pub use throttle::Throttle;
pub use types::{
    ShardTransfer, TransferId, TransferMethod, TransferProgress, TransferRequest, TransferState,
};
