//! Failpoint injection for shard store operations.
//!
//! A [`FaultyStore`] wraps any [`ShardStore`] and consults a
//! [`FailpointRegistry`] before each call, keyed by operation name
//! (`"snapshot"`, `"load_snapshot"`, `"read_wal"`, `"apply"`, `"set_state"`,
//! ...). Failpoints can fail a call, delay it, or fail only after a number
//! of hits.
//!
//! ```rust,ignore
//! let registry = Arc::new(FailpointRegistry::new());
//! let store = FaultyStore::new(inner, registry.clone());
//! registry.enable("load_snapshot", FailpointAction::Fail);
//! ```

use crate::error::{Error, Result};
use crate::storage::{ReplicaInfo, ReplicaState, ShardStore, SnapshotBlob};
use crate::types::{Mutation, MutationRecord, PeerId, Point, PointId, SeqNo, ShardKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Action to take when a failpoint is hit.
#[derive(Debug, Clone)]
pub enum FailpointAction {
    /// Fail every call.
    Fail,

    /// Delay every call.
    Sleep(Duration),

    /// Let `n - 1` calls through, then fail every call.
    FailAfter(u64),

    /// Fail the first call only.
    FailOnce,
}

struct FailpointState {
    action: FailpointAction,
    hit_count: AtomicU64,
    triggered_count: AtomicU64,
    disabled: AtomicBool,
}

/// Registry of active failpoints.
#[derive(Default)]
pub struct FailpointRegistry {
    failpoints: RwLock<HashMap<String, Arc<FailpointState>>>,
}

/// Result of checking a failpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum FailpointResult {
    /// Proceed normally.
    Continue,

    /// Fail the call.
    Fail,

    /// Wait, then proceed.
    Sleep(Duration),
}

/// Statistics for a failpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailpointStats {
    /// Times the failpoint was reached.
    pub hit_count: u64,

    /// Times it actually acted.
    pub triggered_count: u64,
}

impl FailpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a failpoint, replacing any previous action.
    pub fn enable(&self, name: &str, action: FailpointAction) {
        let state = Arc::new(FailpointState {
            action,
            hit_count: AtomicU64::new(0),
            triggered_count: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
        });
        self.failpoints.write().insert(name.to_string(), state);
    }

    pub fn disable(&self, name: &str) {
        self.failpoints.write().remove(name);
    }

    pub fn disable_all(&self) {
        self.failpoints.write().clear();
    }

    /// Record a hit on `name` and decide what the caller should do.
    pub fn check(&self, name: &str) -> FailpointResult {
        let Some(state) = self.failpoints.read().get(name).cloned() else {
            return FailpointResult::Continue;
        };
        if state.disabled.load(Ordering::Relaxed) {
            return FailpointResult::Continue;
        }

        let hit = state.hit_count.fetch_add(1, Ordering::Relaxed) + 1;
        let result = match &state.action {
            FailpointAction::Fail => FailpointResult::Fail,
            FailpointAction::Sleep(d) => FailpointResult::Sleep(*d),
            FailpointAction::FailAfter(n) if hit >= *n => FailpointResult::Fail,
            FailpointAction::FailAfter(_) => FailpointResult::Continue,
            FailpointAction::FailOnce => {
                state.disabled.store(true, Ordering::Relaxed);
                FailpointResult::Fail
            }
        };
        if result != FailpointResult::Continue {
            state.triggered_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Check `name`, sleeping for delay actions. Returns an error for
    /// failing actions.
    pub async fn check_async(&self, name: &str, peer_id: PeerId) -> Result<()> {
        match self.check(name) {
            FailpointResult::Continue => Ok(()),
            FailpointResult::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            FailpointResult::Fail => Err(Error::Unreachable {
                peer_id,
                reason: format!("failpoint {}", name),
            }),
        }
    }

    pub fn stats(&self, name: &str) -> Option<FailpointStats> {
        self.failpoints.read().get(name).map(|state| FailpointStats {
            hit_count: state.hit_count.load(Ordering::Relaxed),
            triggered_count: state.triggered_count.load(Ordering::Relaxed),
        })
    }
}

/// A store whose calls pass through failpoints first.
pub struct FaultyStore {
    inner: Arc<dyn ShardStore>,
    failpoints: Arc<FailpointRegistry>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ShardStore>, failpoints: Arc<FailpointRegistry>) -> Self {
        Self { inner, failpoints }
    }

    pub fn failpoints(&self) -> &Arc<FailpointRegistry> {
        &self.failpoints
    }

    async fn gate(&self, op: &str) -> Result<()> {
        self.failpoints.check_async(op, self.inner.peer_id()).await
    }
}

#[async_trait]
impl ShardStore for FaultyStore {
    fn peer_id(&self) -> PeerId {
        self.inner.peer_id()
    }

    async fn snapshot(&self, key: &ShardKey) -> Result<(SnapshotBlob, SeqNo)> {
        self.gate("snapshot").await?;
        self.inner.snapshot(key).await
    }

    async fn load_snapshot(&self, key: &ShardKey, blob: SnapshotBlob) -> Result<SeqNo> {
        self.gate("load_snapshot").await?;
        self.inner.load_snapshot(key, blob).await
    }

    async fn read_wal(
        &self,
        key: &ShardKey,
        from: SeqNo,
        to: SeqNo,
        limit: usize,
    ) -> Result<Vec<MutationRecord>> {
        self.gate("read_wal").await?;
        self.inner.read_wal(key, from, to, limit).await
    }

    async fn apply(&self, key: &ShardKey, record: MutationRecord) -> Result<SeqNo> {
        self.gate("apply").await?;
        self.inner.apply(key, record).await
    }

    async fn apply_batch(&self, key: &ShardKey, records: Vec<MutationRecord>) -> Result<SeqNo> {
        self.gate("apply").await?;
        self.inner.apply_batch(key, records).await
    }

    async fn current_sequence(&self, key: &ShardKey) -> Result<SeqNo> {
        self.gate("current_sequence").await?;
        self.inner.current_sequence(key).await
    }

    async fn replica_info(&self, key: &ShardKey) -> Result<Option<ReplicaInfo>> {
        self.gate("replica_info").await?;
        self.inner.replica_info(key).await
    }

    async fn create_replica(&self, key: &ShardKey) -> Result<()> {
        self.gate("create_replica").await?;
        self.inner.create_replica(key).await
    }

    async fn write(&self, key: &ShardKey, mutation: Mutation) -> Result<SeqNo> {
        self.gate("write").await?;
        self.inner.write(key, mutation).await
    }

    async fn set_state(&self, key: &ShardKey, state: ReplicaState) -> Result<SeqNo> {
        self.gate("set_state").await?;
        self.inner.set_state(key, state).await
    }

    async fn drop_replica(&self, key: &ShardKey) -> Result<bool> {
        self.gate("drop_replica").await?;
        self.inner.drop_replica(key).await
    }

    async fn scroll(&self, key: &ShardKey, offset: PointId, limit: usize) -> Result<Vec<Point>> {
        self.gate("scroll").await?;
        self.inner.scroll(key, offset, limit).await
    }

    async fn compact_wal(&self, key: &ShardKey, up_to: SeqNo) -> Result<usize> {
        self.gate("compact_wal").await?;
        self.inner.compact_wal(key, up_to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_after_countdown() {
        let registry = FailpointRegistry::new();
        registry.enable("apply", FailpointAction::FailAfter(3));
        assert_eq!(registry.check("apply"), FailpointResult::Continue);
        assert_eq!(registry.check("apply"), FailpointResult::Continue);
        assert_eq!(registry.check("apply"), FailpointResult::Fail);
        assert_eq!(registry.check("apply"), FailpointResult::Fail);
        assert_eq!(
            registry.stats("apply"),
            Some(FailpointStats {
                hit_count: 4,
                triggered_count: 2
            })
        );
    }

    #[test]
    fn test_fail_once_then_continue() {
        let registry = FailpointRegistry::new();
        registry.enable("snapshot", FailpointAction::FailOnce);
        assert_eq!(registry.check("snapshot"), FailpointResult::Fail);
        assert_eq!(registry.check("snapshot"), FailpointResult::Continue);
        assert_eq!(registry.check("read_wal"), FailpointResult::Continue);

        registry.disable("snapshot");
        assert!(registry.stats("snapshot").is_none());
    }
}
