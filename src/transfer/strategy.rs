//! Data movement for one transfer: initial sync, catch-up and tail replay.
//!
//! ```text
//!   snapshot:   source.snapshot ──► [stage file] ──► dest.load_snapshot
//!                                                      │
//!   wal_delta:  dest.applied + 1 ..= source.applied ───┤
//!                                                      ▼
//!   catch-up:   replay source WAL until lag <= cutover_lag
//!   finish:     replay sealed tail, verify dest seq == sealed seq
//! ```
//!
//! When the source compacts records the destination still needs, the
//! destination is re-seeded from a fresh snapshot and syncing continues.

use crate::config::TransferConfig;
use crate::error::{Error, Result, StorageError};
use crate::storage::{wal_range, ReplicaState, ShardStore, SnapshotBlob};
use crate::transfer::metrics::TransferMetrics;
use crate::transfer::throttle::Throttle;
use crate::transfer::types::{TransferMethod, TransferProgress};
use crate::types::{SeqNo, ShardKey};
use std::sync::Arc;
use tracing::{debug, info};

/// Callback receiving progress updates.
pub type ProgressFn<'a> = Box<dyn Fn(&TransferProgress) + Send + Sync + 'a>;

/// Moves the data of one shard from `source` to `dest`.
pub struct Syncer<'a> {
    key: &'a ShardKey,
    source: Arc<dyn ShardStore>,
    dest: Arc<dyn ShardStore>,
    config: &'a TransferConfig,
    throttle: &'a Throttle,
    metrics: &'a TransferMetrics,
    method: TransferMethod,
    progress: TransferProgress,
    report: ProgressFn<'a>,
}

impl<'a> Syncer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: &'a ShardKey,
        source: Arc<dyn ShardStore>,
        dest: Arc<dyn ShardStore>,
        config: &'a TransferConfig,
        throttle: &'a Throttle,
        metrics: &'a TransferMetrics,
        report: ProgressFn<'a>,
    ) -> Self {
        Self {
            key,
            source,
            dest,
            config,
            throttle,
            metrics,
            method: TransferMethod::Snapshot,
            progress: TransferProgress::default(),
            report,
        }
    }

    /// Progress so far.
    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Method that actually brought the destination up to date so far.
    pub fn method(&self) -> TransferMethod {
        self.method
    }

    fn publish(&self) {
        (self.report)(&self.progress);
    }

    /// Bring the destination to a state it can catch up from. Returns the
    /// method actually used.
    pub async fn initial_sync(&mut self, method: TransferMethod) -> Result<TransferMethod> {
        if method == TransferMethod::WalDelta {
            if let Some(dest_seq) = self.plan_wal_delta().await? {
                let source_seq = self.source.current_sequence(self.key).await?;
                self.dest.set_state(self.key, ReplicaState::Partial).await?;
                match self.replay(dest_seq + 1, source_seq).await {
                    Ok(_) => {
                        self.method = TransferMethod::WalDelta;
                        return Ok(TransferMethod::WalDelta);
                    }
                    Err(Error::Storage(StorageError::Truncated { first_retained, .. })) => {
                        info!(
                            shard = %self.key,
                            first_retained,
                            "Source WAL compacted during delta, falling back to snapshot"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            self.metrics.record_fallback(method);
        }

        self.snapshot_sync().await?;
        self.method = TransferMethod::Snapshot;
        Ok(TransferMethod::Snapshot)
    }

    /// Re-seed the destination after the source compacted records it still
    /// needed.
    async fn resnapshot(&mut self, first_retained: SeqNo) -> Result<()> {
        info!(
            shard = %self.key,
            first_retained,
            dest_seq = self.progress.dest_seq,
            "Source WAL compacted past the destination, shipping a new snapshot"
        );
        self.metrics.record_fallback(self.method);
        self.method = TransferMethod::Snapshot;
        self.snapshot_sync().await?;
        Ok(())
    }

    /// Destination sequence to continue from, or `None` when only a snapshot
    /// can bring the destination up to date.
    async fn plan_wal_delta(&self) -> Result<Option<SeqNo>> {
        let Some(dest) = self.dest.replica_info(self.key).await? else {
            debug!(shard = %self.key, "Destination holds no copy");
            return Ok(None);
        };
        let source = self
            .source
            .replica_info(self.key)
            .await?
            .ok_or(Error::ReplicaNotFound {
                peer_id: self.source.peer_id(),
                shard_id: self.key.shard_id,
            })?;

        if dest.lineage != source.lineage {
            debug!(shard = %self.key, "Destination copy has a different lineage");
            return Ok(None);
        }
        if dest.applied_seq > source.applied_seq {
            debug!(
                shard = %self.key,
                dest_seq = dest.applied_seq,
                source_seq = source.applied_seq,
                "Destination copy is ahead of the source"
            );
            return Ok(None);
        }
        if !source.retains_from(dest.applied_seq + 1) {
            debug!(
                shard = %self.key,
                needed = dest.applied_seq + 1,
                first_retained = source.wal_first_seq,
                "Source WAL no longer covers the delta"
            );
            return Ok(None);
        }
        Ok(Some(dest.applied_seq))
    }

    async fn snapshot_sync(&mut self) -> Result<SeqNo> {
        let (mut blob, seq) = self.source.snapshot(self.key).await?;
        self.throttle.acquire(blob.len() as u64).await;

        if let Some(dir) = &self.config.snapshots_path {
            blob = self.stage(dir, blob).await?;
        }

        let header = blob.header()?;
        let bytes = blob.len() as u64;
        self.dest.load_snapshot(self.key, blob).await?;

        self.progress.points_transferred += header.point_count;
        self.progress.bytes_transferred += bytes;
        self.progress.source_seq = seq;
        self.progress.dest_seq = seq;
        self.metrics.points_transferred.inc_by(header.point_count);
        self.metrics.bytes_transferred.inc_by(bytes);
        self.publish();

        info!(
            shard = %self.key,
            seq,
            points = header.point_count,
            bytes,
            "Snapshot shipped"
        );
        Ok(seq)
    }

    async fn stage(&self, dir: &std::path::Path, blob: SnapshotBlob) -> Result<SnapshotBlob> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!(
            "{}-{}-{}.snapshot",
            self.key.collection,
            self.key.shard_id,
            uuid::Uuid::new_v4()
        ));
        blob.write_to(&path).await?;
        let staged = SnapshotBlob::read_from(&path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "Failed to remove staged snapshot");
        }
        staged
    }

    /// Ship source records `from ..= to` to the destination. Returns the
    /// destination sequence afterwards.
    pub async fn replay(&mut self, from: SeqNo, to: SeqNo) -> Result<SeqNo> {
        let mut dest_seq = self.dest.current_sequence(self.key).await?;
        if from > to {
            return Ok(dest_seq);
        }

        let mut range = wal_range(self.source.clone(), self.key, from, to, self.config.batch_size);
        while let Some(batch) = range.next_batch().await? {
            let count = batch.len() as u64;
            let bytes: u64 = batch.iter().map(|r| r.mutation.size() as u64).sum();
            self.throttle.acquire(bytes).await;

            dest_seq = self.dest.apply_batch(self.key, batch).await?;

            self.progress.records_replayed += count;
            self.progress.bytes_transferred += bytes;
            self.progress.dest_seq = dest_seq;
            self.metrics.records_replayed.inc_by(count);
            self.metrics.bytes_transferred.inc_by(bytes);
            self.publish();
        }
        Ok(dest_seq)
    }

    /// Replay rounds until the destination trails the source by at most
    /// `cutover_lag` records.
    pub async fn catch_up(&mut self) -> Result<()> {
        for _ in 0..self.config.max_catchup_rounds {
            let source_seq = self.source.current_sequence(self.key).await?;
            let dest_seq = self.dest.current_sequence(self.key).await?;
            self.progress.source_seq = source_seq;
            self.progress.dest_seq = dest_seq;
            self.publish();

            if source_seq.saturating_sub(dest_seq) <= self.config.cutover_lag {
                debug!(
                    shard = %self.key,
                    source_seq,
                    dest_seq,
                    rounds = self.progress.catchup_rounds,
                    "Destination caught up"
                );
                return Ok(());
            }

            match self.replay(dest_seq + 1, source_seq).await {
                Ok(_) => {}
                Err(Error::Storage(StorageError::Truncated { first_retained, .. })) => {
                    self.resnapshot(first_retained).await?;
                }
                Err(e) => return Err(e),
            }
            self.progress.catchup_rounds += 1;
        }

        Err(Error::Timeout)
    }

    /// Replay the sealed tail and verify the destination matches the source.
    pub async fn finish(&mut self, sealed_seq: SeqNo) -> Result<()> {
        let dest_seq = self.dest.current_sequence(self.key).await?;
        self.progress.source_seq = sealed_seq;
        if dest_seq < sealed_seq {
            match self.replay(dest_seq + 1, sealed_seq).await {
                Ok(_) => {}
                Err(Error::Storage(StorageError::Truncated { first_retained, .. })) => {
                    self.resnapshot(first_retained).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let dest_seq = self.dest.current_sequence(self.key).await?;
        self.progress.dest_seq = dest_seq;
        self.publish();
        if dest_seq != sealed_seq {
            return Err(Error::Corrupt(format!(
                "destination at sequence {} but source sealed at {}",
                dest_seq, sealed_seq
            )));
        }
        Ok(())
    }
}
