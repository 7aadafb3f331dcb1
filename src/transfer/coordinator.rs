//! Shard transfer coordinator.
//!
//! Admits relocation requests, runs each accepted transfer on its own task
//! and publishes its state through a watch channel.
//!
//! # Lifecycle
//!
//! ```text
//! Requested ──► Syncing ──► Cutover ──► Completed
//!     │            │           │
//!     └────────────┴───────────┴──► Failed
//! ```
//!
//! During `Syncing` the source keeps taking writes until the destination is
//! close behind. `Syncing` then ends by sealing the source, replaying the
//! sealed tail and verifying the destination sequence, so `Cutover` is only
//! entered with a destination identical to the source. `Cutover` activates
//! the destination, flips ownership in the catalog and drops the source
//! copy. Cancellation is only honoured before `Cutover`.

use crate::cluster::ownership::{check_move, CollectionCatalog};
use crate::cluster::registry::PeerRegistry;
use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::storage::{ReplicaState, ShardStore, ShardStoreProvider};
use crate::transfer::journal::TransferJournal;
use crate::transfer::metrics::{TransferMetrics, TransferMetricsSnapshot};
use crate::transfer::strategy::Syncer;
use crate::transfer::throttle::Throttle;
use crate::transfer::types::{
    ShardTransfer, TransferId, TransferMethod, TransferProgress, TransferRequest, TransferState,
    CANCELLED_REASON,
};
use crate::types::{PeerId, ShardKey};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bookkeeping for one running transfer.
struct ActiveTransfer {
    id: TransferId,
    status: watch::Sender<ShardTransfer>,
    cancel: CancellationToken,
}

impl ActiveTransfer {
    fn snapshot(&self) -> ShardTransfer {
        self.status.borrow().clone()
    }

    fn involves(&self, peer_id: PeerId) -> bool {
        let t = self.status.borrow();
        t.from == peer_id || t.to == peer_id
    }
}

/// What a run has done to the cluster, for rollback.
#[derive(Debug, Default)]
struct RunMarks {
    source_sealed: bool,
    ownership_flipped: bool,
}

struct Inner {
    config: TransferConfig,
    registry: Arc<dyn PeerRegistry>,
    catalog: Arc<CollectionCatalog>,
    stores: Arc<dyn ShardStoreProvider>,
    journal: Arc<dyn TransferJournal>,
    throttle: Throttle,
    metrics: TransferMetrics,
    /// Running transfers, at most one per shard.
    active: Mutex<HashMap<ShardKey, ActiveTransfer>>,
    /// Finalized transfers, oldest first.
    history: RwLock<VecDeque<ShardTransfer>>,
}

/// Handle to the coordinator. Cheap to clone.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<Inner>,
}

impl TransferCoordinator {
    pub fn new(
        config: TransferConfig,
        registry: Arc<dyn PeerRegistry>,
        catalog: Arc<CollectionCatalog>,
        stores: Arc<dyn ShardStoreProvider>,
        journal: Arc<dyn TransferJournal>,
    ) -> Self {
        let throttle = Throttle::new(config.max_bytes_per_sec);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                catalog,
                stores,
                journal,
                throttle,
                metrics: TransferMetrics::new(),
                active: Mutex::new(HashMap::new()),
                history: RwLock::new(VecDeque::new()),
            }),
        }
    }

    /// Coordinator configuration.
    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Validate and admit a transfer, then start it in the background.
    ///
    /// Admission is atomic: the checks and the insertion into the active set
    /// happen under one lock.
    pub async fn initiate_transfer(&self, request: TransferRequest) -> Result<TransferId> {
        let transfer = match self.inner.admit(&request) {
            Ok(transfer) => transfer,
            Err(e) => {
                self.inner.metrics.rejected.inc();
                debug!(
                    shard = %request.key,
                    from = request.from_peer,
                    to = request.to_peer,
                    error = %e,
                    "Transfer rejected"
                );
                return Err(e);
            }
        };

        if let Err(e) = self.inner.journal.save(&transfer).await {
            self.inner.rollback_admission(&transfer);
            return Err(e);
        }

        self.inner.metrics.record_start();
        info!(
            transfer_id = %transfer.id,
            shard = %transfer.key,
            from = transfer.from,
            to = transfer.to,
            method = %transfer.method,
            "Transfer accepted"
        );

        let inner = self.inner.clone();
        let key = transfer.key.clone();
        let id = transfer.id;
        tokio::spawn(async move {
            inner.run(key, id).await;
        });

        Ok(id)
    }

    /// Transfers of `collection` that have not finalized. Never blocks on a
    /// running transfer.
    pub fn get_active_transfers(&self, collection: &str) -> Vec<ShardTransfer> {
        let active = self.inner.active.lock();
        let mut transfers: Vec<_> = active
            .iter()
            .filter(|(key, _)| key.collection == collection)
            .map(|(_, a)| a.snapshot())
            .collect();
        transfers.sort_by_key(|t| t.key.shard_id);
        transfers
    }

    /// Every transfer that has not finalized.
    pub fn all_active_transfers(&self) -> Vec<ShardTransfer> {
        self.inner
            .active
            .lock()
            .values()
            .map(|a| a.snapshot())
            .collect()
    }

    /// Look a transfer up in the active set, then in history.
    pub fn get_transfer(&self, id: TransferId) -> Option<ShardTransfer> {
        self.inner.find(id)
    }

    /// Finalized transfers, oldest first.
    pub fn transfer_history(&self) -> Vec<ShardTransfer> {
        self.inner.history.read().iter().cloned().collect()
    }

    /// Cancel a transfer that has not reached `Cutover`.
    ///
    /// Returns once the transfer has left the active set and the
    /// destination's partial copy has been discarded.
    pub async fn cancel_transfer(&self, id: TransferId) -> Result<()> {
        let mut status = {
            let active = self.inner.active.lock();
            let entry = active
                .values()
                .find(|a| a.id == id)
                .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;

            let state = entry.status.borrow().state;
            if state == TransferState::Cutover {
                return Err(Error::conflict(format!(
                    "transfer {} is in cutover and cannot be cancelled",
                    id
                )));
            }
            entry.cancel.cancel();
            entry.status.subscribe()
        };

        info!(transfer_id = %id, "Transfer cancellation requested");

        // The sender is dropped when the entry leaves the active set.
        while status.changed().await.is_ok() {}
        Ok(())
    }

    /// Wait for a transfer to finalize.
    pub async fn wait_transfer(&self, id: TransferId) -> Result<ShardTransfer> {
        let subscribed = {
            let active = self.inner.active.lock();
            active
                .values()
                .find(|a| a.id == id)
                .map(|a| a.status.subscribe())
        };
        let Some(mut status) = subscribed else {
            return self
                .inner
                .find_in_history(id)
                .ok_or_else(|| Error::NotFound(format!("transfer {}", id)));
        };

        loop {
            {
                let current = status.borrow_and_update();
                if current.state.is_terminal() {
                    return Ok(current.clone());
                }
            }
            if status.changed().await.is_err() {
                let last = status.borrow().clone();
                return Ok(self.inner.find_in_history(id).unwrap_or(last));
            }
        }
    }

    /// Resolve transfers left in the journal by a previous run.
    ///
    /// A transfer whose ownership flip already happened is completed; every
    /// other one is marked failed and its markers are cleared.
    pub async fn recover(&self) -> Result<Vec<ShardTransfer>> {
        let pending = self.inner.journal.load_active().await?;
        let mut recovered = Vec::with_capacity(pending.len());

        for mut transfer in pending {
            if self.inner.active.lock().contains_key(&transfer.key) {
                continue;
            }

            let flipped = self
                .inner
                .catalog
                .placement(&transfer.key)
                .map(|p| p.has_replica(transfer.to) && !p.has_replica(transfer.from))
                .unwrap_or(false);

            if flipped {
                if transfer.state == TransferState::Cutover {
                    transfer.set_state(TransferState::Completed)?;
                } else {
                    transfer.fail("interrupted after ownership flip");
                }
                if let Ok(source) = self.inner.stores.store(transfer.from) {
                    if let Err(e) = source.drop_replica(&transfer.key).await {
                        warn!(
                            transfer_id = %transfer.id,
                            shard = %transfer.key,
                            peer_id = transfer.from,
                            error = %e,
                            "Failed to drop source copy of recovered transfer"
                        );
                    }
                }
            } else {
                // The source may have been sealed at the end of `Syncing`.
                let marks = RunMarks {
                    source_sealed: transfer.state != TransferState::Requested,
                    ..Default::default()
                };
                self.inner.rollback(&transfer, &marks, false).await;
                transfer.fail("interrupted by restart");
            }

            if let Err(e) = self.inner.journal.archive(&transfer).await {
                warn!(
                    transfer_id = %transfer.id,
                    error = %e,
                    "Failed to archive recovered transfer"
                );
            }
            info!(
                transfer_id = %transfer.id,
                shard = %transfer.key,
                state = %transfer.state,
                "Recovered transfer"
            );
            self.inner.push_history(transfer.clone());
            recovered.push(transfer);
        }

        Ok(recovered)
    }

    /// Metrics snapshot.
    pub fn metrics(&self) -> TransferMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl Inner {
    fn admit(&self, request: &TransferRequest) -> Result<ShardTransfer> {
        let key = &request.key;
        let (from, to) = (request.from_peer, request.to_peer);

        if from == to {
            return Err(Error::conflict(format!(
                "cannot move shard {} from peer {} to itself",
                key, from
            )));
        }
        if !self.catalog.contains(&key.collection) {
            return Err(Error::NotFound(format!("collection {}", key.collection)));
        }
        for peer_id in [from, to] {
            let peer = self.registry.resolve(peer_id).map_err(|_| Error::InvalidPeer {
                peer_id,
                reason: "unknown peer".into(),
            })?;
            if !peer.is_live() {
                return Err(Error::InvalidPeer {
                    peer_id,
                    reason: format!("peer is {}", peer.status),
                });
            }
        }
        let placement = self.catalog.placement(key)?;
        check_move(key, &placement, from, to)?;

        let mut active = self.active.lock();
        if let Some(existing) = active.get(key) {
            return Err(Error::conflict(format!(
                "shard {} already has transfer {} in progress",
                key, existing.id
            )));
        }
        if active.len() >= self.config.max_concurrent_transfers {
            return Err(Error::TransferLimit {
                peer_id: None,
                limit: self.config.max_concurrent_transfers,
            });
        }
        for peer_id in [from, to] {
            let busy = active.values().filter(|a| a.involves(peer_id)).count();
            if busy >= self.config.max_transfers_per_peer {
                return Err(Error::TransferLimit {
                    peer_id: Some(peer_id),
                    limit: self.config.max_transfers_per_peer,
                });
            }
        }

        self.catalog.begin_receiving(key, from, to)?;

        let transfer = ShardTransfer::new(request);
        let (status, _) = watch::channel(transfer.clone());
        active.insert(
            key.clone(),
            ActiveTransfer {
                id: transfer.id,
                status,
                cancel: CancellationToken::new(),
            },
        );
        Ok(transfer)
    }

    fn rollback_admission(&self, transfer: &ShardTransfer) {
        let mut active = self.active.lock();
        if active.get(&transfer.key).map(|a| a.id) == Some(transfer.id) {
            active.remove(&transfer.key);
        }
        drop(active);
        self.catalog.abort_receiving(&transfer.key, transfer.to);
    }

    fn find(&self, id: TransferId) -> Option<ShardTransfer> {
        let active = self.active.lock().values().find(|a| a.id == id).map(|a| a.snapshot());
        active.or_else(|| self.find_in_history(id))
    }

    fn find_in_history(&self, id: TransferId) -> Option<ShardTransfer> {
        self.history.read().iter().rev().find(|t| t.id == id).cloned()
    }

    fn push_history(&self, transfer: ShardTransfer) {
        let mut history = self.history.write();
        history.push_back(transfer);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    /// Current record and cancellation token of the transfer on `key`.
    fn current(
        &self,
        key: &ShardKey,
        id: TransferId,
    ) -> Result<(ShardTransfer, CancellationToken)> {
        let active = self.active.lock();
        match active.get(key) {
            Some(entry) if entry.id == id => Ok((entry.snapshot(), entry.cancel.clone())),
            _ => Err(Error::NotFound(format!("transfer {}", id))),
        }
    }

    /// Apply `f` to the published record.
    fn update<F>(&self, key: &ShardKey, id: TransferId, f: F)
    where
        F: FnOnce(&mut ShardTransfer),
    {
        let active = self.active.lock();
        if let Some(entry) = active.get(key).filter(|e| e.id == id) {
            entry.status.send_modify(f);
        }
    }

    /// Move to `next`, refusing if a cancellation was requested. The check and
    /// the transition share the lock `cancel_transfer` uses.
    fn transition(
        &self,
        key: &ShardKey,
        id: TransferId,
        next: TransferState,
    ) -> Result<ShardTransfer> {
        let active = self.active.lock();
        let entry = active
            .get(key)
            .filter(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
        if entry.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut result = Ok(());
        entry.status.send_modify(|t| result = t.set_state(next));
        result?;
        Ok(entry.snapshot())
    }

    async fn persist(&self, key: &ShardKey, id: TransferId) {
        let record = match self.current(key, id) {
            Ok((record, _)) => record,
            Err(_) => return,
        };
        if let Err(e) = self.journal.save(&record).await {
            warn!(transfer_id = %id, error = %e, "Failed to journal transfer state");
        }
    }

    async fn run(self: Arc<Self>, key: ShardKey, id: TransferId) {
        let mut marks = RunMarks::default();
        let result = self.drive(&key, id, &mut marks).await;

        let (mut record, _) = match self.current(&key, id) {
            Ok(current) => current,
            Err(e) => {
                error!(transfer_id = %id, error = %e, "Transfer vanished from the active set");
                return;
            }
        };

        match &result {
            Ok(()) => {
                if let Err(e) = record.set_state(TransferState::Completed) {
                    record.fail(e.to_string());
                }
            }
            Err(Error::Cancelled) => {
                self.rollback(&record, &marks, true).await;
                record.fail(CANCELLED_REASON);
            }
            Err(e) => {
                self.rollback(&record, &marks, false).await;
                record.fail(e.to_string());
            }
        }

        if let Err(e) = self.journal.archive(&record).await {
            warn!(transfer_id = %id, error = %e, "Failed to archive transfer");
        }

        match record.state {
            TransferState::Completed => {
                self.metrics.record_completed(record.duration());
                info!(
                    transfer_id = %id,
                    shard = %key,
                    from = record.from,
                    to = record.to,
                    method = %record.effective_method.unwrap_or(record.method),
                    duration_ms = record.duration().as_millis() as u64,
                    "Transfer completed"
                );
            }
            _ => {
                let cancelled = record.is_cancelled();
                self.metrics.record_failed(cancelled);
                warn!(
                    transfer_id = %id,
                    shard = %key,
                    from = record.from,
                    to = record.to,
                    error = record.error.as_deref().unwrap_or(""),
                    "Transfer failed"
                );
            }
        }

        {
            let mut active = self.active.lock();
            self.push_history(record.clone());
            if let Some(entry) = active.get(&key).filter(|e| e.id == id) {
                let published = record.clone();
                entry.status.send_modify(|t| *t = published);
            }
            active.remove(&key);
        }
    }

    async fn drive(&self, key: &ShardKey, id: TransferId, marks: &mut RunMarks) -> Result<()> {
        let (transfer, cancel) = self.current(key, id)?;
        let source = self.stores.store(transfer.from)?;
        let dest = self.stores.store(transfer.to)?;

        self.transition(key, id, TransferState::Syncing)?;
        self.persist(key, id).await;

        let report = move |p: &TransferProgress| {
            let progress = p.clone();
            self.update(key, id, |t| t.progress = progress);
        };
        let mut syncer = Syncer::new(
            key,
            source.clone(),
            dest.clone(),
            &self.config,
            &self.throttle,
            &self.metrics,
            Box::new(report),
        );

        let synced: Result<Instant> = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = async {
                let effective = syncer.initial_sync(transfer.method).await?;
                self.record_method(&transfer, effective);
                syncer.catch_up().await?;

                let sealed_at = Instant::now();
                let sealed = tokio::time::timeout(
                    self.config.cutover_timeout,
                    self.seal(key, &transfer, &source, &mut syncer, marks),
                )
                .await;
                match sealed {
                    Ok(result) => result?,
                    Err(_) => return Err(Error::Timeout),
                }
                self.record_method(&transfer, syncer.method());
                Ok::<_, Error>(sealed_at)
            } => result,
        };
        let sealed_at = synced?;

        self.transition(key, id, TransferState::Cutover)?;
        self.persist(key, id).await;

        let remaining = self
            .config
            .cutover_timeout
            .saturating_sub(sealed_at.elapsed());
        match tokio::time::timeout(remaining, self.cutover(key, &transfer, &dest, marks)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        }
        self.metrics.cutover.observe_duration(sealed_at.elapsed());

        if let Err(e) = source.drop_replica(key).await {
            warn!(
                transfer_id = %id,
                shard = %key,
                peer_id = transfer.from,
                error = %e,
                "Failed to drop source copy after cutover"
            );
        }
        Ok(())
    }

    /// Publish the method that brought the destination up to date, logging
    /// when it differs from the requested one.
    fn record_method(&self, transfer: &ShardTransfer, effective: TransferMethod) {
        let mut previous = None;
        self.update(&transfer.key, transfer.id, |t| {
            previous = t.effective_method.replace(effective);
        });
        if effective != transfer.method && previous != Some(effective) {
            info!(
                transfer_id = %transfer.id,
                shard = %transfer.key,
                requested = %transfer.method,
                effective = %effective,
                "Transfer method fell back"
            );
        }
    }

    /// Seal the source and replay its final tail. Returns once the
    /// destination holds exactly the sealed sequence.
    async fn seal(
        &self,
        key: &ShardKey,
        transfer: &ShardTransfer,
        source: &Arc<dyn ShardStore>,
        syncer: &mut Syncer<'_>,
        marks: &mut RunMarks,
    ) -> Result<()> {
        // Set first so a seal interrupted by cancellation is still undone.
        marks.source_sealed = true;
        let sealed_seq = source.set_state(key, ReplicaState::Sealed).await?;
        debug!(transfer_id = %transfer.id, shard = %key, sealed_seq, "Source sealed");
        syncer.finish(sealed_seq).await
    }

    /// Activate the destination and flip ownership.
    async fn cutover(
        &self,
        key: &ShardKey,
        transfer: &ShardTransfer,
        dest: &Arc<dyn ShardStore>,
        marks: &mut RunMarks,
    ) -> Result<()> {
        dest.set_state(key, ReplicaState::Active).await?;

        self.catalog.cutover(key, transfer.from, transfer.to)?;
        marks.ownership_flipped = true;
        Ok(())
    }

    /// Undo what a failed or cancelled run left behind. The source stays the
    /// owner; the destination copy is demoted, or dropped when cancelled.
    async fn rollback(&self, transfer: &ShardTransfer, marks: &RunMarks, cancelled: bool) {
        let key = &transfer.key;
        if marks.ownership_flipped {
            return;
        }

        if marks.source_sealed {
            let unsealed = match self.stores.store(transfer.from) {
                Ok(source) => source.set_state(key, ReplicaState::Active).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = unsealed {
                error!(
                    shard = %key,
                    peer_id = transfer.from,
                    error = %e,
                    "Failed to unseal source"
                );
            }
        }

        if let Ok(dest) = self.stores.store(transfer.to) {
            let result = if cancelled {
                dest.drop_replica(key).await.map(|_| ())
            } else {
                match dest.replica_info(key).await {
                    Ok(Some(_)) => dest.set_state(key, ReplicaState::Partial).await.map(|_| ()),
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                warn!(
                    shard = %key,
                    peer_id = transfer.to,
                    error = %e,
                    "Failed to clean destination copy"
                );
            }
        }

        self.catalog.abort_receiving(key, transfer.to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::registry::PeerTable;
    use crate::config::StoreConfig;
    use crate::storage::{LocalShardStore, LocalStores};
    use crate::transfer::journal::InMemoryTransferJournal;
    use crate::types::{Mutation, PeerInfo, Point};

    const COLLECTION: &str = "benchmark";

    struct Fixture {
        coordinator: TransferCoordinator,
        catalog: Arc<CollectionCatalog>,
        registry: Arc<PeerTable>,
        journal: Arc<InMemoryTransferJournal>,
        stores: Vec<Arc<LocalShardStore>>,
    }

    impl Fixture {
        fn store(&self, peer_id: PeerId) -> &Arc<LocalShardStore> {
            &self.stores[peer_id as usize - 1]
        }
    }

    fn key(shard_id: u32) -> ShardKey {
        ShardKey::new(COLLECTION, shard_id)
    }

    /// Three peers, four shards, one replica each: shard `s` lives on peer
    /// `s % 3 + 1`. Shard 0 holds 20 points.
    async fn fixture(config: TransferConfig) -> Fixture {
        let registry = Arc::new(PeerTable::new(PeerInfo::new(1, "127.0.0.1:6335"), 3));
        registry.join(2, "127.0.0.1:6336");
        registry.join(3, "127.0.0.1:6337");

        let catalog = Arc::new(CollectionCatalog::new());
        let layout = catalog
            .create_collection(COLLECTION, 4, 1, &[1, 2, 3])
            .unwrap();

        let provider = Arc::new(LocalStores::new());
        let stores: Vec<_> = (1..=3)
            .map(|peer_id| Arc::new(LocalShardStore::new(peer_id, StoreConfig::default())))
            .collect();
        for store in &stores {
            provider.insert(store.clone());
        }
        for (shard_id, placement) in &layout.shards {
            for peer_id in &placement.replicas {
                stores[*peer_id as usize - 1]
                    .create_replica(&key(*shard_id))
                    .await
                    .unwrap();
            }
        }
        for id in 0..20 {
            stores[0]
                .write(&key(0), Mutation::Upsert(Point::new(id, vec![id as f32, 1.0])))
                .await
                .unwrap();
        }

        let journal = Arc::new(InMemoryTransferJournal::new());
        let coordinator = TransferCoordinator::new(
            config,
            registry.clone(),
            catalog.clone(),
            provider,
            journal.clone(),
        );
        Fixture {
            coordinator,
            catalog,
            registry,
            journal,
            stores,
        }
    }

    /// A byte rate low enough that a transfer stays in `Syncing`.
    fn stalled() -> TransferConfig {
        TransferConfig::default().with_max_bytes_per_sec(1)
    }

    #[tokio::test]
    async fn test_move_completes_and_flips_ownership() {
        let f = fixture(TransferConfig::default()).await;
        let id = f
            .coordinator
            .initiate_transfer(TransferRequest::new(key(0), 1, 2))
            .await
            .unwrap();

        let done = f.coordinator.wait_transfer(id).await.unwrap();
        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(done.effective_method, Some(TransferMethod::Snapshot));

        assert_eq!(f.catalog.owners(&key(0)).unwrap(), vec![2]);
        assert!(!f.catalog.placement(&key(0)).unwrap().is_receiving(2));
        assert_eq!(f.store(2).point_count(&key(0)), 20);
        assert!(f.store(1).replica_info(&key(0)).await.unwrap().is_none());
        let info = f.store(2).replica_info(&key(0)).await.unwrap().unwrap();
        assert_eq!(info.state, ReplicaState::Active);

        assert!(f.coordinator.get_active_transfers(COLLECTION).is_empty());
        assert_eq!(f.coordinator.transfer_history().len(), 1);
        assert!(f.journal.load_active().await.unwrap().is_empty());

        let metrics = f.coordinator.metrics();
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.cutover.count, 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests() {
        let f = fixture(TransferConfig::default()).await;
        let c = &f.coordinator;

        let err = c.initiate_transfer(TransferRequest::new(key(0), 1, 1)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = c
            .initiate_transfer(TransferRequest::new(ShardKey::new("missing", 0), 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = c.initiate_transfer(TransferRequest::new(key(0), 1, 9)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPeer { peer_id: 9, .. }));

        let err = c.initiate_transfer(TransferRequest::new(key(0), 2, 3)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidShard { shard_id: 0, .. }));

        let err = c.initiate_transfer(TransferRequest::new(key(7), 1, 2)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidShard { shard_id: 7, .. }));

        for _ in 0..3 {
            f.registry.mark_failed(3);
        }
        let err = c.initiate_transfer(TransferRequest::new(key(0), 1, 3)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPeer { peer_id: 3, .. }));

        assert_eq!(c.metrics().rejected, 6);
        assert_eq!(c.metrics().started, 0);
        assert!(!f.catalog.placement(&key(0)).unwrap().is_receiving(2));
    }

    #[tokio::test]
    async fn test_second_transfer_of_shard_conflicts() {
        let f = fixture(stalled()).await;
        let id = f
            .coordinator
            .initiate_transfer(TransferRequest::new(key(0), 1, 2))
            .await
            .unwrap();

        let err = f
            .coordinator
            .initiate_transfer(TransferRequest::new(key(0), 1, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        f.coordinator.cancel_transfer(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_limits() {
        let f = fixture(stalled().with_max_transfers_per_peer(1)).await;
        let first = f
            .coordinator
            .initiate_transfer(TransferRequest::new(key(0), 1, 2))
            .await
            .unwrap();

        let err = f
            .coordinator
            .initiate_transfer(TransferRequest::new(key(3), 1, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferLimit { peer_id: Some(1), limit: 1 }));
        f.coordinator.cancel_transfer(first).await.unwrap();

        let f = fixture(stalled().with_max_concurrent_transfers(1)).await;
        let first = f
            .coordinator
            .initiate_transfer(TransferRequest::new(key(0), 1, 2))
            .await
            .unwrap();
        let err = f
            .coordinator
            .initiate_transfer(TransferRequest::new(key(2), 3, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferLimit { peer_id: None, limit: 1 }));
        f.coordinator.cancel_transfer(first).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_restores_source_ownership() {
        let f = fixture(stalled()).await;
        let id = f
            .coordinator
            .initiate_transfer(TransferRequest::new(key(0), 1, 2))
            .await
            .unwrap();
        assert_eq!(f.coordinator.get_active_transfers(COLLECTION).len(), 1);

        f.coordinator.cancel_transfer(id).await.unwrap();

        assert!(f.coordinator.get_active_transfers(COLLECTION).is_empty());
        let finished = f.coordinator.get_transfer(id).unwrap();
        assert!(finished.is_cancelled());
        assert_eq!(f.catalog.owners(&key(0)).unwrap(), vec![1]);
        assert!(!f.catalog.placement(&key(0)).unwrap().is_receiving(2));
        assert!(f.store(2).replica_info(&key(0)).await.unwrap().is_none());
        assert_eq!(f.coordinator.metrics().cancelled, 1);

        let err = f.coordinator.cancel_transfer(id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // The shard can be moved again right away.
        f.coordinator
            .initiate_transfer(TransferRequest::new(key(0), 1, 2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recover_rolls_back_interrupted_transfer() {
        let f = fixture(TransferConfig::default()).await;
        let mut pending = ShardTransfer::new(&TransferRequest::new(key(0), 1, 2));
        pending.set_state(TransferState::Syncing).unwrap();
        pending.set_state(TransferState::Cutover).unwrap();
        f.catalog.begin_receiving(&key(0), 1, 2).unwrap();
        f.store(1).set_state(&key(0), ReplicaState::Sealed).await.unwrap();
        f.journal.save(&pending).await.unwrap();

        let recovered = f.coordinator.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].state, TransferState::Failed);

        assert!(!f.catalog.placement(&key(0)).unwrap().is_receiving(2));
        f.store(1)
            .write(&key(0), Mutation::Delete(1))
            .await
            .unwrap();
        assert!(f.journal.load_active().await.unwrap().is_empty());
        assert_eq!(f.coordinator.transfer_history()[0].id, pending.id);
    }

    #[tokio::test]
    async fn test_recover_completes_flipped_transfer() {
        let f = fixture(TransferConfig::default()).await;
        let mut pending = ShardTransfer::new(&TransferRequest::new(key(0), 1, 2));
        pending.set_state(TransferState::Syncing).unwrap();
        pending.set_state(TransferState::Cutover).unwrap();
        f.catalog.begin_receiving(&key(0), 1, 2).unwrap();
        f.catalog.cutover(&key(0), 1, 2).unwrap();
        f.journal.save(&pending).await.unwrap();

        let recovered = f.coordinator.recover().await.unwrap();
        assert_eq!(recovered[0].state, TransferState::Completed);
        assert!(f.store(1).replica_info(&key(0)).await.unwrap().is_none());
    }
}
