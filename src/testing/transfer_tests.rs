//! End-to-end shard transfer scenarios on a [`LocalCluster`].

use crate::api::ShardState;
use crate::config::TransferConfig;
use crate::error::Error;
use crate::storage::{ReplicaState, ShardStore};
use crate::testing::cluster::{LocalCluster, LocalClusterConfig};
use crate::testing::failpoint::FailpointAction;
use crate::transfer::{
    ShardTransfer, TransferId, TransferJournal, TransferMethod, TransferRequest, TransferState,
};
use crate::types::{Mutation, ShardKey};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const COLLECTION: &str = "benchmark";

fn key(shard_id: u32) -> ShardKey {
    ShardKey::new(COLLECTION, shard_id)
}

/// Four shards over three peers. With `replication_factor` 2 shard 3 lives
/// on peers 1 and 2.
async fn cluster(replication_factor: usize, transfer: TransferConfig) -> LocalCluster {
    let cluster = LocalCluster::new(LocalClusterConfig::new(3).with_transfer(transfer));
    cluster
        .create_collection(COLLECTION, 4, replication_factor)
        .await
        .unwrap();
    cluster
}

async fn wait_for_state(cluster: &LocalCluster, state: TransferState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let transfers = cluster.coordinator().get_active_transfers(COLLECTION);
            if transfers.iter().any(|t| t.state == state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_move_under_concurrent_writes_loses_nothing() {
    let cluster = cluster(2, TransferConfig::default().with_batch_size(16)).await;
    cluster.upsert(COLLECTION, 0..200).await.unwrap();

    let router = cluster.router().clone();
    let writer = tokio::spawn(async move {
        for start in (200..1_200).step_by(10) {
            let points = (start..start + 10).map(crate::testing::cluster::point).collect();
            router.upsert(COLLECTION, points).await.unwrap();
            tokio::task::yield_now().await;
        }
    });

    let id = cluster
        .move_shard(&key(3), 1, 3, TransferMethod::Snapshot)
        .await
        .unwrap();
    let done = cluster.wait(id).await.unwrap();
    writer.await.unwrap();

    assert_eq!(done.state, TransferState::Completed, "{:?}", done.error);
    let mut owners = cluster.catalog().owners(&key(3)).unwrap();
    owners.sort_unstable();
    assert_eq!(owners, vec![2, 3]);
    assert!(cluster.store(1).replica_info(&key(3)).await.unwrap().is_none());

    for report in cluster.check_consistency(COLLECTION).await.unwrap() {
        assert!(report.is_consistent(), "{:?}", report);
    }
    assert_eq!(cluster.point_count(COLLECTION).await.unwrap(), 1_200);
}

#[tokio::test]
async fn test_ownership_is_never_split() {
    let cluster = Arc::new(cluster(2, TransferConfig::default()).await);
    cluster.upsert(COLLECTION, 0..500).await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let observer = {
        let cluster = cluster.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut observed = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let owners = cluster.catalog().owners(&key(3)).unwrap();
                assert_eq!(owners.len(), 2);
                let moving: Vec<_> = owners.iter().filter(|p| **p == 1 || **p == 3).collect();
                assert_eq!(moving.len(), 1, "owners {:?}", owners);
                assert!(owners.contains(&2));
                observed += 1;
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    let id = cluster
        .move_shard(&key(3), 1, 3, TransferMethod::Snapshot)
        .await
        .unwrap();
    assert_eq!(cluster.wait(id).await.unwrap().state, TransferState::Completed);
    stop.store(true, Ordering::Relaxed);
    assert!(observer.await.unwrap() > 0);
}

#[tokio::test]
async fn test_cancel_while_syncing_keeps_source() {
    let cluster = cluster(1, TransferConfig::default().with_max_bytes_per_sec(1)).await;
    cluster.upsert(COLLECTION, 0..100).await.unwrap();
    let before = cluster.store(1).point_count(&key(3));

    let id = cluster
        .move_shard(&key(3), 1, 2, TransferMethod::Snapshot)
        .await
        .unwrap();
    wait_for_state(&cluster, TransferState::Syncing).await;

    cluster.coordinator().cancel_transfer(id).await.unwrap();

    assert!(cluster.coordinator().get_active_transfers(COLLECTION).is_empty());
    let finished = cluster.coordinator().get_transfer(id).unwrap();
    assert!(finished.is_cancelled());
    assert_eq!(cluster.catalog().owners(&key(3)).unwrap(), vec![1]);
    assert!(cluster.catalog().placement(&key(3)).unwrap().receiving.is_empty());
    assert!(cluster.store(2).replica_info(&key(3)).await.unwrap().is_none());

    // The source keeps serving writes.
    cluster.upsert(COLLECTION, 100..200).await.unwrap();
    assert!(cluster.store(1).point_count(&key(3)) > before);
    assert_eq!(cluster.point_count(COLLECTION).await.unwrap(), 200);

    let err = cluster.coordinator().cancel_transfer(id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_back_to_back_moves_of_one_shard() {
    let cluster = cluster(1, TransferConfig::default().with_max_bytes_per_sec(1)).await;
    cluster.upsert(COLLECTION, 0..50).await.unwrap();

    let first = cluster
        .move_shard(&key(3), 1, 2, TransferMethod::Snapshot)
        .await
        .unwrap();
    let err = cluster
        .move_shard(&key(3), 1, 3, TransferMethod::Snapshot)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{}", err);
    assert_eq!(cluster.coordinator().get_active_transfers(COLLECTION).len(), 1);

    cluster.coordinator().cancel_transfer(first).await.unwrap();
    let second = cluster
        .move_shard(&key(3), 1, 3, TransferMethod::Snapshot)
        .await
        .unwrap();
    assert_ne!(first, second);
    cluster.coordinator().cancel_transfer(second).await.unwrap();
    assert_eq!(cluster.coordinator().transfer_history().len(), 2);
}

#[tokio::test]
async fn test_unreachable_destination_fails_transfer() {
    let cluster = cluster(1, TransferConfig::default()).await;
    cluster.upsert(COLLECTION, 0..100).await.unwrap();
    cluster
        .failpoints(2)
        .enable("load_snapshot", FailpointAction::Fail);

    let id = cluster
        .move_shard(&key(3), 1, 2, TransferMethod::Snapshot)
        .await
        .unwrap();
    let done = cluster.wait(id).await.unwrap();

    assert_eq!(done.state, TransferState::Failed);
    assert!(done.error.as_deref().unwrap_or("").contains("unreachable"));
    assert_eq!(cluster.catalog().owners(&key(3)).unwrap(), vec![1]);
    assert!(cluster.catalog().placement(&key(3)).unwrap().receiving.is_empty());
    let source = cluster.store(1).replica_info(&key(3)).await.unwrap().unwrap();
    assert_eq!(source.state, ReplicaState::Active);
    assert_eq!(cluster.coordinator().metrics().failed, 1);

    cluster.upsert(COLLECTION, 100..150).await.unwrap();
    assert_eq!(cluster.point_count(COLLECTION).await.unwrap(), 150);
}

#[tokio::test]
async fn test_dead_destination_rejected() {
    let cluster = cluster(1, TransferConfig::default()).await;
    cluster.kill(2);
    let err = cluster
        .move_shard(&key(3), 1, 2, TransferMethod::Snapshot)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPeer { peer_id: 2, .. }), "{}", err);

    cluster.revive(2);
    let id = cluster
        .move_shard(&key(3), 1, 2, TransferMethod::Snapshot)
        .await
        .unwrap();
    assert_eq!(cluster.wait(id).await.unwrap().state, TransferState::Completed);
}

/// Start moving shard 3 from peer 1 to 2 and hold it in `Cutover` by
/// delaying the destination's activation.
async fn held_in_cutover(cluster: &LocalCluster) -> TransferId {
    cluster.upsert(COLLECTION, 0..200).await.unwrap();
    cluster
        .failpoints(2)
        .enable("set_state", FailpointAction::Sleep(Duration::from_millis(500)));
    let id = cluster
        .move_shard(&key(3), 1, 2, TransferMethod::Snapshot)
        .await
        .unwrap();
    wait_for_state(cluster, TransferState::Cutover).await;
    id
}

#[tokio::test]
async fn test_cutover_starts_with_sealed_source_and_identical_copy() {
    let cluster = cluster(1, TransferConfig::default()).await;
    let id = held_in_cutover(&cluster).await;

    let err = cluster
        .store(1)
        .write(&key(3), Mutation::Upsert(crate::testing::cluster::point(10_000)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardSealed { peer_id: 1, .. }), "{}", err);

    let source_seq = cluster.store(1).current_sequence(&key(3)).await.unwrap();
    let dest_seq = cluster.store(2).current_sequence(&key(3)).await.unwrap();
    assert_eq!(source_seq, dest_seq);
    assert_eq!(
        cluster.store(1).point_count(&key(3)),
        cluster.store(2).point_count(&key(3))
    );

    let done = cluster.wait(id).await.unwrap();
    assert_eq!(done.state, TransferState::Completed, "{:?}", done.error);
    assert_eq!(cluster.point_count(COLLECTION).await.unwrap(), 200);
}

#[tokio::test]
async fn test_cancel_during_cutover_is_refused() {
    let cluster = cluster(1, TransferConfig::default()).await;
    let id = held_in_cutover(&cluster).await;

    let err = cluster.coordinator().cancel_transfer(id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{}", err);

    let done = cluster.wait(id).await.unwrap();
    assert_eq!(done.state, TransferState::Completed, "{:?}", done.error);
    assert!(!done.is_cancelled());
    assert_eq!(cluster.catalog().owners(&key(3)).unwrap(), vec![2]);
    assert_eq!(cluster.coordinator().metrics().cancelled, 0);
}

#[tokio::test]
async fn test_recover_survives_failed_source_cleanup() {
    let cluster = cluster(1, TransferConfig::default()).await;
    cluster.upsert(COLLECTION, 0..50).await.unwrap();

    let mut pending = ShardTransfer::new(&TransferRequest::new(key(3), 1, 2));
    pending.set_state(TransferState::Syncing).unwrap();
    pending.set_state(TransferState::Cutover).unwrap();
    cluster.catalog().begin_receiving(&key(3), 1, 2).unwrap();
    cluster.catalog().cutover(&key(3), 1, 2).unwrap();
    cluster.journal().save(&pending).await.unwrap();
    cluster
        .failpoints(1)
        .enable("drop_replica", FailpointAction::Fail);

    let recovered = cluster.coordinator().recover().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].state, TransferState::Completed);
    assert!(cluster.store(1).replica_info(&key(3)).await.unwrap().is_some());
    assert_eq!(cluster.failpoints(1).stats("drop_replica").unwrap().triggered_count, 1);
    assert!(cluster.journal().load_active().await.unwrap().is_empty());
}

/// Fail a snapshot move at activation, leaving a dormant copy on peer 2.
async fn dormant_copy(cluster: &LocalCluster) {
    cluster.upsert(COLLECTION, 0..200).await.unwrap();
    cluster
        .failpoints(2)
        .enable("set_state", FailpointAction::FailOnce);
    let id = cluster
        .move_shard(&key(3), 1, 2, TransferMethod::Snapshot)
        .await
        .unwrap();
    assert_eq!(cluster.wait(id).await.unwrap().state, TransferState::Failed);

    let copy = cluster.store(2).replica_info(&key(3)).await.unwrap().unwrap();
    assert_eq!(copy.state, ReplicaState::Partial);
    assert_eq!(cluster.catalog().owners(&key(3)).unwrap(), vec![1]);
}

#[tokio::test]
async fn test_wal_delta_retry_ships_only_new_records() {
    let cluster = cluster(1, TransferConfig::default()).await;
    dormant_copy(&cluster).await;
    let stale = cluster.store(2).current_sequence(&key(3)).await.unwrap();

    cluster.upsert(COLLECTION, 200..400).await.unwrap();
    let source_seq = cluster.store(1).current_sequence(&key(3)).await.unwrap();
    assert!(source_seq > stale);

    let id = cluster
        .move_shard(&key(3), 1, 2, TransferMethod::WalDelta)
        .await
        .unwrap();
    let done = cluster.wait(id).await.unwrap();

    assert_eq!(done.state, TransferState::Completed, "{:?}", done.error);
    assert_eq!(done.effective_method, Some(TransferMethod::WalDelta));
    assert_eq!(done.progress.points_transferred, 0);
    assert_eq!(done.progress.records_replayed, source_seq - stale);
    assert_eq!(cluster.catalog().owners(&key(3)).unwrap(), vec![2]);
    assert_eq!(cluster.point_count(COLLECTION).await.unwrap(), 400);
}

#[tokio::test]
async fn test_wal_delta_falls_back_after_truncation() {
    let cluster = cluster(1, TransferConfig::default()).await;
    dormant_copy(&cluster).await;

    cluster.upsert(COLLECTION, 200..400).await.unwrap();
    let source_seq = cluster.store(1).current_sequence(&key(3)).await.unwrap();
    let removed = cluster.store(1).compact_wal(&key(3), source_seq).await.unwrap();
    assert!(removed > 0);

    let id = cluster
        .move_shard(&key(3), 1, 2, TransferMethod::WalDelta)
        .await
        .unwrap();
    let done = cluster.wait(id).await.unwrap();

    assert_eq!(done.state, TransferState::Completed, "{:?}", done.error);
    assert_eq!(done.method, TransferMethod::WalDelta);
    assert_eq!(done.effective_method, Some(TransferMethod::Snapshot));
    assert!(done.progress.points_transferred > 0);
    assert_eq!(cluster.coordinator().metrics().fallbacks, 1);
    assert_eq!(cluster.point_count(COLLECTION).await.unwrap(), 400);
}

#[tokio::test]
async fn test_cluster_info_reports_transfer() {
    let cluster = cluster(1, TransferConfig::default().with_max_bytes_per_sec(1)).await;
    cluster.upsert(COLLECTION, 0..40).await.unwrap();

    let id = cluster
        .move_shard(&key(3), 1, 3, TransferMethod::Snapshot)
        .await
        .unwrap();
    wait_for_state(&cluster, TransferState::Syncing).await;

    let info = cluster.control().cluster_info(COLLECTION, 3).await.unwrap();
    assert_eq!(info.shard_count, 4);
    let receiving = info.local_shards.iter().find(|s| s.shard_id == 3).unwrap();
    assert_eq!(receiving.state, ShardState::Partial);
    assert_eq!(info.shard_transfers.len(), 1);
    let transfer = &info.shard_transfers[0];
    assert_eq!((transfer.shard_id, transfer.from, transfer.to), (3, 1, 3));
    assert_eq!(transfer.state, TransferState::Syncing);

    let source_view = cluster.control().cluster_info(COLLECTION, 1).await.unwrap();
    let owned = source_view.local_shards.iter().find(|s| s.shard_id == 3).unwrap();
    assert_eq!(owned.state, ShardState::Active);
    assert!(source_view
        .remote_shards
        .iter()
        .any(|r| r.shard_id == 3 && r.peer_id == 3 && r.state == ShardState::Partial));

    cluster.coordinator().cancel_transfer(id).await.unwrap();
    let info = cluster.control().cluster_info(COLLECTION, 3).await.unwrap();
    assert!(info.local_shards.iter().all(|s| s.shard_id != 3));
    assert!(info.shard_transfers.is_empty());
}
