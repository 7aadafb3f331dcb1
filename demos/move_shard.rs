//! Move a shard between peers while points are being written.
//!
//! Starts three nodes on ephemeral ports, fills a collection, moves one of
//! its shards with continuous upserts in the background and verifies that
//! nothing was lost.
//!
//!   RUST_LOG=ferry=info cargo run --example move-shard

use ferry::api::{ClusterOperation, CollectionClusterInfo, ControlCommand, MoveShard, PointStruct};
use ferry::consistency::ConsistencyChecker;
use ferry::transfer::{TransferMethod, TransferState};
use ferry::{Node, NodeConfig};
use std::sync::Arc;
use std::time::Duration;

const COLLECTION: &str = "benchmark";

fn points(ids: std::ops::Range<u64>) -> Vec<PointStruct> {
    ids.map(|id| PointStruct {
        id,
        vector: vec![id as f32, (id % 7) as f32, 1.0],
        payload: Default::default(),
    })
    .collect()
}

async fn cluster_info(node: &Node) -> Result<CollectionClusterInfo, Box<dyn std::error::Error>> {
    let response = node
        .execute(ControlCommand::ClusterInfo {
            collection: COLLECTION.into(),
            peer_id: None,
        })
        .await?;
    let value = response.result.ok_or("cluster info failed")?;
    Ok(serde_json::from_value(value)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "ferry=info".to_string()))
        .init();

    let dir = tempfile::tempdir()?;
    let config = |peer_id: u64| {
        NodeConfig::new(peer_id, "127.0.0.1:0".parse().expect("valid address"))
            .with_storage_path(dir.path().join(format!("peer-{}", peer_id)))
            .with_snapshots_path(dir.path().join(format!("snapshots-{}", peer_id)))
            .with_health_check_interval(Duration::from_millis(200))
    };

    let first = Node::start(config(1)).await?;
    let second = Node::start(config(2).with_bootstrap(first.addr())).await?;
    let third = Node::start(config(3).with_bootstrap(first.addr())).await?;
    println!("Cluster: {} / {} / {}", first.addr(), second.addr(), third.addr());

    second
        .execute(ControlCommand::CreateCollection {
            collection: COLLECTION.into(),
            shard_count: 4,
            replication_factor: 1,
        })
        .await?;
    second
        .execute(ControlCommand::UpsertPoints {
            collection: COLLECTION.into(),
            points: points(0..2_000),
            wait: true,
        })
        .await?;

    // Shard 3 starts on peer 1; send it to peer 2 while writes continue.
    let writer = {
        let node = Arc::clone(&third);
        tokio::spawn(async move {
            for batch in 0..20u64 {
                let start = 2_000 + batch * 50;
                let _ = node
                    .execute(ControlCommand::UpsertPoints {
                        collection: COLLECTION.into(),
                        points: points(start..start + 50),
                        wait: true,
                    })
                    .await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let moved = second
        .execute(ControlCommand::UpdateCluster {
            collection: COLLECTION.into(),
            operation: ClusterOperation::MoveShard(MoveShard {
                shard_id: 3,
                from_peer_id: 1,
                to_peer_id: 2,
                method: TransferMethod::Snapshot,
            }),
        })
        .await?;
    println!("move_shard accepted: {}", moved.is_ok());

    loop {
        let info = cluster_info(&first).await?;
        match info.shard_transfers.first() {
            Some(transfer) => println!(
                "  shard {} {} -> {}: {:?} {}",
                transfer.shard_id,
                transfer.from,
                transfer.to,
                transfer.state,
                transfer.comment.as_deref().unwrap_or("")
            ),
            None => break,
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    writer.await?;

    if let Some(coordinator) = first.coordinator() {
        for transfer in coordinator.transfer_history() {
            println!("Transfer {} finished as {:?}", transfer.id, transfer.state);
            if transfer.state != TransferState::Completed {
                return Err("shard move did not complete".into());
            }
        }
    }

    let info = cluster_info(&second).await?;
    for shard in &info.local_shards {
        println!(
            "peer 2 holds shard {} ({} points, {:?})",
            shard.shard_id, shard.points_count, shard.state
        );
    }

    if let Some(control) = first.control() {
        let checker = ConsistencyChecker::new(control.stores());
        for report in checker.check_collection(first.catalog(), COLLECTION).await? {
            println!(
                "shard {}: {:?} consistent={}",
                report.key.shard_id,
                report.point_counts,
                report.is_consistent()
            );
        }
    }

    third.shutdown().await;
    second.shutdown().await;
    first.shutdown().await;
    Ok(())
}
