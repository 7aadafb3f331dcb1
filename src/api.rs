//! Cluster control API.
//!
//! Typed requests and responses for the collection cluster endpoints:
//!
//! ```text
//! GET  /collections/{name}/cluster        -> CollectionClusterInfo
//! POST /collections/{name}/cluster        {"move_shard": {...}} | {"abort_transfer": {...}}
//! PUT  /collections/{name}/points?wait=.. {"points": [...]}
//! ```
//!
//! Commands travel as JSON [`ControlCommand`] values; every answer is wrapped
//! in an [`ApiResponse`].

use crate::cluster::ownership::{CollectionCatalog, LocalRole};
use crate::cluster::registry::{PeerRegistry, PeerTable};
use crate::cluster::router::WriteRouter;
use crate::error::{Error, ErrorKind, Result};
use crate::storage::{ReplicaState, ShardStoreProvider};
use crate::transfer::{TransferCoordinator, TransferMethod, TransferRequest, TransferState};
use crate::types::{PeerId, Point, PointId, ShardId, ShardKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Envelope of every API answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    pub status: ApiStatus,
    /// Seconds spent handling the request.
    pub time: f64,
    /// Error category, for front ends mapping it to a transport status.
    #[serde(skip)]
    pub kind: Option<ErrorKind>,
}

/// `"ok"` or `{"error": "<message>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    Ok,
    Error(String),
}

impl<T> ApiResponse<T> {
    pub fn ok(result: T, started: Instant) -> Self {
        Self {
            result: Some(result),
            status: ApiStatus::Ok,
            time: started.elapsed().as_secs_f64(),
            kind: None,
        }
    }

    pub fn error(err: &Error, started: Instant) -> Self {
        Self {
            result: None,
            status: ApiStatus::Error(err.to_string()),
            time: started.elapsed().as_secs_f64(),
            kind: Some(err.kind()),
        }
    }

    pub fn from_result(result: Result<T>, started: Instant) -> Self {
        match result {
            Ok(value) => Self::ok(value, started),
            Err(e) => Self::error(&e, started),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ApiStatus::Ok
    }

    /// HTTP status a front end should answer with.
    pub fn http_status(&self) -> u16 {
        match self.kind {
            None => 200,
            Some(kind) => status_code(kind),
        }
    }
}

/// HTTP status for an error category.
pub fn status_code(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::InvalidPeer | ErrorKind::InvalidShard => 400,
        ErrorKind::NotFound => 404,
        ErrorKind::Conflict => 409,
        ErrorKind::Unreachable | ErrorKind::Unavailable => 503,
        ErrorKind::Corrupt | ErrorKind::Internal => 500,
    }
}

/// Replica state as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    Active,
    Partial,
    Sealed,
    Dead,
}

impl From<ReplicaState> for ShardState {
    fn from(state: ReplicaState) -> Self {
        match state {
            ReplicaState::Active => ShardState::Active,
            ReplicaState::Partial => ShardState::Partial,
            ReplicaState::Sealed => ShardState::Sealed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalShardInfo {
    pub shard_id: ShardId,
    pub points_count: u64,
    pub state: ShardState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteShardInfo {
    pub shard_id: ShardId,
    pub peer_id: PeerId,
    pub state: ShardState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardTransferInfo {
    pub shard_id: ShardId,
    pub from: PeerId,
    pub to: PeerId,
    pub method: TransferMethod,
    pub state: TransferState,
    /// Always false: only moves exist, never replica copies.
    pub sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Cluster view of one collection from one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionClusterInfo {
    pub peer_id: PeerId,
    pub shard_count: u32,
    pub local_shards: Vec<LocalShardInfo>,
    pub remote_shards: Vec<RemoteShardInfo>,
    pub shard_transfers: Vec<ShardTransferInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveShard {
    pub shard_id: ShardId,
    pub from_peer_id: PeerId,
    pub to_peer_id: PeerId,
    #[serde(default)]
    pub method: TransferMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortTransfer {
    pub shard_id: ShardId,
    pub from_peer_id: PeerId,
    pub to_peer_id: PeerId,
}

/// Body of `POST /collections/{name}/cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterOperation {
    MoveShard(MoveShard),
    AbortTransfer(AbortTransfer),
}

/// One point in an upsert body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointStruct {
    pub id: PointId,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, String>,
}

impl From<PointStruct> for Point {
    fn from(p: PointStruct) -> Self {
        Point {
            id: p.id,
            vector: p.vector,
            payload: p.payload,
        }
    }
}

/// Body of `PUT /collections/{name}/points`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointsList {
    pub points: Vec<PointStruct>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    /// Accepted; applied in the background.
    Acknowledged,
    /// Applied to every replica.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub operation_id: u64,
    pub status: UpdateStatus,
}

/// A control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    CreateCollection {
        collection: String,
        shard_count: u32,
        replication_factor: usize,
    },
    /// `peer_id` selects whose view to report; defaults to the peer
    /// answering.
    ClusterInfo {
        collection: String,
        #[serde(default)]
        peer_id: Option<PeerId>,
    },
    UpdateCluster {
        collection: String,
        operation: ClusterOperation,
    },
    UpsertPoints {
        collection: String,
        points: Vec<PointStruct>,
        #[serde(default)]
        wait: bool,
    },
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::CreateCollection { .. } => "create_collection",
            ControlCommand::ClusterInfo { .. } => "cluster_info",
            ControlCommand::UpdateCluster { .. } => "update_cluster",
            ControlCommand::UpsertPoints { .. } => "upsert_points",
        }
    }
}

/// Executes control commands against the peer holding cluster metadata.
pub struct ClusterControl {
    registry: Arc<PeerTable>,
    catalog: Arc<CollectionCatalog>,
    stores: Arc<dyn ShardStoreProvider>,
    coordinator: TransferCoordinator,
    router: Arc<WriteRouter>,
    next_operation: AtomicU64,
}

impl ClusterControl {
    pub fn new(
        registry: Arc<PeerTable>,
        catalog: Arc<CollectionCatalog>,
        stores: Arc<dyn ShardStoreProvider>,
        coordinator: TransferCoordinator,
        router: Arc<WriteRouter>,
    ) -> Self {
        Self {
            registry,
            catalog,
            stores,
            coordinator,
            router,
            next_operation: AtomicU64::new(0),
        }
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    /// Stores of every peer, local or remote.
    pub fn stores(&self) -> Arc<dyn ShardStoreProvider> {
        self.stores.clone()
    }

    /// Create a collection over the live peers and an empty replica on each
    /// assigned peer.
    pub async fn create_collection(
        &self,
        collection: &str,
        shard_count: u32,
        replication_factor: usize,
    ) -> Result<bool> {
        let mut peers: Vec<PeerId> = self
            .registry
            .peers()
            .into_iter()
            .filter(|p| p.is_live())
            .map(|p| p.id)
            .collect();
        peers.sort_unstable();

        let layout = self
            .catalog
            .create_collection(collection, shard_count, replication_factor, &peers)?;
        for (shard_id, placement) in &layout.shards {
            let key = ShardKey::new(collection, *shard_id);
            for peer_id in &placement.replicas {
                self.stores.store(*peer_id)?.create_replica(&key).await?;
            }
        }
        Ok(true)
    }

    /// Cluster view of `collection` as seen by `peer_id`.
    pub async fn cluster_info(
        &self,
        collection: &str,
        peer_id: PeerId,
    ) -> Result<CollectionClusterInfo> {
        let layout = self.catalog.layout(collection)?;

        let mut local_shards = Vec::new();
        for (shard_id, role) in self.catalog.local_shards(collection, peer_id)? {
            let key = ShardKey::new(collection, shard_id);
            let info = match self.stores.store(peer_id) {
                Ok(store) => store.replica_info(&key).await.ok().flatten(),
                Err(_) => None,
            };
            let state = match (role, &info) {
                (LocalRole::Receiving, _) => ShardState::Partial,
                (LocalRole::Replica, Some(info)) => info.state.into(),
                (LocalRole::Replica, None) => ShardState::Dead,
            };
            local_shards.push(LocalShardInfo {
                shard_id,
                points_count: info.map(|i| i.point_count).unwrap_or(0),
                state,
            });
        }

        let mut remote_shards = Vec::new();
        for (shard_id, placement) in &layout.shards {
            for replica in placement.replicas.iter().filter(|p| **p != peer_id) {
                let state = if self.registry.is_live(*replica) {
                    ShardState::Active
                } else {
                    ShardState::Dead
                };
                remote_shards.push(RemoteShardInfo {
                    shard_id: *shard_id,
                    peer_id: *replica,
                    state,
                });
            }
            for receiving in placement.receiving.iter().filter(|p| **p != peer_id) {
                remote_shards.push(RemoteShardInfo {
                    shard_id: *shard_id,
                    peer_id: *receiving,
                    state: ShardState::Partial,
                });
            }
        }

        let shard_transfers = self
            .coordinator
            .get_active_transfers(collection)
            .into_iter()
            .map(|t| ShardTransferInfo {
                shard_id: t.key.shard_id,
                from: t.from,
                to: t.to,
                method: t.effective_method.unwrap_or(t.method),
                state: t.state,
                sync: false,
                comment: Some(t.comment()),
            })
            .collect();

        Ok(CollectionClusterInfo {
            peer_id,
            shard_count: layout.shard_count,
            local_shards,
            remote_shards,
            shard_transfers,
        })
    }

    /// Apply a cluster operation. Returns `true` once it is accepted.
    pub async fn update_cluster(
        &self,
        collection: &str,
        operation: ClusterOperation,
    ) -> Result<bool> {
        match operation {
            ClusterOperation::MoveShard(op) => {
                let request = TransferRequest::new(
                    ShardKey::new(collection, op.shard_id),
                    op.from_peer_id,
                    op.to_peer_id,
                )
                .with_method(op.method);
                let id = self.coordinator.initiate_transfer(request).await?;
                info!(
                    transfer_id = %id,
                    collection,
                    shard_id = op.shard_id,
                    from = op.from_peer_id,
                    to = op.to_peer_id,
                    "Shard move requested"
                );
                Ok(true)
            }
            ClusterOperation::AbortTransfer(op) => {
                let transfer = self
                    .coordinator
                    .get_active_transfers(collection)
                    .into_iter()
                    .find(|t| {
                        t.key.shard_id == op.shard_id
                            && t.from == op.from_peer_id
                            && t.to == op.to_peer_id
                    })
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "transfer of shard {} from {} to {}",
                            op.shard_id, op.from_peer_id, op.to_peer_id
                        ))
                    })?;
                self.coordinator.cancel_transfer(transfer.id).await?;
                Ok(true)
            }
        }
    }

    /// Upsert points. With `wait` the call returns after every replica
    /// applied them.
    pub async fn upsert_points(
        &self,
        collection: &str,
        points: Vec<PointStruct>,
        wait: bool,
    ) -> Result<UpdateResult> {
        if !self.catalog.contains(collection) {
            return Err(Error::NotFound(format!("collection {}", collection)));
        }
        let operation_id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let points: Vec<Point> = points.into_iter().map(Point::from).collect();

        if wait {
            self.router.upsert(collection, points).await?;
            return Ok(UpdateResult {
                operation_id,
                status: UpdateStatus::Completed,
            });
        }

        let router = self.router.clone();
        let collection = collection.to_string();
        tokio::spawn(async move {
            if let Err(e) = router.upsert(&collection, points).await {
                warn!(
                    operation_id,
                    collection = %collection,
                    error = %e,
                    "Background upsert failed"
                );
            }
        });
        Ok(UpdateResult {
            operation_id,
            status: UpdateStatus::Acknowledged,
        })
    }

    /// Execute a command. `local_peer_id` answers `ClusterInfo` without an
    /// explicit peer.
    pub async fn execute(
        &self,
        command: ControlCommand,
        local_peer_id: PeerId,
    ) -> ApiResponse<serde_json::Value> {
        let started = Instant::now();
        let result = match command {
            ControlCommand::CreateCollection {
                collection,
                shard_count,
                replication_factor,
            } => to_value(
                self.create_collection(&collection, shard_count, replication_factor)
                    .await,
            ),
            ControlCommand::ClusterInfo {
                collection,
                peer_id,
            } => to_value(
                self.cluster_info(&collection, peer_id.unwrap_or(local_peer_id))
                    .await,
            ),
            ControlCommand::UpdateCluster {
                collection,
                operation,
            } => to_value(self.update_cluster(&collection, operation).await),
            ControlCommand::UpsertPoints {
                collection,
                points,
                wait,
            } => to_value(self.upsert_points(&collection, points, wait).await),
        };
        ApiResponse::from_result(result, started)
    }

    /// Execute a JSON-encoded command and return the JSON response.
    pub async fn execute_json(&self, body: &str, local_peer_id: PeerId) -> String {
        let response = match serde_json::from_str::<ControlCommand>(body) {
            Ok(command) => self.execute(command, local_peer_id).await,
            Err(e) => ApiResponse::error(
                &Error::Config(format!("invalid command: {}", e)),
                Instant::now(),
            ),
        };
        encode_response(&response)
    }
}

fn to_value<T: Serialize>(result: Result<T>) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(result?)?)
}

/// Serialize a response, falling back to a bare error envelope.
pub fn encode_response(response: &ApiResponse<serde_json::Value>) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        format!(r#"{{"status":{{"error":"response encoding failed: {}"}},"time":0.0}}"#, e)
    })
}
