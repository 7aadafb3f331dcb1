//! A ferry node: peer transport, local shard store and, on the peer holding
//! cluster metadata, the catalog, transfer coordinator and control API.
//!
//! ```text
//!              ┌──────────────── metadata holder ───────────────┐
//!  control ──► │ ClusterControl ─► TransferCoordinator ─► stores │ ──► peers
//!              │       │                   │                     │
//!              │  WriteRouter        CollectionCatalog           │
//!              └─────────────────────────────────────────────────┘
//! ```
//!
//! A node started without a bootstrap address holds the metadata. Nodes
//! started with one join it and forward control commands to it.

use crate::api::{encode_response, ApiResponse, ClusterControl, ControlCommand};
use crate::cluster::ownership::CollectionCatalog;
use crate::cluster::registry::PeerTable;
use crate::cluster::router::WriteRouter;
use crate::config::NodeConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{
    JoinRequest, JoinResponse, Message, PingRequest, PongResponse, RemoteError,
};
use crate::network::{
    serve_store_op, MessageHandler, PeerClient, PeerServer, RemoteStoreProvider, TransportConfig,
};
use crate::storage::LocalShardStore;
use crate::transfer::{FileTransferJournal, TransferCoordinator};
use crate::types::{PeerId, PeerInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CATALOG_FILE: &str = "catalog.bin";
const JOURNAL_DIR: &str = "transfers";

/// Components only the metadata holder runs.
struct Metadata {
    control: Arc<ClusterControl>,
    coordinator: TransferCoordinator,
    catalog_path: PathBuf,
}

/// A running node.
pub struct Node {
    peer_id: PeerId,
    addr: String,
    local_addr: SocketAddr,
    registry: Arc<PeerTable>,
    store: Arc<LocalShardStore>,
    catalog: Arc<CollectionCatalog>,
    metadata: Option<Metadata>,
    bootstrap: Option<Arc<PeerClient>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a node: bind the transport, restore metadata and either recover
    /// interrupted transfers or join the bootstrap peer.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let peer_id = config.peer_id;
        tokio::fs::create_dir_all(&config.storage_path).await?;

        let server = PeerServer::bind(config.listen_addr, peer_id).await?;
        let local_addr = server.local_addr();
        let addr = if config.listen_addr.port() == 0 {
            local_addr.to_string()
        } else {
            config.advertised()
        };

        let registry = Arc::new(PeerTable::new(
            PeerInfo::new(peer_id, addr.clone()),
            config.failure_threshold,
        ));
        let store = Arc::new(LocalShardStore::new(peer_id, config.store.clone()));
        let stores = Arc::new(RemoteStoreProvider::new(
            store.clone(),
            registry.clone(),
            TransportConfig::default(),
        ));

        let joining = config.cluster_enabled && config.bootstrap.is_some();
        let (catalog, metadata) = if joining {
            (Arc::new(CollectionCatalog::new()), None)
        } else {
            let catalog_path = config.storage_path.join(CATALOG_FILE);
            let catalog = Arc::new(CollectionCatalog::load(&catalog_path).await?);

            let mut transfer = config.transfer.clone();
            if transfer.snapshots_path.is_none() {
                transfer.snapshots_path = Some(config.snapshots_path.clone());
            }
            let journal =
                Arc::new(FileTransferJournal::open(config.storage_path.join(JOURNAL_DIR)).await?);
            let router = Arc::new(WriteRouter::new(
                catalog.clone(),
                stores.clone(),
                transfer.write_timeout,
                transfer.retry_backoff,
            ));
            let coordinator = TransferCoordinator::new(
                transfer,
                registry.clone(),
                catalog.clone(),
                stores.clone(),
                journal,
            );
            let control = Arc::new(ClusterControl::new(
                registry.clone(),
                catalog.clone(),
                stores,
                coordinator.clone(),
                router,
            ));
            (
                catalog,
                Some(Metadata {
                    control,
                    coordinator,
                    catalog_path,
                }),
            )
        };

        let bootstrap = config
            .bootstrap
            .as_ref()
            .filter(|_| joining)
            .map(|addr| Arc::new(PeerClient::new(addr.clone(), TransportConfig::default())));

        let node = Arc::new(Self {
            peer_id,
            addr,
            local_addr,
            registry,
            store,
            catalog,
            metadata,
            bootstrap,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let handler = Arc::new(NodeHandler { node: node.clone() });
        let server_task = server.spawn(handler, node.shutdown.clone());
        node.tasks.lock().push(server_task);

        if let Some(metadata) = &node.metadata {
            let recovered = metadata.coordinator.recover().await?;
            if !recovered.is_empty() {
                info!(peer_id, count = recovered.len(), "Recovered interrupted transfers");
            }
            if config.cluster_enabled {
                let task = tokio::spawn(health_loop(node.clone(), config.health_check_interval));
                node.tasks.lock().push(task);
            }
        } else {
            node.join().await?;
        }

        info!(
            peer_id,
            addr = %node.addr,
            metadata_holder = node.is_metadata_holder(),
            "Node started"
        );
        Ok(node)
    }

    async fn join(&self) -> Result<()> {
        let Some(bootstrap) = &self.bootstrap else {
            return Ok(());
        };
        let request = Message::Join(JoinRequest {
            peer_id: self.peer_id,
            addr: self.addr.clone(),
        });
        match bootstrap.request(&request).await? {
            Message::Joined(JoinResponse {
                peer_id,
                peers,
                catalog,
            }) => {
                for peer in peers.into_iter().filter(|p| p.id != self.peer_id) {
                    self.registry.join(peer.id, peer.addr);
                }
                self.catalog.install(catalog);
                info!(
                    peer_id = self.peer_id,
                    bootstrap = bootstrap.addr(),
                    metadata_holder = peer_id,
                    "Joined cluster"
                );
                Ok(())
            }
            Message::Error(e) => Err(e.into()),
            other => Err(NetworkError::UnexpectedResponse(other.name().to_string()).into()),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Address advertised to other peers.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Address the transport is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_metadata_holder(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn registry(&self) -> &Arc<PeerTable> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<LocalShardStore> {
        &self.store
    }

    /// Ownership map. On a joined peer this is the copy taken at join time.
    pub fn catalog(&self) -> &Arc<CollectionCatalog> {
        &self.catalog
    }

    pub fn coordinator(&self) -> Option<&TransferCoordinator> {
        self.metadata.as_ref().map(|m| &m.coordinator)
    }

    pub fn control(&self) -> Option<&Arc<ClusterControl>> {
        self.metadata.as_ref().map(|m| &m.control)
    }

    /// Execute a control command here or on the metadata holder.
    pub async fn execute(&self, command: ControlCommand) -> Result<ApiResponse<serde_json::Value>> {
        if let Some(metadata) = &self.metadata {
            return Ok(metadata.control.execute(command, self.peer_id).await);
        }
        let command = match command {
            ControlCommand::ClusterInfo {
                collection,
                peer_id: None,
            } => ControlCommand::ClusterInfo {
                collection,
                peer_id: Some(self.peer_id),
            },
            other => other,
        };
        let reply = self.forward(serde_json::to_string(&command)?).await?;
        Ok(serde_json::from_str(&reply)?)
    }

    async fn forward(&self, body: String) -> Result<String> {
        let bootstrap = self
            .bootstrap
            .as_ref()
            .ok_or_else(|| Error::Internal("no metadata holder to forward to".into()))?;
        match bootstrap.request(&Message::Control(body)).await? {
            Message::ControlReply(reply) => Ok(reply),
            Message::Error(e) => Err(e.into()),
            other => Err(NetworkError::UnexpectedResponse(other.name().to_string()).into()),
        }
    }

    async fn save_catalog(&self) {
        if let Some(metadata) = &self.metadata {
            if let Err(e) = self.catalog.save(&metadata.catalog_path).await {
                warn!(peer_id = self.peer_id, error = %e, "Failed to persist catalog");
            }
        }
    }

    /// Stop background tasks and persist the catalog.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.save_catalog().await;
        info!(peer_id = self.peer_id, "Node stopped");
    }
}

/// Serves peer messages for a node.
struct NodeHandler {
    node: Arc<Node>,
}

#[async_trait]
impl MessageHandler for NodeHandler {
    async fn handle(&self, msg: Message) -> Message {
        let node = &self.node;
        match msg {
            Message::Ping(PingRequest { peer_id, .. }) => {
                node.registry.mark_seen(peer_id);
                Message::Pong(PongResponse {
                    peer_id: node.peer_id,
                    addr: node.addr.clone(),
                })
            }
            Message::Join(JoinRequest { peer_id, addr }) => {
                if !node.is_metadata_holder() {
                    return Message::Error(RemoteError::Other(format!(
                        "peer {} does not hold cluster metadata",
                        node.peer_id
                    )));
                }
                node.registry.join(peer_id, addr);
                Message::Joined(JoinResponse {
                    peer_id: node.peer_id,
                    peers: node.registry.peers(),
                    catalog: node.catalog.export(),
                })
            }
            Message::Store(request) => Message::StoreReply(
                serve_store_op(node.store.as_ref(), request)
                    .await
                    .map_err(|e| RemoteError::from(&e)),
            ),
            Message::Control(body) => match &node.metadata {
                Some(metadata) => {
                    Message::ControlReply(metadata.control.execute_json(&body, node.peer_id).await)
                }
                None => match node.forward(body).await {
                    Ok(reply) => Message::ControlReply(reply),
                    Err(e) => Message::ControlReply(encode_response(&ApiResponse::error(
                        &e,
                        std::time::Instant::now(),
                    ))),
                },
            },
            other => Message::Error(RemoteError::Other(format!(
                "unexpected message {}",
                other.name()
            ))),
        }
    }
}

/// Ping every remote peer each interval and persist catalog changes.
async fn health_loop(node: Arc<Node>, interval: Duration) {
    let mut clients: HashMap<PeerId, Arc<PeerClient>> = HashMap::new();
    let transport = TransportConfig {
        connect_timeout: interval,
        request_timeout: interval,
        ..Default::default()
    };
    let mut saved_version = node.catalog.version();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = node.shutdown.cancelled() => break,
        }

        for peer in node.registry.remote_peers() {
            let client = clients
                .entry(peer.id)
                .or_insert_with(|| Arc::new(PeerClient::new(peer.addr.clone(), transport.clone())))
                .clone();
            if client.addr() != peer.addr {
                clients.remove(&peer.id);
                continue;
            }

            let ping = Message::Ping(PingRequest {
                peer_id: node.peer_id,
                addr: node.addr.clone(),
            });
            match client.request(&ping).await {
                Ok(Message::Pong(_)) => node.registry.mark_seen(peer.id),
                Ok(other) => {
                    debug!(peer_id = peer.id, reply = other.name(), "Unexpected ping reply");
                    node.registry.mark_failed(peer.id);
                }
                Err(e) => {
                    debug!(peer_id = peer.id, error = %e, "Health check failed");
                    node.registry.mark_failed(peer.id);
                }
            }
        }

        let version = node.catalog.version();
        if version != saved_version {
            node.save_catalog().await;
            saved_version = version;
        }
    }
}
