//! Client side of the peer transport.
//!
//! [`PeerClient`] sends one request per pooled connection and waits for the
//! reply. [`RemoteShardStore`] exposes a peer's shard store through the
//! [`ShardStore`] trait, and [`RemoteStoreProvider`] resolves peers through
//! the registry, short-circuiting the local peer.

use crate::cluster::registry::PeerRegistry;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::Counter;
use crate::network::rpc::{read_frame, write_frame, Message, StoreOp, StoreReply, StoreRequest};
use crate::storage::{ReplicaInfo, ReplicaState, ShardStore, ShardStoreProvider, SnapshotBlob};
use crate::types::{Mutation, MutationRecord, PeerId, Point, PointId, SeqNo, ShardKey};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Configuration for transport behavior.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Time allowed for one request/response exchange.
    pub request_timeout: Duration,
    /// Idle connections kept per peer.
    pub max_idle_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            max_idle_connections: 4,
        }
    }
}

/// Request counters of one client.
#[derive(Debug)]
pub struct ClientMetrics {
    pub requests: Counter,
    pub failures: Counter,
    pub connections_created: Counter,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self {
            requests: Counter::new("transport_requests"),
            failures: Counter::new("transport_failures"),
            connections_created: Counter::new("transport_connections_created"),
        }
    }
}

/// Request/response client for one peer address.
#[derive(Debug)]
pub struct PeerClient {
    addr: String,
    config: TransportConfig,
    idle: Mutex<Vec<TcpStream>>,
    metrics: ClientMetrics,
}

impl PeerClient {
    pub fn new(addr: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            idle: Mutex::new(Vec::new()),
            metrics: ClientMetrics::default(),
        }
    }

    /// Address this client talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    async fn connect(&self) -> Result<TcpStream> {
        let connect = TcpStream::connect(&self.addr);
        let stream = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: "connect timeout".into(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        self.metrics.connections_created.inc();
        debug!(addr = %self.addr, "Connected to peer");
        Ok(stream)
    }

    /// Send `msg` and wait for the reply.
    ///
    /// The connection is only returned to the pool after a complete
    /// exchange; a dropped or failed request discards it.
    pub async fn request(&self, msg: &Message) -> Result<Message> {
        self.metrics.requests.inc();
        let pooled = self.idle.lock().pop();
        let mut stream = match pooled {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        trace!(addr = %self.addr, message = msg.name(), "Sending request");
        let exchange = async {
            write_frame(&mut stream, msg).await?;
            read_frame(&mut stream).await
        };
        let reply = match tokio::time::timeout(self.config.request_timeout, exchange).await {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                self.metrics.failures.inc();
                return Err(NetworkError::ConnectionClosed.into());
            }
            Ok(Err(e)) => {
                self.metrics.failures.inc();
                return Err(e);
            }
            Err(_) => {
                self.metrics.failures.inc();
                return Err(Error::Timeout);
            }
        };

        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle_connections {
            idle.push(stream);
        }
        Ok(reply)
    }
}

/// A peer's shard store reached over the transport.
pub struct RemoteShardStore {
    peer_id: PeerId,
    client: Arc<PeerClient>,
}

impl RemoteShardStore {
    pub fn new(peer_id: PeerId, client: Arc<PeerClient>) -> Self {
        Self { peer_id, client }
    }

    /// Transport failures become `Unreachable`; errors reported by the peer
    /// keep their meaning.
    async fn call(&self, key: &ShardKey, op: StoreOp) -> Result<StoreReply> {
        let request = Message::Store(StoreRequest {
            key: key.clone(),
            op,
        });
        let reply = self
            .client
            .request(&request)
            .await
            .map_err(|e| Error::Unreachable {
                peer_id: self.peer_id,
                reason: e.to_string(),
            })?;

        match reply {
            Message::StoreReply(Ok(reply)) => Ok(reply),
            Message::StoreReply(Err(e)) | Message::Error(e) => Err(e.into()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(msg: Message) -> Error {
    NetworkError::UnexpectedResponse(msg.name().to_string()).into()
}

fn mismatch(reply: StoreReply) -> Error {
    NetworkError::UnexpectedResponse(format!("store reply {}", reply.name())).into()
}

#[async_trait]
impl ShardStore for RemoteShardStore {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn snapshot(&self, key: &ShardKey) -> Result<(SnapshotBlob, SeqNo)> {
        match self.call(key, StoreOp::Snapshot).await? {
            StoreReply::Snapshot { blob, seq } => Ok((blob, seq)),
            other => Err(mismatch(other)),
        }
    }

    async fn load_snapshot(&self, key: &ShardKey, blob: SnapshotBlob) -> Result<SeqNo> {
        match self.call(key, StoreOp::LoadSnapshot(blob)).await? {
            StoreReply::Seq(seq) => Ok(seq),
            other => Err(mismatch(other)),
        }
    }

    async fn read_wal(
        &self,
        key: &ShardKey,
        from: SeqNo,
        to: SeqNo,
        limit: usize,
    ) -> Result<Vec<MutationRecord>> {
        match self.call(key, StoreOp::ReadWal { from, to, limit }).await? {
            StoreReply::Records(records) => Ok(records),
            other => Err(mismatch(other)),
        }
    }

    async fn apply(&self, key: &ShardKey, record: MutationRecord) -> Result<SeqNo> {
        match self.call(key, StoreOp::Apply(record)).await? {
            StoreReply::Seq(seq) => Ok(seq),
            other => Err(mismatch(other)),
        }
    }

    async fn apply_batch(&self, key: &ShardKey, records: Vec<MutationRecord>) -> Result<SeqNo> {
        match self.call(key, StoreOp::ApplyBatch(records)).await? {
            StoreReply::Seq(seq) => Ok(seq),
            other => Err(mismatch(other)),
        }
    }

    async fn current_sequence(&self, key: &ShardKey) -> Result<SeqNo> {
        match self.call(key, StoreOp::CurrentSequence).await? {
            StoreReply::Seq(seq) => Ok(seq),
            other => Err(mismatch(other)),
        }
    }

    async fn replica_info(&self, key: &ShardKey) -> Result<Option<ReplicaInfo>> {
        match self.call(key, StoreOp::ReplicaInfo).await? {
            StoreReply::Info(info) => Ok(info),
            other => Err(mismatch(other)),
        }
    }

    async fn create_replica(&self, key: &ShardKey) -> Result<()> {
        match self.call(key, StoreOp::CreateReplica).await? {
            StoreReply::Done => Ok(()),
            other => Err(mismatch(other)),
        }
    }

    async fn write(&self, key: &ShardKey, mutation: Mutation) -> Result<SeqNo> {
        match self.call(key, StoreOp::Write(mutation)).await? {
            StoreReply::Seq(seq) => Ok(seq),
            other => Err(mismatch(other)),
        }
    }

    async fn set_state(&self, key: &ShardKey, state: ReplicaState) -> Result<SeqNo> {
        match self.call(key, StoreOp::SetState(state)).await? {
            StoreReply::Seq(seq) => Ok(seq),
            other => Err(mismatch(other)),
        }
    }

    async fn drop_replica(&self, key: &ShardKey) -> Result<bool> {
        match self.call(key, StoreOp::DropReplica).await? {
            StoreReply::Dropped(existed) => Ok(existed),
            other => Err(mismatch(other)),
        }
    }

    async fn scroll(&self, key: &ShardKey, offset: PointId, limit: usize) -> Result<Vec<Point>> {
        match self.call(key, StoreOp::Scroll { offset, limit }).await? {
            StoreReply::Points(points) => Ok(points),
            other => Err(mismatch(other)),
        }
    }

    async fn compact_wal(&self, key: &ShardKey, up_to: SeqNo) -> Result<usize> {
        match self.call(key, StoreOp::CompactWal { up_to }).await? {
            StoreReply::Compacted(n) => Ok(n),
            other => Err(mismatch(other)),
        }
    }
}

/// Execute a store request against a local store. Used by the server side.
pub async fn serve_store_op(store: &dyn ShardStore, request: StoreRequest) -> Result<StoreReply> {
    let key = &request.key;
    Ok(match request.op {
        StoreOp::Snapshot => {
            let (blob, seq) = store.snapshot(key).await?;
            StoreReply::Snapshot { blob, seq }
        }
        StoreOp::LoadSnapshot(blob) => StoreReply::Seq(store.load_snapshot(key, blob).await?),
        StoreOp::ReadWal { from, to, limit } => {
            StoreReply::Records(store.read_wal(key, from, to, limit).await?)
        }
        StoreOp::Apply(record) => StoreReply::Seq(store.apply(key, record).await?),
        StoreOp::ApplyBatch(records) => StoreReply::Seq(store.apply_batch(key, records).await?),
        StoreOp::CurrentSequence => StoreReply::Seq(store.current_sequence(key).await?),
        StoreOp::ReplicaInfo => StoreReply::Info(store.replica_info(key).await?),
        StoreOp::CreateReplica => {
            store.create_replica(key).await?;
            StoreReply::Done
        }
        StoreOp::Write(mutation) => StoreReply::Seq(store.write(key, mutation).await?),
        StoreOp::SetState(state) => StoreReply::Seq(store.set_state(key, state).await?),
        StoreOp::DropReplica => StoreReply::Dropped(store.drop_replica(key).await?),
        StoreOp::Scroll { offset, limit } => {
            StoreReply::Points(store.scroll(key, offset, limit).await?)
        }
        StoreOp::CompactWal { up_to } => {
            StoreReply::Compacted(store.compact_wal(key, up_to).await?)
        }
    })
}

/// Store provider for a networked peer.
pub struct RemoteStoreProvider {
    local: Arc<dyn ShardStore>,
    registry: Arc<dyn PeerRegistry>,
    config: TransportConfig,
    /// Cached remote stores, keyed by peer and invalidated when the address
    /// changes.
    remotes: RwLock<HashMap<PeerId, (String, Arc<RemoteShardStore>)>>,
}

impl RemoteStoreProvider {
    pub fn new(
        local: Arc<dyn ShardStore>,
        registry: Arc<dyn PeerRegistry>,
        config: TransportConfig,
    ) -> Self {
        Self {
            local,
            registry,
            config,
            remotes: RwLock::new(HashMap::new()),
        }
    }
}

impl ShardStoreProvider for RemoteStoreProvider {
    fn store(&self, peer_id: PeerId) -> Result<Arc<dyn ShardStore>> {
        if peer_id == self.local.peer_id() {
            return Ok(self.local.clone());
        }

        let peer = self.registry.resolve(peer_id).map_err(|_| Error::Unreachable {
            peer_id,
            reason: "unknown peer".into(),
        })?;

        if let Some((addr, store)) = self.remotes.read().get(&peer_id) {
            if *addr == peer.addr {
                return Ok(store.clone());
            }
        }

        let client = Arc::new(PeerClient::new(peer.addr.clone(), self.config.clone()));
        let store = Arc::new(RemoteShardStore::new(peer_id, client));
        self.remotes
            .write()
            .insert(peer_id, (peer.addr, store.clone()));
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::registry::PeerTable;
    use crate::config::StoreConfig;
    use crate::network::server::{MessageHandler, PeerServer};
    use crate::network::rpc::RemoteError;
    use crate::storage::LocalShardStore;
    use crate::types::PeerInfo;
    use tokio_util::sync::CancellationToken;

    struct StoreHandler(Arc<LocalShardStore>);

    #[async_trait]
    impl MessageHandler for StoreHandler {
        async fn handle(&self, msg: Message) -> Message {
            match msg {
                Message::Store(req) => Message::StoreReply(
                    serve_store_op(self.0.as_ref(), req)
                        .await
                        .map_err(|e| RemoteError::from(&e)),
                ),
                other => Message::Error(RemoteError::Other(format!("unexpected {}", other.name()))),
            }
        }
    }

    fn key() -> ShardKey {
        ShardKey::new("benchmark", 1)
    }

    #[tokio::test]
    async fn test_remote_store_round_trip() {
        let local = Arc::new(LocalShardStore::new(2, StoreConfig::default()));
        let server = PeerServer::bind("127.0.0.1:0".parse().unwrap(), 2)
            .await
            .unwrap();
        let addr = server.local_addr().to_string();
        let shutdown = CancellationToken::new();
        server.spawn(Arc::new(StoreHandler(local.clone())), shutdown.clone());

        let client = Arc::new(PeerClient::new(addr, TransportConfig::default()));
        let remote = RemoteShardStore::new(2, client);
        remote.create_replica(&key()).await.unwrap();
        for id in 0..10 {
            remote
                .write(&key(), Mutation::Upsert(Point::new(id, vec![1.0, 2.0])))
                .await
                .unwrap();
        }
        assert_eq!(remote.current_sequence(&key()).await.unwrap(), 10);
        assert_eq!(local.point_count(&key()), 10);

        let (blob, seq) = remote.snapshot(&key()).await.unwrap();
        assert_eq!(seq, 10);
        assert_eq!(blob.decode().unwrap().points.len(), 10);

        let records = remote.read_wal(&key(), 3, 6, 100).await.unwrap();
        assert_eq!(records.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![3, 4, 5, 6]);

        remote.set_state(&key(), ReplicaState::Sealed).await.unwrap();
        let err = remote.write(&key(), Mutation::Delete(1)).await.unwrap_err();
        assert!(matches!(err, Error::ShardSealed { peer_id: 2, .. }));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let remote = RemoteShardStore::new(
            9,
            Arc::new(PeerClient::new(
                "127.0.0.1:1",
                TransportConfig {
                    connect_timeout: Duration::from_millis(200),
                    ..Default::default()
                },
            )),
        );
        let err = remote.current_sequence(&key()).await.unwrap_err();
        assert!(matches!(err, Error::Unreachable { peer_id: 9, .. }));
    }

    #[test]
    fn test_provider_short_circuits_local_peer() {
        let local: Arc<dyn ShardStore> = Arc::new(LocalShardStore::new(1, StoreConfig::default()));
        let registry = Arc::new(PeerTable::new(PeerInfo::new(1, "127.0.0.1:6335"), 3));
        registry.join(2, "127.0.0.1:6336");
        let provider = RemoteStoreProvider::new(local, registry, TransportConfig::default());

        assert_eq!(provider.store(1).unwrap().peer_id(), 1);
        assert_eq!(provider.store(2).unwrap().peer_id(), 2);
        assert!(matches!(
            provider.store(5),
            Err(Error::Unreachable { peer_id: 5, .. })
        ));
    }
}
