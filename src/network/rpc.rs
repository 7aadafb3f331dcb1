//! Peer transport messages and framing.
//!
//! Every frame is a big-endian `u32` length followed by a bincode-encoded
//! [`Message`]. A connection carries one request/response exchange at a
//! time.

use crate::cluster::ownership::CatalogState;
use crate::error::{Error, NetworkError, Result, StorageError};
use crate::storage::{ReplicaInfo, ReplicaState, SnapshotBlob};
use crate::types::{
    Mutation, MutationRecord, PeerId, PeerInfo, Point, PointId, SeqNo, ShardId, ShardKey,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame. Snapshot blobs travel in a single frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Network message wrapper for all peer communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Health check.
    Ping(PingRequest),

    /// Response to ping.
    Pong(PongResponse),

    /// A peer announces itself to the metadata holder.
    Join(JoinRequest),

    /// Answer to a join: current peers and catalog.
    Joined(JoinResponse),

    /// Operation on the receiver's shard store.
    Store(StoreRequest),

    /// Result of a store operation.
    StoreReply(std::result::Result<StoreReply, RemoteError>),

    /// JSON-encoded control command.
    Control(String),

    /// JSON-encoded control response.
    ControlReply(String),

    /// Request failed before it could be handled.
    Error(RemoteError),
}

impl Message {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Join(_) => "join",
            Message::Joined(_) => "joined",
            Message::Store(_) => "store",
            Message::StoreReply(_) => "store_reply",
            Message::Control(_) => "control",
            Message::ControlReply(_) => "control_reply",
            Message::Error(_) => "error",
        }
    }
}

/// Ping request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    /// Sender's peer id.
    pub peer_id: PeerId,
    /// Sender's transport address.
    pub addr: String,
}

/// Response to ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongResponse {
    /// Responder's peer id.
    pub peer_id: PeerId,
    /// Responder's transport address.
    pub addr: String,
}

/// Join request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub peer_id: PeerId,
    pub addr: String,
}

/// Join response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Peer id of the metadata holder.
    pub peer_id: PeerId,
    pub peers: Vec<PeerInfo>,
    pub catalog: CatalogState,
}

/// A store operation addressed to one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRequest {
    pub key: ShardKey,
    pub op: StoreOp,
}

/// Operations of the shard store interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreOp {
    Snapshot,
    LoadSnapshot(SnapshotBlob),
    ReadWal { from: SeqNo, to: SeqNo, limit: usize },
    Apply(MutationRecord),
    ApplyBatch(Vec<MutationRecord>),
    CurrentSequence,
    ReplicaInfo,
    CreateReplica,
    Write(Mutation),
    SetState(ReplicaState),
    DropReplica,
    Scroll { offset: PointId, limit: usize },
    CompactWal { up_to: SeqNo },
}

/// Successful results of [`StoreOp`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreReply {
    Snapshot { blob: SnapshotBlob, seq: SeqNo },
    Seq(SeqNo),
    Records(Vec<MutationRecord>),
    Info(Option<ReplicaInfo>),
    Done,
    Dropped(bool),
    Points(Vec<Point>),
    Compacted(usize),
}

impl StoreReply {
    /// Short name for errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            StoreReply::Snapshot { .. } => "snapshot",
            StoreReply::Seq(_) => "seq",
            StoreReply::Records(_) => "records",
            StoreReply::Info(_) => "info",
            StoreReply::Done => "done",
            StoreReply::Dropped(_) => "dropped",
            StoreReply::Points(_) => "points",
            StoreReply::Compacted(_) => "compacted",
        }
    }
}

/// Error carried across the wire.
///
/// Variants the caller acts on (sealed replicas, truncated history, sequence
/// gaps) keep their structure; the rest travel as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    InvalidPeer { peer_id: PeerId, reason: String },
    InvalidShard { shard_id: ShardId, reason: String },
    Conflict(String),
    Unreachable { peer_id: PeerId, reason: String },
    Corrupt(String),
    NotFound(String),
    ShardSealed { peer_id: PeerId, shard_id: ShardId },
    ReplicaNotFound { peer_id: PeerId, shard_id: ShardId },
    Truncated { requested: SeqNo, first_retained: SeqNo },
    SequenceGap { expected: SeqNo, got: SeqNo },
    Timeout,
    Other(String),
}

impl From<&Error> for RemoteError {
    fn from(e: &Error) -> Self {
        match e {
            Error::InvalidPeer { peer_id, reason } => RemoteError::InvalidPeer {
                peer_id: *peer_id,
                reason: reason.clone(),
            },
            Error::InvalidShard { shard_id, reason } => RemoteError::InvalidShard {
                shard_id: *shard_id,
                reason: reason.clone(),
            },
            Error::Conflict(msg) => RemoteError::Conflict(msg.clone()),
            Error::Unreachable { peer_id, reason } => RemoteError::Unreachable {
                peer_id: *peer_id,
                reason: reason.clone(),
            },
            Error::Corrupt(msg) => RemoteError::Corrupt(msg.clone()),
            Error::NotFound(msg) => RemoteError::NotFound(msg.clone()),
            Error::ShardSealed { peer_id, shard_id } => RemoteError::ShardSealed {
                peer_id: *peer_id,
                shard_id: *shard_id,
            },
            Error::ReplicaNotFound { peer_id, shard_id } => RemoteError::ReplicaNotFound {
                peer_id: *peer_id,
                shard_id: *shard_id,
            },
            Error::Storage(StorageError::Truncated {
                requested,
                first_retained,
            }) => RemoteError::Truncated {
                requested: *requested,
                first_retained: *first_retained,
            },
            Error::Storage(StorageError::SequenceGap { expected, got }) => {
                RemoteError::SequenceGap {
                    expected: *expected,
                    got: *got,
                }
            }
            Error::Timeout => RemoteError::Timeout,
            other => RemoteError::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::InvalidPeer { peer_id, reason } => Error::InvalidPeer { peer_id, reason },
            RemoteError::InvalidShard { shard_id, reason } => {
                Error::InvalidShard { shard_id, reason }
            }
            RemoteError::Conflict(msg) => Error::Conflict(msg),
            RemoteError::Unreachable { peer_id, reason } => Error::Unreachable { peer_id, reason },
            RemoteError::Corrupt(msg) => Error::Corrupt(msg),
            RemoteError::NotFound(msg) => Error::NotFound(msg),
            RemoteError::ShardSealed { peer_id, shard_id } => {
                Error::ShardSealed { peer_id, shard_id }
            }
            RemoteError::ReplicaNotFound { peer_id, shard_id } => {
                Error::ReplicaNotFound { peer_id, shard_id }
            }
            RemoteError::Truncated {
                requested,
                first_retained,
            } => Error::Storage(StorageError::Truncated {
                requested,
                first_retained,
            }),
            RemoteError::SequenceGap { expected, got } => {
                Error::Storage(StorageError::SequenceGap { expected, got })
            }
            RemoteError::Timeout => Error::Timeout,
            RemoteError::Other(msg) => Error::Network(NetworkError::Remote(msg)),
        }
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize(data)?)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> Result<Vec<u8>> {
    let data = encode_message(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(data.len()).into());
    }
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Write one framed message.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg)?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

/// Read one framed message. Returns `None` if the peer closed the
/// connection before a new frame started.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(len).into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    decode_message(&data).map(Some)
}
