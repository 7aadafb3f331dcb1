//! Error types for shard relocation.

use crate::types::{PeerId, SeqNo, ShardId};
use std::io;
use thiserror::Error;

/// Result type alias for ferry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Peer is unknown to the registry or not live.
    #[error("invalid peer {peer_id}: {reason}")]
    InvalidPeer { peer_id: PeerId, reason: String },

    /// Shard does not exist or is not owned by the expected peer.
    #[error("invalid shard {shard_id}: {reason}")]
    InvalidShard { shard_id: ShardId, reason: String },

    /// Concurrent transfer for the same shard, self-move, or a transfer that
    /// cannot be changed in its current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network or I/O fault while talking to a peer.
    #[error("peer {peer_id} unreachable: {reason}")]
    Unreachable { peer_id: PeerId, reason: String },

    /// Bad snapshot or WAL data.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Unknown transfer, collection or peer.
    #[error("not found: {0}")]
    NotFound(String),

    /// Admission refused because a concurrency limit is reached.
    #[error("transfer limit reached for peer {peer_id:?}: max {limit}")]
    TransferLimit { peer_id: Option<PeerId>, limit: usize },

    /// Replica is sealed for cutover and refuses client writes.
    #[error("shard {shard_id} on peer {peer_id} is sealed")]
    ShardSealed { peer_id: PeerId, shard_id: ShardId },

    /// Peer does not host an active replica of the shard.
    #[error("peer {peer_id} hosts no active replica of shard {shard_id}")]
    ReplicaNotFound { peer_id: PeerId, shard_id: ShardId },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error category reported by the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidPeer,
    InvalidShard,
    Conflict,
    Unreachable,
    Corrupt,
    NotFound,
    Unavailable,
    Internal,
}

impl Error {
    /// Map this error onto the public taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidPeer { .. } => ErrorKind::InvalidPeer,
            Error::InvalidShard { .. } => ErrorKind::InvalidShard,
            Error::Conflict(_) | Error::TransferLimit { .. } => ErrorKind::Conflict,
            Error::Unreachable { .. } | Error::Network(_) => ErrorKind::Unreachable,
            Error::Corrupt(_) | Error::Storage(StorageError::SequenceGap { .. }) => {
                ErrorKind::Corrupt
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ShardSealed { .. }
            | Error::ReplicaNotFound { .. }
            | Error::Cancelled
            | Error::Timeout => ErrorKind::Unavailable,
            Error::Storage(_) | Error::Config(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a client write hitting this error may be retried against a
    /// freshly resolved replica set.
    pub fn is_retryable_write(&self) -> bool {
        matches!(
            self,
            Error::ShardSealed { .. } | Error::ReplicaNotFound { .. } | Error::Unreachable { .. }
        )
    }

    /// Build a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested WAL range starts before the oldest retained record.
    #[error("wal truncated: requested from {requested}, first retained {first_retained}")]
    Truncated { requested: SeqNo, first_retained: SeqNo },

    /// A replicated record does not follow the applied sequence.
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: SeqNo, got: SeqNo },

    /// Filesystem failure.
    #[error("storage io error: {0}")]
    Io(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Frame exceeded the maximum size.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Peer answered with an unexpected message.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Remote side reported an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Storage(StorageError::Io(e.to_string()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_taxonomy() {
        assert_eq!(Error::conflict("self move").kind(), ErrorKind::Conflict);
        assert_eq!(
            Error::TransferLimit { peer_id: Some(1), limit: 2 }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            Error::Storage(StorageError::SequenceGap { expected: 2, got: 5 }).kind(),
            ErrorKind::Corrupt
        );
        assert_eq!(
            Error::Unreachable { peer_id: 3, reason: "refused".into() }.kind(),
            ErrorKind::Unreachable
        );
    }

    #[test]
    fn test_retryable_writes() {
        assert!(Error::ShardSealed { peer_id: 1, shard_id: 0 }.is_retryable_write());
        assert!(Error::ReplicaNotFound { peer_id: 1, shard_id: 0 }.is_retryable_write());
        assert!(!Error::Corrupt("bad".into()).is_retryable_write());
    }
}
