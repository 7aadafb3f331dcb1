//! Shard transfer records and their state machine.

use crate::error::{Error, Result};
use crate::types::{PeerId, SeqNo, ShardKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique id of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How the shard's data is shipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    /// Full point-in-time copy followed by WAL replay.
    #[default]
    Snapshot,
    /// Only the WAL records the destination is missing.
    WalDelta,
}

impl fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMethod::Snapshot => write!(f, "snapshot"),
            TransferMethod::WalDelta => write!(f, "wal_delta"),
        }
    }
}

impl FromStr for TransferMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "snapshot" => Ok(TransferMethod::Snapshot),
            "wal_delta" => Ok(TransferMethod::WalDelta),
            other => Err(Error::Config(format!("unknown transfer method: {}", other))),
        }
    }
}

/// Lifecycle of a transfer.
///
/// `Requested -> Syncing -> Cutover -> Completed`, and any non-terminal
/// state may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Accepted, not started.
    Requested,
    /// Shipping data while the source keeps taking writes, ending with the
    /// source sealed and its tail replayed.
    Syncing,
    /// Destination verified identical to the sealed source; activating it
    /// and flipping ownership.
    Cutover,
    /// Destination owns the shard.
    Completed,
    /// Aborted; the source still owns the shard.
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Requested => write!(f, "requested"),
            TransferState::Syncing => write!(f, "syncing"),
            TransferState::Cutover => write!(f, "cutover"),
            TransferState::Completed => write!(f, "completed"),
            TransferState::Failed => write!(f, "failed"),
        }
    }
}

impl TransferState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }

    /// Whether `next` is a legal successor.
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Requested, Syncing)
                | (Syncing, Cutover)
                | (Cutover, Completed)
                | (Requested, Failed)
                | (Syncing, Failed)
                | (Cutover, Failed)
        )
    }
}

/// A request to move one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub key: ShardKey,
    pub from_peer: PeerId,
    pub to_peer: PeerId,
    pub method: TransferMethod,
}

impl TransferRequest {
    pub fn new(key: ShardKey, from_peer: PeerId, to_peer: PeerId) -> Self {
        Self {
            key,
            from_peer,
            to_peer,
            method: TransferMethod::default(),
        }
    }

    pub fn with_method(mut self, method: TransferMethod) -> Self {
        self.method = method;
        self
    }
}

/// Progress counters of a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Points shipped in the snapshot.
    pub points_transferred: u64,
    /// WAL records applied on the destination.
    pub records_replayed: u64,
    /// Bytes shipped.
    pub bytes_transferred: u64,
    /// Source sequence last observed.
    pub source_seq: SeqNo,
    /// Destination sequence last observed.
    pub dest_seq: SeqNo,
    /// Catch-up rounds run so far.
    pub catchup_rounds: u32,
}

impl TransferProgress {
    /// Records the destination is behind.
    pub fn lag(&self) -> u64 {
        self.source_seq.saturating_sub(self.dest_seq)
    }
}

/// One shard transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardTransfer {
    pub id: TransferId,
    pub key: ShardKey,
    pub from: PeerId,
    pub to: PeerId,
    /// Method requested by the caller.
    pub method: TransferMethod,
    /// Method actually used, set once syncing has decided.
    pub effective_method: Option<TransferMethod>,
    pub state: TransferState,
    pub progress: TransferProgress,
    pub error: Option<String>,
    /// Unix millis.
    pub started_at: u64,
    /// Unix millis.
    pub finished_at: Option<u64>,
}

impl ShardTransfer {
    /// New transfer in `Requested`.
    pub fn new(request: &TransferRequest) -> Self {
        Self {
            id: TransferId::new(),
            key: request.key.clone(),
            from: request.from_peer,
            to: request.to_peer,
            method: request.method,
            effective_method: None,
            state: TransferState::Requested,
            progress: TransferProgress::default(),
            error: None,
            started_at: now_millis(),
            finished_at: None,
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn set_state(&mut self, next: TransferState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "transfer {}: illegal transition {} -> {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(now_millis());
        }
        Ok(())
    }

    /// Mark failed with a reason. No-op on a finalized transfer.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TransferState::Failed;
        self.error = Some(reason.into());
        self.finished_at = Some(now_millis());
    }

    /// Whether the transfer has not finalized.
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Whether the transfer ended by cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.state == TransferState::Failed && self.error.as_deref() == Some(CANCELLED_REASON)
    }

    /// Elapsed wall time.
    pub fn duration(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(now_millis);
        Duration::from_millis(end.saturating_sub(self.started_at))
    }

    /// Human-readable status line.
    pub fn comment(&self) -> String {
        let method = self.effective_method.unwrap_or(self.method);
        let p = &self.progress;
        match self.state {
            TransferState::Requested => "waiting to start".to_string(),
            TransferState::Syncing => format!(
                "{}: {} points, {} records replayed, lag {}",
                method, p.points_transferred, p.records_replayed, p.lag()
            ),
            TransferState::Cutover => format!("cutover at sequence {}", p.source_seq),
            TransferState::Completed => format!(
                "completed via {} in {}ms",
                method,
                self.duration().as_millis()
            ),
            TransferState::Failed => format!(
                "failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Error text recorded for a cancelled transfer.
pub const CANCELLED_REASON: &str = "cancelled";

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> ShardTransfer {
        ShardTransfer::new(&TransferRequest::new(ShardKey::new("benchmark", 3), 1, 2))
    }

    #[test]
    fn test_state_machine() {
        use TransferState::*;
        assert!(Requested.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Cutover));
        assert!(Cutover.can_transition_to(Completed));
        assert!(Cutover.can_transition_to(Failed));

        assert!(!Requested.can_transition_to(Cutover));
        assert!(!Syncing.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Syncing));
    }

    #[test]
    fn test_set_state_rejects_skips() {
        let mut t = transfer();
        assert!(t.set_state(TransferState::Completed).is_err());
        t.set_state(TransferState::Syncing).unwrap();
        t.set_state(TransferState::Cutover).unwrap();
        t.set_state(TransferState::Completed).unwrap();
        assert!(!t.is_active());
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn test_fail_keeps_terminal() {
        let mut t = transfer();
        t.fail(CANCELLED_REASON);
        assert!(t.is_cancelled());
        t.fail("later");
        assert_eq!(t.error.as_deref(), Some(CANCELLED_REASON));
    }

    #[test]
    fn test_method_serde() {
        assert_eq!(
            serde_json::to_string(&TransferMethod::WalDelta).unwrap(),
            "\"wal_delta\""
        );
        assert_eq!("snapshot".parse::<TransferMethod>().unwrap(), TransferMethod::Snapshot);
        assert!("stream_records".parse::<TransferMethod>().is_err());
    }

    #[test]
    fn test_comment() {
        let mut t = transfer();
        t.set_state(TransferState::Syncing).unwrap();
        t.progress.source_seq = 10;
        t.progress.dest_seq = 7;
        assert!(t.comment().contains("lag 3"));
    }
}
