//! Peer registry: peer id to address and liveness.

use crate::error::{Error, Result};
use crate::types::{PeerId, PeerInfo, PeerStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

/// Read side of the registry used by the coordinator.
pub trait PeerRegistry: Send + Sync {
    /// Look up a peer.
    fn resolve(&self, peer_id: PeerId) -> Result<PeerInfo>;

    /// This node's peer id.
    fn local_peer_id(&self) -> PeerId;

    /// Whether the peer is known and live.
    fn is_live(&self, peer_id: PeerId) -> bool {
        self.resolve(peer_id).map(|p| p.is_live()).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct PeerState {
    info: PeerInfo,
    last_seen: Instant,
    failed_checks: u32,
}

impl PeerState {
    fn new(info: PeerInfo) -> Self {
        Self {
            info,
            last_seen: Instant::now(),
            failed_checks: 0,
        }
    }

    fn mark_seen(&mut self) {
        self.last_seen = Instant::now();
        self.failed_checks = 0;
        self.info.status = PeerStatus::Live;
    }

    fn mark_failed(&mut self, threshold: u32) {
        self.failed_checks += 1;
        self.info.status = if self.failed_checks >= threshold {
            PeerStatus::Dead
        } else {
            PeerStatus::Suspect
        };
    }
}

/// In-memory peer table.
///
/// The local peer is always present and always live.
pub struct PeerTable {
    local_peer_id: PeerId,
    peers: RwLock<HashMap<PeerId, PeerState>>,
    failure_threshold: u32,
}

impl PeerTable {
    /// Create a table containing only the local peer.
    pub fn new(local: PeerInfo, failure_threshold: u32) -> Self {
        let local_peer_id = local.id;
        let mut peers = HashMap::new();
        peers.insert(local.id, PeerState::new(local));
        Self {
            local_peer_id,
            peers: RwLock::new(peers),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Add or refresh a peer. Returns `true` if it was not known before.
    pub fn join(&self, peer_id: PeerId, addr: impl Into<String>) -> bool {
        let addr = addr.into();
        let mut peers = self.peers.write();
        match peers.get_mut(&peer_id) {
            Some(state) => {
                state.info.addr = addr;
                state.mark_seen();
                false
            }
            None => {
                info!(peer_id, %addr, "Peer joined");
                peers.insert(peer_id, PeerState::new(PeerInfo::new(peer_id, addr)));
                true
            }
        }
    }

    /// Remove a peer. The local peer cannot be removed.
    pub fn remove(&self, peer_id: PeerId) -> Option<PeerInfo> {
        if peer_id == self.local_peer_id {
            return None;
        }
        let removed = self.peers.write().remove(&peer_id).map(|s| s.info);
        if removed.is_some() {
            info!(peer_id, "Peer removed");
        }
        removed
    }

    /// Record a successful health check.
    pub fn mark_seen(&self, peer_id: PeerId) {
        let mut peers = self.peers.write();
        if let Some(state) = peers.get_mut(&peer_id) {
            let recovered = state.info.status != PeerStatus::Live;
            state.mark_seen();
            if recovered {
                info!(peer_id, "Peer recovered");
            }
        }
    }

    /// Record a failed health check. Returns the resulting status.
    pub fn mark_failed(&self, peer_id: PeerId) -> Option<PeerStatus> {
        if peer_id == self.local_peer_id {
            return Some(PeerStatus::Live);
        }
        let mut peers = self.peers.write();
        let state = peers.get_mut(&peer_id)?;
        let before = state.info.status;
        state.mark_failed(self.failure_threshold);
        let after = state.info.status;
        if before != after {
            warn!(
                peer_id,
                failed_checks = state.failed_checks,
                status = %after,
                "Peer health degraded"
            );
        }
        Some(after)
    }

    /// All known peers, ordered by id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.peers.read().values().map(|s| s.info.clone()).collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Time elapsed since the last successful health check.
    pub fn since_seen(&self, peer_id: PeerId) -> Option<std::time::Duration> {
        self.peers.read().get(&peer_id).map(|s| s.last_seen.elapsed())
    }

    /// Peers other than the local one.
    pub fn remote_peers(&self) -> Vec<PeerInfo> {
        self.peers()
            .into_iter()
            .filter(|p| p.id != self.local_peer_id)
            .collect()
    }
}

impl PeerRegistry for PeerTable {
    fn resolve(&self, peer_id: PeerId) -> Result<PeerInfo> {
        self.peers
            .read()
            .get(&peer_id)
            .map(|s| s.info.clone())
            .ok_or_else(|| Error::NotFound(format!("peer {}", peer_id)))
    }

    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}
