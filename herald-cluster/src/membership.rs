//! The local view of cluster membership.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info};

/// Probe failures in a row after which a peer counts as failed.
const FAILURE_THRESHOLD: u32 = 3;

/// Liveness of a peer as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Responding to probes.
    Alive,
    /// Missed at least one probe.
    Suspect,
    /// Missed enough probes to be considered gone.
    Failed,
}

/// One remote node.
#[derive(Debug, Clone)]
pub struct Peer {
    /// The peer's node id.
    pub node_id: u8,
    /// Address of the peer's cluster listener.
    pub addr: SocketAddr,
    /// Current liveness.
    pub status: PeerStatus,
    consecutive_failures: u32,
}

/// Thread-safe membership table, keyed by node id.
///
/// The health score is the number of peers currently not alive; the cluster
/// reports unhealthy once it crosses the configured threshold.
#[derive(Debug)]
pub struct Membership {
    own_id: u8,
    peers: RwLock<HashMap<u8, Peer>>,
}

impl Membership {
    /// Create an empty table for the given local node id.
    pub fn new(own_id: u8) -> Self {
        Self { own_id, peers: RwLock::new(HashMap::new()) }
    }

    /// The local node id.
    pub fn own_id(&self) -> u8 {
        self.own_id
    }

    /// Insert or refresh a peer; returns `true` if it was previously unknown.
    pub fn upsert(&self, node_id: u8, addr: SocketAddr) -> bool {
        if node_id == self.own_id {
            return false;
        }
        let mut peers = self.peers.write();
        let new = !peers.contains_key(&node_id);
        peers.insert(
            node_id,
            Peer { node_id, addr, status: PeerStatus::Alive, consecutive_failures: 0 },
        );
        if new {
            info!(node_id, %addr, "peer joined");
        }
        new
    }

    /// Merge a membership snapshot received from a peer.
    pub fn merge(&self, snapshot: &[(u8, SocketAddr)]) {
        for &(node_id, addr) in snapshot {
            self.upsert(node_id, addr);
        }
    }

    /// Record a successful probe or message from the peer.
    pub fn mark_alive(&self, node_id: u8) {
        if let Some(peer) = self.peers.write().get_mut(&node_id) {
            if peer.status != PeerStatus::Alive {
                info!(node_id, "peer recovered");
            }
            peer.status = PeerStatus::Alive;
            peer.consecutive_failures = 0;
        }
    }

    /// Record a failed probe or send; escalates to failed after
    /// `FAILURE_THRESHOLD` strikes.
    pub fn mark_unreachable(&self, node_id: u8) {
        if let Some(peer) = self.peers.write().get_mut(&node_id) {
            peer.consecutive_failures += 1;
            peer.status = if peer.consecutive_failures >= FAILURE_THRESHOLD {
                PeerStatus::Failed
            } else {
                PeerStatus::Suspect
            };
            debug!(node_id, failures = peer.consecutive_failures, status = ?peer.status, "peer unreachable");
        }
    }

    /// Peers currently considered alive.
    pub fn alive_peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.status == PeerStatus::Alive)
            .cloned()
            .collect()
    }

    /// Every known peer, regardless of status.
    pub fn all_peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    /// `(id, addr)` pairs for a Members snapshot, excluding `except`.
    pub fn snapshot_excluding(&self, except: u8) -> Vec<(u8, SocketAddr)> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.node_id != except)
            .map(|peer| (peer.node_id, peer.addr))
            .collect()
    }

    /// Number of peers currently degraded (suspect or failed).
    pub fn health_score(&self) -> u32 {
        self.peers.read().values().filter(|peer| peer.status != PeerStatus::Alive).count() as u32
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peer is known.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn upsert_ignores_self_and_detects_new_peers() {
        let membership = Membership::new(1);
        assert!(!membership.upsert(1, addr(9001)));
        assert!(membership.is_empty());

        assert!(membership.upsert(2, addr(9002)));
        assert!(!membership.upsert(2, addr(9002)));
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn merge_accumulates() {
        let membership = Membership::new(1);
        membership.merge(&[(2, addr(9002)), (3, addr(9003)), (1, addr(9001))]);
        assert_eq!(membership.len(), 2);
        assert_eq!(membership.alive_peers().len(), 2);
    }

    #[test]
    fn failures_escalate_and_recover() {
        let membership = Membership::new(1);
        membership.upsert(2, addr(9002));

        membership.mark_unreachable(2);
        assert_eq!(membership.all_peers()[0].status, PeerStatus::Suspect);
        assert_eq!(membership.health_score(), 1);
        assert!(membership.alive_peers().is_empty());

        membership.mark_unreachable(2);
        membership.mark_unreachable(2);
        assert_eq!(membership.all_peers()[0].status, PeerStatus::Failed);

        membership.mark_alive(2);
        assert_eq!(membership.all_peers()[0].status, PeerStatus::Alive);
        assert_eq!(membership.health_score(), 0);
    }

    #[test]
    fn snapshot_excludes_the_requester() {
        let membership = Membership::new(1);
        membership.upsert(2, addr(9002));
        membership.upsert(3, addr(9003));
        let snapshot = membership.snapshot_excluding(2);
        assert_eq!(snapshot, vec![(3, addr(9003))]);
    }
}
