//! # Peer Table
//!
//! Who we're connected to, how to reach them again, and how high their
//! chain was last time they told us.
//!
//! The table is owned by the mesh. Everybody else reads snapshots
//! ([`PeerInfo`] clones); nothing outside `network` mutates it.
//!
//! ## Duplicate connections
//!
//! Two nodes that discover each other at the same moment will dial each
//! other at the same moment. Both sides then hold two connections to the
//! same peer and must agree on which one survives. The rule is symmetric:
//! keep the connection initiated by the node with the lower id. The loser
//! is refused as a duplicate, or replaced if it was registered first.
//! A replacement hands back the superseded entry so the mesh can report
//! its disconnect before the new connect.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use super::message::{Envelope, PeerAddress};
use crate::consensus::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub public_key: String,
    pub organization: String,
    /// The peer's advertised listen address.
    pub address: String,
    pub status: PeerStatus,
    /// Last chain height the peer reported.
    pub height: u64,
    /// Unix milliseconds.
    pub connected_at: u64,
}

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SelfConnection,
    Duplicate,
    TooManyPeers,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfConnection => write!(f, "self-connection"),
            Self::Duplicate => write!(f, "duplicate connection"),
            Self::TooManyPeers => write!(f, "too many peers"),
        }
    }
}

struct PeerEntry {
    info: PeerInfo,
    conn_id: u64,
    initiator: NodeId,
    sender: mpsc::Sender<Envelope>,
}

pub struct PeerManager {
    local_id: NodeId,
    max_peers: usize,
    peers: DashMap<NodeId, PeerEntry>,
    /// Every address ever learned, for redialing after disconnects.
    known: DashMap<NodeId, String>,
    next_conn_id: AtomicU64,
}

impl PeerManager {
    pub fn new(local_id: NodeId, max_peers: usize) -> Self {
        Self {
            local_id,
            max_peers,
            peers: DashMap::new(),
            known: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Check a handshake against the table without changing it.
    pub fn admissible(&self, node_id: &str, initiator: &str) -> Result<(), RejectReason> {
        if node_id == self.local_id {
            return Err(RejectReason::SelfConnection);
        }
        if let Some(existing) = self.peers.get(node_id) {
            if initiator >= existing.initiator.as_str() {
                return Err(RejectReason::Duplicate);
            }
            return Ok(());
        }
        if self.peers.len() >= self.max_peers {
            return Err(RejectReason::TooManyPeers);
        }
        Ok(())
    }

    /// Record a completed handshake. Replaces an existing connection only
    /// if the duplicate rule prefers the new one, and returns what it
    /// replaced.
    pub fn register(
        &self,
        mut info: PeerInfo,
        conn_id: u64,
        initiator: NodeId,
        sender: mpsc::Sender<Envelope>,
    ) -> Result<Option<PeerInfo>, RejectReason> {
        if info.node_id == self.local_id {
            return Err(RejectReason::SelfConnection);
        }
        // Counted before taking the shard lock below.
        let at_capacity = self.peers.len() >= self.max_peers;
        info.status = PeerStatus::Connected;
        let node_id = info.node_id.clone();
        let address = info.address.clone();
        let entry = PeerEntry {
            info,
            conn_id,
            initiator,
            sender,
        };

        let replaced = match self.peers.entry(node_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if entry.initiator >= occupied.get().initiator {
                    return Err(RejectReason::Duplicate);
                }
                let old = occupied.insert(entry);
                debug!(peer = %node_id, old_conn = old.conn_id, conn_id, "replaced duplicate connection");
                let mut info = old.info;
                info.status = PeerStatus::Disconnected;
                Some(info)
            }
            Entry::Vacant(vacant) => {
                if at_capacity {
                    return Err(RejectReason::TooManyPeers);
                }
                vacant.insert(entry);
                None
            }
        };
        self.known.insert(node_id, address);
        Ok(replaced)
    }

    /// Drop the peer, but only if `conn_id` is still the live connection.
    pub fn remove(&self, node_id: &str, conn_id: u64) -> Option<PeerInfo> {
        self.peers
            .remove_if(node_id, |_, entry| entry.conn_id == conn_id)
            .map(|(_, entry)| {
                let mut info = entry.info;
                info.status = PeerStatus::Disconnected;
                info
            })
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.peers.contains_key(node_id)
    }

    pub fn is_live(&self, node_id: &str, conn_id: u64) -> bool {
        self.peers
            .get(node_id)
            .map(|e| e.conn_id == conn_id)
            .unwrap_or(false)
    }

    pub fn update_height(&self, node_id: &str, height: u64) {
        if let Some(mut entry) = self.peers.get_mut(node_id) {
            entry.info.height = height;
        }
    }

    pub fn get(&self, node_id: &str) -> Option<PeerInfo> {
        self.peers.get(node_id).map(|e| e.info.clone())
    }

    pub fn sender(&self, node_id: &str) -> Option<mpsc::Sender<Envelope>> {
        self.peers.get(node_id).map(|e| e.sender.clone())
    }

    /// Snapshot of connected peers, sorted by node id.
    pub fn connected(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.iter().map(|e| e.info.clone()).collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub fn connected_ids(&self) -> Vec<NodeId> {
        self.connected().into_iter().map(|p| p.node_id).collect()
    }

    pub fn senders(&self) -> Vec<(NodeId, mpsc::Sender<Envelope>)> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.sender.clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    /// Connected peers other than `except`, as advertised addresses.
    pub fn addresses_except(&self, except: &str) -> Vec<PeerAddress> {
        self.connected()
            .into_iter()
            .filter(|p| p.node_id != except)
            .map(|p| PeerAddress {
                node_id: p.node_id,
                address: p.address,
            })
            .collect()
    }

    pub fn remember(&self, node_id: &str, address: &str) {
        if node_id != self.local_id {
            self.known.insert(node_id.to_string(), address.to_string());
        }
    }

    pub fn is_known(&self, node_id: &str) -> bool {
        self.known.contains_key(node_id)
    }

    /// Known peers that aren't currently connected.
    pub fn disconnected_known(&self) -> Vec<PeerAddress> {
        self.known
            .iter()
            .filter(|e| !self.peers.contains_key(e.key()))
            .map(|e| PeerAddress {
                node_id: e.key().clone(),
                address: e.value().clone(),
            })
            .collect()
    }

    /// Drop every connection. Writers exit once their sender is gone.
    pub fn clear(&self) {
        self.peers.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
