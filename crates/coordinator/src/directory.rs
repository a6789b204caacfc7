use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A storage peer as the coordinator addresses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    /// Request/reply base address; empty for duplex-only peers.
    pub address: String,
}

impl Peer {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Source of the current live-peer list. Liveness bookkeeping (TTL,
/// reaping) belongs to the implementor; callers only ask.
pub trait PeerDirectory: Send + Sync {
    fn live_peers(&self) -> Vec<Peer>;

    fn live_count(&self) -> usize {
        self.live_peers().len()
    }

    fn resolve(&self, id: &str) -> Option<Peer> {
        self.live_peers().into_iter().find(|p| p.id == id)
    }
}

impl<T: PeerDirectory + ?Sized> PeerDirectory for std::sync::Arc<T> {
    fn live_peers(&self) -> Vec<Peer> {
        (**self).live_peers()
    }

    fn live_count(&self) -> usize {
        (**self).live_count()
    }

    fn resolve(&self, id: &str) -> Option<Peer> {
        (**self).resolve(id)
    }
}

/// Fixed peer list, for deployments that know their peers up front.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    peers: RwLock<Vec<Peer>>,
}

impl StaticDirectory {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    pub fn insert(&self, peer: Peer) {
        let mut peers = self.peers.write();
        peers.retain(|p| p.id != peer.id);
        peers.push(peer);
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p.id != id);
        peers.len() != before
    }
}

impl PeerDirectory for StaticDirectory {
    fn live_peers(&self) -> Vec<Peer> {
        self.peers.read().clone()
    }
}

/// Only the peers of `D` that advertised a request/reply address.
#[derive(Debug)]
pub struct Addressed<D>(pub D);

impl<D: PeerDirectory> PeerDirectory for Addressed<D> {
    fn live_peers(&self) -> Vec<Peer> {
        self.0
            .live_peers()
            .into_iter()
            .filter(|p| !p.address.is_empty())
            .collect()
    }

    fn resolve(&self, id: &str) -> Option<Peer> {
        self.0.resolve(id).filter(|p| !p.address.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub node_id: String,
    pub address: Option<String>,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub platform: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Peers currently holding a duplex connection. Entries are added on
/// registration and removed when the socket goes away.
#[derive(Debug, Default)]
pub struct PeerRoster {
    entries: RwLock<HashMap<String, RosterEntry>>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: RosterEntry) {
        self.entries.write().insert(entry.node_id.clone(), entry);
    }

    /// False when the peer is not on the roster.
    pub fn heartbeat(&self, node_id: &str, used_bytes: u64) -> bool {
        match self.entries.write().get_mut(node_id) {
            Some(entry) => {
                entry.used_bytes = used_bytes;
                entry.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, node_id: &str) -> Option<RosterEntry> {
        self.entries.write().remove(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<RosterEntry> {
        self.entries.read().get(node_id).cloned()
    }

    pub fn entries(&self) -> Vec<RosterEntry> {
        let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerDirectory for PeerRoster {
    fn live_peers(&self) -> Vec<Peer> {
        self.entries()
            .into_iter()
            .map(|e| Peer::new(e.node_id, e.address.unwrap_or_default()))
            .collect()
    }

    fn live_count(&self) -> usize {
        self.len()
    }

    fn resolve(&self, id: &str) -> Option<Peer> {
        self.get(id)
            .map(|e| Peer::new(e.node_id, e.address.unwrap_or_default()))
    }
}
