use async_trait::async_trait;
use meshvault_protocol::{
    ContentAddress, NodeHealth, StoreChunkResponse, StoreStatus, VerifyResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use super::ReplicaTransport;
use crate::directory::Peer;
use crate::error::TransportError;

#[derive(Debug, Default)]
struct SimPeer {
    chunks: HashMap<ContentAddress, Vec<u8>>,
    latency: Duration,
    reachable: bool,
}

/// In-process peers for tests and local simulation. Each peer has a
/// configurable latency and can be made unreachable; stored bytes can be
/// tampered with to exercise the verification paths.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    peers: Mutex<HashMap<String, SimPeer>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, id: &str) -> Peer {
        self.peers.lock().insert(
            id.to_string(),
            SimPeer {
                reachable: true,
                ..Default::default()
            },
        );
        Peer::new(id, format!("mem://{id}"))
    }

    pub fn set_latency(&self, id: &str, latency: Duration) {
        if let Some(peer) = self.peers.lock().get_mut(id) {
            peer.latency = latency;
        }
    }

    pub fn set_reachable(&self, id: &str, reachable: bool) {
        if let Some(peer) = self.peers.lock().get_mut(id) {
            peer.reachable = reachable;
        }
    }

    /// Overwrite whatever the peer holds under `cid`, bypassing the hash check.
    pub fn put_raw(&self, id: &str, cid: &ContentAddress, data: Vec<u8>) {
        if let Some(peer) = self.peers.lock().get_mut(id) {
            peer.chunks.insert(cid.clone(), data);
        }
    }

    /// Flip one bit of a held chunk. False when the peer does not hold it.
    pub fn corrupt(&self, id: &str, cid: &ContentAddress) -> bool {
        let mut peers = self.peers.lock();
        match peers.get_mut(id).and_then(|p| p.chunks.get_mut(cid)) {
            Some(data) if !data.is_empty() => {
                data[0] ^= 0x01;
                true
            }
            _ => false,
        }
    }

    pub fn remove_chunk(&self, id: &str, cid: &ContentAddress) -> bool {
        self.peers
            .lock()
            .get_mut(id)
            .map(|p| p.chunks.remove(cid).is_some())
            .unwrap_or(false)
    }

    pub fn holds(&self, id: &str, cid: &ContentAddress) -> bool {
        self.peers
            .lock()
            .get(id)
            .map(|p| p.chunks.contains_key(cid))
            .unwrap_or(false)
    }

    pub fn chunk_count(&self, id: &str) -> usize {
        self.peers.lock().get(id).map(|p| p.chunks.len()).unwrap_or(0)
    }

    /// Simulated round trip: wait out the peer's latency, then fail if it
    /// is gone. The lock is not held while sleeping.
    async fn reach(&self, peer: &Peer) -> Result<(), TransportError> {
        let latency = match self.peers.lock().get(&peer.id) {
            Some(p) => p.latency,
            None => return Err(TransportError::NotConnected(peer.id.clone())),
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.peers.lock().get(&peer.id) {
            Some(p) if p.reachable => Ok(()),
            _ => Err(TransportError::Connection(format!(
                "peer {} unreachable",
                peer.id
            ))),
        }
    }
}

#[async_trait]
impl ReplicaTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn store(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
        data: &[u8],
    ) -> Result<StoreChunkResponse, TransportError> {
        self.reach(peer).await?;
        let actual = ContentAddress::of(data);
        let size = data.len() as u64;
        if &actual != cid {
            return Ok(StoreChunkResponse {
                status: StoreStatus::HashMismatch,
                chunk_hash: actual.to_string(),
                size,
                receipt: None,
            });
        }
        let mut peers = self.peers.lock();
        let sim = peers
            .get_mut(&peer.id)
            .ok_or_else(|| TransportError::NotConnected(peer.id.clone()))?;
        let status = if sim.chunks.contains_key(cid) {
            StoreStatus::Exists
        } else {
            sim.chunks.insert(cid.clone(), data.to_vec());
            StoreStatus::Stored
        };
        Ok(StoreChunkResponse {
            status,
            chunk_hash: actual.to_string(),
            size,
            receipt: None,
        })
    }

    async fn retrieve(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.reach(peer).await?;
        Ok(self
            .peers
            .lock()
            .get(&peer.id)
            .and_then(|p| p.chunks.get(cid).cloned()))
    }

    async fn exists(&self, peer: &Peer, cid: &ContentAddress) -> Result<bool, TransportError> {
        self.reach(peer).await?;
        Ok(self.holds(&peer.id, cid))
    }

    async fn delete(&self, peer: &Peer, cid: &ContentAddress) -> Result<bool, TransportError> {
        self.reach(peer).await?;
        Ok(self.remove_chunk(&peer.id, cid))
    }

    async fn verify(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
    ) -> Result<VerifyResponse, TransportError> {
        self.reach(peer).await?;
        let held = self
            .peers
            .lock()
            .get(&peer.id)
            .and_then(|p| p.chunks.get(cid).cloned());
        Ok(match held {
            Some(data) => VerifyResponse {
                chunk_hash: cid.clone(),
                exists: true,
                valid: cid.matches(&data),
                size: data.len() as u64,
            },
            None => VerifyResponse {
                chunk_hash: cid.clone(),
                exists: false,
                valid: false,
                size: 0,
            },
        })
    }

    async fn ping(&self, peer: &Peer) -> Result<NodeHealth, TransportError> {
        self.reach(peer).await?;
        let peers = self.peers.lock();
        let sim = peers
            .get(&peer.id)
            .ok_or_else(|| TransportError::NotConnected(peer.id.clone()))?;
        Ok(NodeHealth {
            status: "ok".into(),
            node_id: peer.id.clone(),
            used_bytes: sim.chunks.values().map(|c| c.len() as u64).sum(),
            capacity_bytes: u64::MAX,
            chunk_count: sim.chunks.len() as u64,
        })
    }
}
