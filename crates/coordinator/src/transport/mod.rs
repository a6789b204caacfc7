//! Moving single chunks to and from single peers.

mod duplex;
mod http;
mod memory;

pub use duplex::{Handler, PeerHub, PeerLink};
pub(crate) use duplex::registration;
pub use http::HttpTransport;
pub use memory::MemoryTransport;

use async_trait::async_trait;
use meshvault_protocol::{
    ContentAddress, NodeHealth, StoreChunkResponse, StoreStatus, VerifyResponse,
};

use crate::directory::Peer;
use crate::error::TransportError;

/// One binding of the peer content-store protocol.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Must be idempotent on the peer side: a second store of the same
    /// bytes answers `exists`.
    async fn store(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
        data: &[u8],
    ) -> Result<StoreChunkResponse, TransportError>;

    /// `None` when the peer does not hold the chunk.
    async fn retrieve(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    async fn exists(&self, peer: &Peer, cid: &ContentAddress) -> Result<bool, TransportError>;

    async fn delete(&self, peer: &Peer, cid: &ContentAddress) -> Result<bool, TransportError>;

    async fn verify(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
    ) -> Result<VerifyResponse, TransportError>;

    async fn ping(&self, peer: &Peer) -> Result<NodeHealth, TransportError>;
}

/// A replica the coordinator is willing to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreAck {
    pub status: StoreStatus,
    /// Hex receipt signature, when the peer signs.
    pub signature: Option<String>,
}

/// `store`, then hold the peer to its answer: the address it computed
/// must be ours, the status must mean "held", and a receipt, if present,
/// must verify and be signed by the peer we addressed.
pub async fn store_checked(
    transport: &dyn ReplicaTransport,
    peer: &Peer,
    cid: &ContentAddress,
    data: &[u8],
) -> Result<StoreAck, TransportError> {
    let response = transport.store(peer, cid, data).await?;
    if response.chunk_hash != cid.as_str() {
        return Err(TransportError::HashMismatch {
            expected: cid.to_string(),
            actual: response.chunk_hash,
        });
    }
    if !response.status.is_held() {
        return Err(TransportError::Rejected(format!(
            "store answered {:?}",
            response.status
        )));
    }
    let signature = match response.receipt {
        Some(receipt) => {
            if !receipt.verify(cid, data.len()) || !receipt.issued_by(&peer.id) {
                return Err(TransportError::InvalidReceipt);
            }
            Some(receipt.signature)
        }
        None => None,
    };
    Ok(StoreAck {
        status: response.status,
        signature,
    })
}

/// `retrieve`, discarding anything that does not hash to `cid`.
pub async fn retrieve_checked(
    transport: &dyn ReplicaTransport,
    peer: &Peer,
    cid: &ContentAddress,
) -> Result<Option<Vec<u8>>, TransportError> {
    match transport.retrieve(peer, cid).await? {
        Some(data) if cid.matches(&data) => Ok(Some(data)),
        Some(data) => Err(TransportError::HashMismatch {
            expected: cid.to_string(),
            actual: ContentAddress::of(&data).to_string(),
        }),
        None => Ok(None),
    }
}
