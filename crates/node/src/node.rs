use libp2p_identity::Keypair;
use meshvault_protocol::{
    decode_b64, encode_b64, ContentAddress, DeleteResponse, ExistsResponse, NodeHealth, Operation,
    OperationResult, ProtocolError, ReplyEnvelope, RequestEnvelope, RetrieveChunkResponse,
    StoreChunkRequest, StoreChunkResponse, StoreReceipt, VerifyResponse,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::store::{SecureBlockStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("chunk {0} not found")]
    NotFound(String),
    #[error("request is missing {0}")]
    MissingField(&'static str),
    #[error("delete is not permitted")]
    Forbidden,
}

/// One storage peer: the block store plus the identity that signs its
/// store receipts. Both bindings call into this, so a chunk stored over
/// HTTP is visible over the duplex bridge and the other way round.
pub struct StorageNode {
    store: Arc<SecureBlockStore>,
    keypair: Keypair,
    node_id: String,
    admin_token: Option<String>,
}

impl StorageNode {
    pub fn new(store: Arc<SecureBlockStore>, keypair: Keypair, admin_token: Option<String>) -> Self {
        let node_id = keypair.public().to_peer_id().to_string();
        Self {
            store,
            keypair,
            node_id,
            admin_token: admin_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn block_store(&self) -> &Arc<SecureBlockStore> {
        &self.store
    }

    pub fn health(&self) -> NodeHealth {
        NodeHealth {
            status: "healthy".to_string(),
            node_id: self.node_id.clone(),
            used_bytes: self.store.used_bytes(),
            capacity_bytes: self.store.capacity_bytes(),
            chunk_count: self.store.chunk_count(),
        }
    }

    pub fn store_chunk(&self, request: &StoreChunkRequest) -> Result<StoreChunkResponse, NodeError> {
        let data = decode_b64(&request.data_b64)?;
        let outcome = self.store.store(request.chunk_hash.as_ref(), &data)?;

        let receipt = if outcome.status.is_held() {
            let timestamp_ms = chrono::Utc::now().timestamp_millis() as u64;
            match StoreReceipt::sign(&self.keypair, &outcome.address, data.len(), timestamp_ms) {
                Ok(receipt) => Some(receipt),
                Err(e) => {
                    warn!(cid = %outcome.address.short(), "receipt signing failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(StoreChunkResponse {
            status: outcome.status,
            chunk_hash: outcome.address.to_string(),
            size: outcome.size,
            receipt,
        })
    }

    pub fn retrieve_chunk(&self, cid: &ContentAddress) -> Result<Vec<u8>, NodeError> {
        match self.store.retrieve(cid) {
            Ok(Some(data)) => {
                debug!(cid = %cid.short(), "served chunk");
                Ok(data)
            }
            Ok(None) => Err(NodeError::NotFound(cid.to_string())),
            Err(e) => {
                error!(cid = %cid.short(), "refusing to serve chunk: {e}");
                Err(e.into())
            }
        }
    }

    pub fn exists(&self, cid: &ContentAddress) -> Result<ExistsResponse, NodeError> {
        let size = self.store.exists(cid)?;
        Ok(ExistsResponse {
            chunk_hash: cid.clone(),
            exists: size.is_some(),
            size: size.unwrap_or(0),
        })
    }

    pub fn verify(&self, cid: &ContentAddress) -> Result<VerifyResponse, NodeError> {
        let check = self.store.verify(cid)?;
        Ok(VerifyResponse {
            chunk_hash: cid.clone(),
            exists: check.exists,
            valid: check.valid,
            size: check.size,
        })
    }

    pub fn delete_chunk(&self, cid: &ContentAddress) -> Result<DeleteResponse, NodeError> {
        let deleted = self.store.delete(cid)?;
        Ok(DeleteResponse {
            chunk_hash: cid.clone(),
            deleted,
        })
    }

    /// HTTP deletes need the configured token; with none configured the
    /// route stays closed.
    pub fn authorize_admin(&self, presented: Option<&str>) -> Result<(), NodeError> {
        match (&self.admin_token, presented) {
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(NodeError::Forbidden),
        }
    }

    /// Answer one correlated request from the duplex channel. Always
    /// echoes the request id, success or not.
    pub fn handle(&self, request: RequestEnvelope) -> ReplyEnvelope {
        let RequestEnvelope {
            request_id,
            operation,
            payload,
        } = request;

        let result = match operation {
            Operation::Ping => Ok(OperationResult::Ping(self.health())),
            Operation::Store => match payload.data_b64 {
                Some(data_b64) => self
                    .store_chunk(&StoreChunkRequest {
                        chunk_hash: payload.chunk_hash,
                        data_b64,
                    })
                    .map(OperationResult::Store),
                None => Err(NodeError::MissingField("dataB64")),
            },
            Operation::Retrieve => required(payload.chunk_hash).and_then(|cid| {
                match self.retrieve_chunk(&cid) {
                    Ok(data) => Ok(OperationResult::Retrieve(RetrieveChunkResponse {
                        chunk_hash: cid,
                        found: true,
                        data_b64: Some(encode_b64(&data)),
                    })),
                    Err(NodeError::NotFound(_)) => {
                        Ok(OperationResult::Retrieve(RetrieveChunkResponse {
                            chunk_hash: cid,
                            found: false,
                            data_b64: None,
                        }))
                    }
                    Err(e) => Err(e),
                }
            }),
            Operation::Exists => {
                required(payload.chunk_hash).and_then(|cid| self.exists(&cid).map(OperationResult::Exists))
            }
            Operation::Verify => {
                required(payload.chunk_hash).and_then(|cid| self.verify(&cid).map(OperationResult::Verify))
            }
            Operation::Delete => required(payload.chunk_hash)
                .and_then(|cid| self.delete_chunk(&cid).map(OperationResult::Delete)),
        };

        match result {
            Ok(result) => ReplyEnvelope::ok(request_id, result),
            Err(e) => ReplyEnvelope::failed(request_id, e.to_string()),
        }
    }
}

fn required(cid: Option<ContentAddress>) -> Result<ContentAddress, NodeError> {
    cid.ok_or(NodeError::MissingField("chunkHash"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvault_protocol::{RequestPayload, StoreStatus};

    fn node(admin: Option<&str>) -> (tempfile::TempDir, StorageNode) {
        let dir = tempfile::tempdir().unwrap();
        let store = SecureBlockStore::with_capacity_bytes(dir.path().join("db"), 1 << 20).unwrap();
        let node = StorageNode::new(
            Arc::new(store),
            Keypair::generate_ed25519(),
            admin.map(str::to_string),
        );
        (dir, node)
    }

    #[test]
    fn store_reply_carries_a_verifiable_receipt() {
        let (_dir, node) = node(None);
        let data = b"sealed chunk";
        let resp = node
            .store_chunk(&StoreChunkRequest {
                chunk_hash: Some(ContentAddress::of(data)),
                data_b64: encode_b64(data),
            })
            .unwrap();
        assert_eq!(resp.status, StoreStatus::Stored);
        let receipt = resp.receipt.unwrap();
        assert!(receipt.verify(&ContentAddress::of(data), data.len()));
        assert_eq!(receipt.signer().as_deref(), Some(node.node_id()));
    }

    #[test]
    fn hash_mismatch_has_no_receipt() {
        let (_dir, node) = node(None);
        let resp = node
            .store_chunk(&StoreChunkRequest {
                chunk_hash: Some(ContentAddress::of(b"claimed")),
                data_b64: encode_b64(b"actual"),
            })
            .unwrap();
        assert_eq!(resp.status, StoreStatus::HashMismatch);
        assert!(resp.receipt.is_none());
    }

    #[test]
    fn envelope_dispatch_echoes_request_ids() {
        let (_dir, node) = node(None);
        let cid = ContentAddress::of(b"abc");

        let reply = node.handle(RequestEnvelope::new(
            "r-1",
            Operation::Store,
            RequestPayload {
                chunk_hash: Some(cid.clone()),
                data_b64: Some(encode_b64(b"abc")),
            },
        ));
        assert_eq!(reply.request_id, "r-1");
        assert!(reply.success);

        let reply = node.handle(RequestEnvelope::new(
            "r-2",
            Operation::Retrieve,
            RequestPayload {
                chunk_hash: Some(cid),
                data_b64: None,
            },
        ));
        assert_eq!(reply.request_id, "r-2");
        match reply.result {
            Some(OperationResult::Retrieve(r)) => {
                assert!(r.found);
                assert_eq!(decode_b64(&r.data_b64.unwrap()).unwrap(), b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }

        let reply = node.handle(RequestEnvelope::new("r-3", Operation::Verify, RequestPayload::default()));
        assert_eq!(reply.request_id, "r-3");
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("chunkHash"));
    }

    #[test]
    fn retrieve_of_missing_chunk_is_not_found_not_failure() {
        let (_dir, node) = node(None);
        let reply = node.handle(RequestEnvelope::new(
            "r-9",
            Operation::Retrieve,
            RequestPayload {
                chunk_hash: Some(ContentAddress::of(b"nobody has this")),
                data_b64: None,
            },
        ));
        assert!(reply.success);
        assert!(matches!(
            reply.result,
            Some(OperationResult::Retrieve(RetrieveChunkResponse { found: false, .. }))
        ));
    }

    #[test]
    fn admin_token_gates_http_delete() {
        let (_dir, closed) = node(None);
        assert!(matches!(closed.authorize_admin(Some("x")), Err(NodeError::Forbidden)));

        let (_dir2, open) = node(Some("s3cret"));
        assert!(open.authorize_admin(Some("s3cret")).is_ok());
        assert!(open.authorize_admin(Some("guess")).is_err());
        assert!(open.authorize_admin(None).is_err());
    }
}
