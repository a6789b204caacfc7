//! Download path: every byte is checked before it is released.

use futures::{stream, StreamExt, TryStreamExt};
use meshvault_codec::{
    decrypt_chunk, derive_user_key, merkle_root, reassemble, sha256_hex, unwrap_file_key,
    CodecError, FileKey,
};
use meshvault_protocol::ContentAddress;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::directory::PeerDirectory;
use crate::error::{CoreError, TransportError};
use crate::ledger::{FileMetadata, Ledger, PlacementRecord};
use crate::transport::{retrieve_checked, ReplicaTransport};

#[derive(Debug, Clone)]
pub struct RetrievedFile {
    pub metadata: FileMetadata,
    pub data: Vec<u8>,
}

pub struct RetrievalVerifier {
    directory: Arc<dyn PeerDirectory>,
    transport: Arc<dyn ReplicaTransport>,
    ledger: Arc<Ledger>,
    workers: usize,
}

impl RetrievalVerifier {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        transport: Arc<dyn ReplicaTransport>,
        ledger: Arc<Ledger>,
        workers: usize,
    ) -> Self {
        Self {
            directory,
            transport,
            ledger,
            workers: workers.max(1),
        }
    }

    /// Fetch, verify and decrypt a file for its owner.
    ///
    /// A replica whose bytes do not hash to the recorded address is
    /// skipped in favour of the next one. A chunk that decrypts to the
    /// wrong plaintext, a Merkle root that does not reproduce, or a size
    /// that does not match fails the whole retrieval.
    pub async fn retrieve(
        &self,
        file_id: &str,
        requester: &str,
        secret: &[u8],
    ) -> Result<RetrievedFile, CoreError> {
        let metadata = self
            .ledger
            .file_metadata(file_id)
            .filter(|_| !self.ledger.is_deleted(file_id))
            .ok_or_else(|| CoreError::FileNotFound(file_id.to_string()))?;
        if metadata.owner != requester {
            return Err(CoreError::AccessDenied(file_id.to_string()));
        }

        let file_key = unwrap_key(&metadata, secret)?;

        let mut chunks: Vec<(usize, Vec<u8>)> = stream::iter(&metadata.placements)
            .map(|record| self.fetch_chunk(record, &file_key))
            .buffer_unordered(self.workers)
            .try_collect()
            .await?;
        chunks.sort_by_key(|(index, _)| *index);

        let hashes: Vec<String> = chunks.iter().map(|(_, data)| sha256_hex(data)).collect();
        let root = merkle_root(&hashes)?;
        if !root.eq_ignore_ascii_case(&metadata.merkle_root) {
            warn!(file = %file_id, stored = %metadata.merkle_root, computed = %root, "merkle root mismatch");
            return Err(CoreError::IntegrityFailure(format!(
                "merkle root {root} does not match recorded {}",
                metadata.merkle_root
            )));
        }

        let data = reassemble(chunks).map_err(|e| match e {
            CodecError::MissingChunk(i) => {
                CoreError::IntegrityFailure(format!("placement for chunk {i} missing"))
            }
            other => other.into(),
        })?;
        if data.len() as u64 != metadata.size {
            return Err(CoreError::IntegrityFailure(format!(
                "reassembled {} bytes, recorded {}",
                data.len(),
                metadata.size
            )));
        }
        info!(file = %file_id, size = data.len(), chunks = metadata.placements.len(), "file retrieved");
        Ok(RetrievedFile { metadata, data })
    }

    /// Try the recorded peers in order until one returns bytes that hash
    /// to the recorded address.
    async fn fetch_chunk(
        &self,
        record: &PlacementRecord,
        key: &FileKey,
    ) -> Result<(usize, Vec<u8>), CoreError> {
        let cid = ContentAddress::parse(&record.ciphertext_hash)
            .map_err(|e| CoreError::IntegrityFailure(format!("chunk {}: {e}", record.index)))?;

        for peer_id in &record.peers {
            let Some(peer) = self.directory.resolve(peer_id) else {
                debug!(chunk = record.index, peer = %peer_id, "replica peer not live");
                continue;
            };
            let ciphertext = match retrieve_checked(self.transport.as_ref(), &peer, &cid).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!(chunk = record.index, peer = %peer.id, "replica not held");
                    continue;
                }
                Err(TransportError::HashMismatch { actual, .. }) => {
                    warn!(chunk = record.index, peer = %peer.id, %actual, "replica returned corrupted bytes");
                    continue;
                }
                Err(e) => {
                    debug!(chunk = record.index, peer = %peer.id, "replica fetch failed: {e}");
                    continue;
                }
            };

            let plaintext = decrypt_chunk(&ciphertext, key).map_err(|_| {
                CoreError::IntegrityFailure(format!(
                    "chunk {} matches its address but does not decrypt",
                    record.index
                ))
            })?;
            let actual = sha256_hex(&plaintext);
            if !actual.eq_ignore_ascii_case(&record.plaintext_hash) {
                return Err(CoreError::IntegrityFailure(format!(
                    "chunk {} plaintext hashes to {actual}, recorded {}",
                    record.index, record.plaintext_hash
                )));
            }
            return Ok((record.index, plaintext));
        }

        Err(CoreError::ChunkUnavailable {
            index: record.index,
        })
    }
}

fn unwrap_key(metadata: &FileMetadata, secret: &[u8]) -> Result<FileKey, CoreError> {
    let salt = hex::decode(&metadata.key_salt)
        .map_err(|_| CoreError::IntegrityFailure("key salt is not hex".into()))?;
    let wrapped = hex::decode(&metadata.wrapped_key)
        .map_err(|_| CoreError::IntegrityFailure("wrapped key is not hex".into()))?;
    let user_key = derive_user_key(secret, &salt, &metadata.kdf)?;
    Ok(unwrap_file_key(&wrapped, &user_key)?)
}
