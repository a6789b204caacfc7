//! Upload path and file lifecycle: encrypt, place, record, and later
//! collect the peers' confirmations.

use chrono::Utc;
use futures::future::join_all;
use futures::{stream, StreamExt};
use meshvault_codec::{
    derive_user_key, encrypt_chunk, generate_file_key, generate_salt, merkle_root, split,
    wrap_file_key, FileKey,
};
use meshvault_protocol::ContentAddress;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::directory::{Peer, PeerDirectory};
use crate::error::CoreError;
use crate::ledger::{
    Block, BlockPayload, BlockStatus, Confirmation, DeletionMarker, FileMetadata, Ledger,
    LedgerError, PlacementRecord, ShareMarker,
};
use crate::placement::PlacementPlanner;
use crate::transport::{store_checked, ReplicaTransport};

/// Outcome of one upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub file_id: String,
    pub block_index: u64,
    pub block_hash: String,
    pub status: BlockStatus,
    pub chunk_count: usize,
    /// Chunks that landed on fewer peers than the replication factor.
    pub under_replicated: Vec<usize>,
}

/// One encrypted chunk ready to place.
struct Sealed {
    index: usize,
    plaintext_hash: String,
    cid: ContentAddress,
    ciphertext: Vec<u8>,
}

/// A chunk as it ended up on the network.
struct Placed {
    record: PlacementRecord,
    signatures: Vec<(String, Option<String>)>,
}

pub struct Orchestrator {
    config: CoordinatorConfig,
    directory: Arc<dyn PeerDirectory>,
    transport: Arc<dyn ReplicaTransport>,
    planner: PlacementPlanner,
    ledger: Arc<Ledger>,
}

impl Orchestrator {
    pub fn new(
        config: CoordinatorConfig,
        directory: Arc<dyn PeerDirectory>,
        transport: Arc<dyn ReplicaTransport>,
        ledger: Arc<Ledger>,
    ) -> Self {
        let planner = PlacementPlanner::from_config(&config);
        Self {
            config,
            directory,
            transport,
            planner,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    /// Encrypt `data` under a fresh file key, spread every chunk over the
    /// best peers, and record the file in the ledger. Fails only when some
    /// chunk could not be placed anywhere.
    pub async fn upload(
        &self,
        owner: &str,
        name: &str,
        data: &[u8],
        secret: &[u8],
    ) -> Result<UploadReport, CoreError> {
        let live = self.directory.live_peers();
        if live.is_empty() {
            return Err(CoreError::NoPeers);
        }
        let file_id = Uuid::new_v4().to_string();
        let file_key = generate_file_key();

        let sealed = seal_chunks(data, self.config.chunk_size, &file_key)?;
        let hashes: Vec<&str> = sealed.iter().map(|c| c.plaintext_hash.as_str()).collect();
        let root = merkle_root(&hashes)?;
        let chunk_count = sealed.len();
        info!(file = %file_id, %owner, size = data.len(), chunks = chunk_count, peers = live.len(), "upload started");

        let mut placed: Vec<Placed> = stream::iter(sealed)
            .map(|chunk| self.place_chunk(chunk, live.clone()))
            .buffer_unordered(self.config.store_workers)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;
        placed.sort_by_key(|p| p.record.index);

        let replication = self.config.replication_factor;
        let under_replicated: Vec<usize> = placed
            .iter()
            .filter(|p| p.record.peers.len() < replication)
            .map(|p| p.record.index)
            .collect();
        if !under_replicated.is_empty() {
            warn!(file = %file_id, chunks = ?under_replicated, replication, "under-replicated upload");
        }

        let confirmations = confirmations_by_peer(&placed);
        let salt = generate_salt();
        let kdf = self.config.kdf_params();
        let user_key = derive_user_key(secret, &salt, &kdf)?;
        let wrapped = wrap_file_key(&file_key, &user_key)?;

        let metadata = FileMetadata {
            file_id: file_id.clone(),
            owner: owner.to_string(),
            name: name.to_string(),
            size: data.len() as u64,
            merkle_root: root,
            wrapped_key: hex::encode(wrapped),
            key_salt: hex::encode(salt),
            kdf,
            placements: placed.into_iter().map(|p| p.record).collect(),
            created_at: Utc::now().timestamp_millis(),
        };
        let block = self.ledger.add_block(
            BlockPayload::FileMetadata(metadata),
            confirmations,
            self.directory.live_count(),
        )?;
        info!(file = %file_id, block = block.index, status = %block.status, "upload recorded");

        Ok(UploadReport {
            file_id,
            block_index: block.index,
            block_hash: block.hash,
            status: block.status,
            chunk_count,
            under_replicated,
        })
    }

    async fn place_chunk(&self, chunk: Sealed, live: Vec<Peer>) -> Result<Placed, CoreError> {
        let targets = self
            .planner
            .select(self.transport.as_ref(), live, self.config.replication_factor)
            .await;

        let transport = self.transport.as_ref();
        let chunk_ref = &chunk;
        let outcomes = join_all(targets.iter().map(|peer| async move {
            let outcome = store_checked(transport, peer, &chunk_ref.cid, &chunk_ref.ciphertext).await;
            (peer, outcome)
        }))
        .await;

        let mut peers = Vec::new();
        let mut signatures = Vec::new();
        for (peer, outcome) in outcomes {
            match outcome {
                Ok(ack) => {
                    debug!(chunk = chunk.index, peer = %peer.id, status = ?ack.status, "replica stored");
                    peers.push(peer.id.clone());
                    signatures.push((peer.id.clone(), ack.signature));
                }
                Err(e) => {
                    warn!(chunk = chunk.index, peer = %peer.id, cid = %chunk.cid.short(), "replica failed: {e}");
                }
            }
        }
        if peers.is_empty() {
            return Err(CoreError::PlacementFailed { index: chunk.index });
        }

        Ok(Placed {
            record: PlacementRecord {
                index: chunk.index,
                plaintext_hash: chunk.plaintext_hash,
                ciphertext_hash: chunk.cid.to_string(),
                size: chunk.ciphertext.len() as u64,
                peers,
            },
            signatures,
        })
    }

    /// Append a deletion marker, then ask every replica to drop its
    /// chunks without waiting for the answers.
    pub async fn delete_file(&self, file_id: &str, requester: &str) -> Result<Block, CoreError> {
        let metadata = self.owned_file(file_id, requester)?;
        let block = self.ledger.add_block(
            BlockPayload::Deletion(DeletionMarker {
                file_id: file_id.to_string(),
                owner: requester.to_string(),
            }),
            Vec::new(),
            self.directory.live_count(),
        )?;
        info!(file = %file_id, block = block.index, "file deleted");

        let mut jobs = Vec::new();
        for record in &metadata.placements {
            let Ok(cid) = ContentAddress::parse(&record.ciphertext_hash) else {
                continue;
            };
            for peer_id in &record.peers {
                if let Some(peer) = self.directory.resolve(peer_id) {
                    jobs.push((peer, cid.clone()));
                }
            }
        }
        let transport = self.transport.clone();
        tokio::spawn(async move {
            for (peer, cid) in jobs {
                if let Err(e) = transport.delete(&peer, &cid).await {
                    debug!(peer = %peer.id, cid = %cid.short(), "replica delete failed: {e}");
                }
            }
        });
        Ok(block)
    }

    pub fn share_file(&self, file_id: &str, owner: &str, grantee: &str) -> Result<Block, CoreError> {
        self.owned_file(file_id, owner)?;
        let block = self.ledger.add_block(
            BlockPayload::Share(ShareMarker {
                file_id: file_id.to_string(),
                owner: owner.to_string(),
                grantee: grantee.to_string(),
            }),
            Vec::new(),
            self.directory.live_count(),
        )?;
        info!(file = %file_id, %grantee, "file shared");
        Ok(block)
    }

    pub fn unshare_file(&self, file_id: &str, owner: &str, grantee: &str) -> Result<Block, CoreError> {
        self.owned_file(file_id, owner)?;
        let block = self.ledger.add_block(
            BlockPayload::Unshare(ShareMarker {
                file_id: file_id.to_string(),
                owner: owner.to_string(),
                grantee: grantee.to_string(),
            }),
            Vec::new(),
            self.directory.live_count(),
        )?;
        info!(file = %file_id, %grantee, "file unshared");
        Ok(block)
    }

    fn owned_file(&self, file_id: &str, requester: &str) -> Result<FileMetadata, CoreError> {
        let metadata = self
            .ledger
            .file_metadata(file_id)
            .filter(|_| !self.ledger.is_deleted(file_id))
            .ok_or_else(|| CoreError::FileNotFound(file_id.to_string()))?;
        if metadata.owner != requester {
            return Err(CoreError::AccessDenied(file_id.to_string()));
        }
        Ok(metadata)
    }

    /// Ask every recorded replica of a pending file block to verify its
    /// chunks, and confirm on behalf of each peer whose chunks all check
    /// out. Peers that have not answered when `consensus_timeout` runs out
    /// are left for the next round.
    pub async fn gather_confirmations(&self, block_hash: &str) -> Result<BlockStatus, CoreError> {
        let block = self
            .ledger
            .block_by_hash(block_hash)
            .ok_or_else(|| LedgerError::BlockNotFound(block_hash.to_string()))?;
        let Some(metadata) = block.data.as_file() else {
            return Ok(block.status);
        };
        if block.status != BlockStatus::Pending {
            return Ok(block.status);
        }

        let mut held: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for record in &metadata.placements {
            for peer in &record.peers {
                held.entry(peer.as_str())
                    .or_default()
                    .push(record.ciphertext_hash.as_str());
            }
        }
        let candidates: Vec<(Peer, Vec<&str>)> = held
            .into_iter()
            .filter(|(peer_id, _)| !block.has_confirmation_from(peer_id))
            .filter_map(|(peer_id, cids)| self.directory.resolve(peer_id).map(|p| (p, cids)))
            .collect();

        let transport = self.transport.as_ref();
        let checks: Vec<_> = candidates
            .into_iter()
            .map(|(peer, cids)| async move {
                verify_peer(transport, &peer, &cids)
                    .await
                    .then(|| (peer.id.clone(), cids.iter().map(|c| c.to_string()).collect()))
            })
            .collect();
        let verified: Vec<Option<(String, Vec<String>)>> = stream::iter(checks)
            .buffer_unordered(self.config.store_workers)
            .take_until(tokio::time::sleep(self.config.consensus_timeout()))
            .collect()
            .await;

        let mut status = block.status;
        for (peer_id, cids) in verified.into_iter().flatten() {
            let confirmation = Confirmation::new(peer_id, cids, Utc::now().timestamp_millis());
            status = self
                .ledger
                .add_confirmation(block_hash, confirmation, self.directory.live_count())?
                .status;
        }
        Ok(status)
    }

    /// One consensus round over every pending file block. Returns how many
    /// became confirmed.
    pub async fn sweep_pending(&self) -> usize {
        if let Err(e) = self.ledger.refresh() {
            warn!("ledger reload failed: {e}");
        }
        let mut confirmed = 0;
        for block in self.ledger.pending_blocks() {
            if block.data.as_file().is_none() {
                continue;
            }
            match self.gather_confirmations(&block.hash).await {
                Ok(BlockStatus::Confirmed) => confirmed += 1,
                Ok(_) => {}
                Err(e) => warn!(block = block.index, "consensus round failed: {e}"),
            }
        }
        if confirmed > 0 {
            info!(confirmed, "consensus sweep confirmed blocks");
        }
        confirmed
    }

    /// Run [`Self::sweep_pending`] every `interval` until `shutdown` fires.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_pending().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("consensus sweeper stopped");
    }
}

fn seal_chunks(data: &[u8], chunk_size: usize, key: &FileKey) -> Result<Vec<Sealed>, CoreError> {
    split(data, chunk_size)?
        .map(|chunk| {
            let ciphertext = encrypt_chunk(chunk.data, key)?;
            Ok(Sealed {
                index: chunk.index,
                plaintext_hash: chunk.hash,
                cid: ContentAddress::of(&ciphertext),
                ciphertext,
            })
        })
        .collect()
}

/// One confirmation per peer, covering every chunk it accepted. The
/// receipt signature of the peer's first chunk rides along.
fn confirmations_by_peer(placed: &[Placed]) -> Vec<Confirmation> {
    let now = Utc::now().timestamp_millis();
    let mut by_peer: Vec<Confirmation> = Vec::new();
    for p in placed {
        for (peer_id, signature) in &p.signatures {
            match by_peer.iter_mut().find(|c| &c.peer_id == peer_id) {
                Some(c) => c.chunk_hashes.push(p.record.ciphertext_hash.clone()),
                None => by_peer.push(
                    Confirmation::new(peer_id.clone(), vec![p.record.ciphertext_hash.clone()], now)
                        .with_signature(signature.clone()),
                ),
            }
        }
    }
    by_peer
}

/// True when the peer holds every listed chunk and each re-hashes cleanly.
async fn verify_peer(transport: &dyn ReplicaTransport, peer: &Peer, cids: &[&str]) -> bool {
    for raw in cids {
        let Ok(cid) = ContentAddress::parse(raw) else {
            return false;
        };
        match transport.verify(peer, &cid).await {
            Ok(v) if v.exists && v.valid => {}
            Ok(_) => {
                debug!(peer = %peer.id, cid = %cid.short(), "replica missing or invalid");
                return false;
            }
            Err(e) => {
                debug!(peer = %peer.id, cid = %cid.short(), "verify failed: {e}");
                return false;
            }
        }
    }
    true
}
