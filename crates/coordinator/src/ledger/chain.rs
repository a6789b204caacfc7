use chrono::Utc;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::block::{Block, BlockPayload, BlockStatus, Confirmation, FileMetadata, GENESIS_PREV_HASH};
use super::{LedgerError, QuorumPolicy};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A file as listed for a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub block_index: u64,
    pub block_hash: String,
    pub timestamp: i64,
    pub status: BlockStatus,
    pub confirmations: usize,
    pub metadata: FileMetadata,
}

impl FileEntry {
    fn from_block(block: &Block, metadata: &FileMetadata) -> Self {
        Self {
            block_index: block.index,
            block_hash: block.hash.clone(),
            timestamp: block.timestamp,
            status: block.status,
            confirmations: block.confirmation_count(),
            metadata: metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub block_count: usize,
    pub file_count: usize,
    pub pending_files: usize,
    pub confirmed_files: usize,
    pub rejected_files: usize,
    pub deleted_files: usize,
    pub total_size_bytes: u64,
    pub unique_owners: usize,
    pub total_confirmations: usize,
    pub last_block_time: Option<i64>,
}

/// The chain plus its on-disk mirror.
///
/// Every mutation runs under one writer lock: copy the current chain,
/// change the copy, write it to disk, then publish it. Readers take the
/// published snapshot and never see a half-applied change.
pub struct Ledger {
    path: Option<PathBuf>,
    policy: QuorumPolicy,
    chain: RwLock<Arc<Vec<Block>>>,
    writer: Mutex<()>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .field("blocks", &self.len())
            .finish()
    }
}

impl Ledger {
    /// Load the chain at `path`, or start empty when the file does not
    /// exist. A chain that fails validation is refused.
    pub fn open(path: impl AsRef<Path>, policy: QuorumPolicy) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let blocks = read_chain(&path)?;
        info!(path = %path.display(), blocks = blocks.len(), "ledger loaded");
        Ok(Self {
            path: Some(path),
            policy,
            chain: RwLock::new(Arc::new(blocks)),
            writer: Mutex::new(()),
        })
    }

    /// A ledger that never touches disk.
    pub fn in_memory(policy: QuorumPolicy) -> Self {
        Self {
            path: None,
            policy,
            chain: RwLock::new(Arc::new(Vec::new())),
            writer: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a block. File blocks are confirmed when `confirmations`
    /// already meet quorum for `live_peers`, pending otherwise (or
    /// refused when pending blocks are disabled). Empty files and
    /// lifecycle markers carry no chunks and are confirmed on arrival.
    pub fn add_block(
        &self,
        data: BlockPayload,
        confirmations: Vec<Confirmation>,
        live_peers: usize,
    ) -> Result<Block, LedgerError> {
        let policy = self.policy;
        self.commit(|chain| {
            let mut distinct: Vec<Confirmation> = Vec::with_capacity(confirmations.len());
            for c in confirmations {
                if !distinct.iter().any(|d| d.peer_id == c.peer_id) {
                    distinct.push(c);
                }
            }

            // A file with no chunks has nothing for peers to vouch for.
            let required = match &data {
                BlockPayload::FileMetadata(meta) if !meta.placements.is_empty() => {
                    policy.required(live_peers)
                }
                _ => 0,
            };
            let have = distinct.len();
            let status = if have >= required {
                BlockStatus::Confirmed
            } else if policy.allow_pending {
                BlockStatus::Pending
            } else {
                return Err(LedgerError::ConsensusNotReached {
                    have,
                    need: required,
                });
            };

            let index = chain.len() as u64;
            let prev_hash = chain
                .last()
                .map(|b| b.hash.clone())
                .unwrap_or_else(|| GENESIS_PREV_HASH.to_string());
            let timestamp = now_ms();
            let mut block = Block::seal(index, prev_hash, data, timestamp)?;
            block.status = status;
            block.confirmations = distinct;
            if status == BlockStatus::Confirmed {
                block.confirmed_at = Some(timestamp);
            }
            info!(
                index,
                hash = %block.hash,
                %status,
                confirmations = have,
                required,
                "block appended"
            );
            chain.push(block.clone());
            Ok((block, true))
        })
    }

    /// Record one peer's confirmation. A repeat from the same peer is a
    /// no-op. The quorum is recomputed against `live_peers` as it stands
    /// now, not as it stood when the block was created. Only a pending
    /// block changes status.
    pub fn add_confirmation(
        &self,
        block_hash: &str,
        confirmation: Confirmation,
        live_peers: usize,
    ) -> Result<Block, LedgerError> {
        let policy = self.policy;
        self.commit(|chain| {
            let block = chain
                .iter_mut()
                .find(|b| b.hash == block_hash)
                .ok_or_else(|| LedgerError::BlockNotFound(block_hash.to_string()))?;

            if block.has_confirmation_from(&confirmation.peer_id) {
                debug!(block = %block_hash, peer = %confirmation.peer_id, "duplicate confirmation");
                return Ok((block.clone(), false));
            }
            let peer_id = confirmation.peer_id.clone();
            block.confirmations.push(confirmation);

            let required = policy.required(live_peers);
            let have = block.confirmation_count();
            if block.status == BlockStatus::Pending && have >= required {
                block.status = BlockStatus::Confirmed;
                block.confirmed_at = Some(now_ms());
                info!(index = block.index, hash = %block.hash, have, required, "block confirmed");
            } else {
                debug!(index = block.index, peer = %peer_id, have, required, status = %block.status, "confirmation recorded");
            }
            Ok((block.clone(), true))
        })
    }

    /// Move a pending block to rejected. Terminal blocks are left as
    /// they are.
    pub fn reject_block(&self, block_hash: &str, reason: &str) -> Result<Block, LedgerError> {
        self.commit(|chain| {
            let block = chain
                .iter_mut()
                .find(|b| b.hash == block_hash)
                .ok_or_else(|| LedgerError::BlockNotFound(block_hash.to_string()))?;
            if block.status.is_terminal() {
                return Err(LedgerError::InvalidTransition {
                    hash: block_hash.to_string(),
                    status: block.status,
                });
            }
            block.status = BlockStatus::Rejected;
            block.rejected_at = Some(now_ms());
            block.rejection_reason = Some(reason.to_string());
            warn!(index = block.index, hash = %block.hash, reason, "block rejected");
            Ok((block.clone(), true))
        })
    }

    /// Published snapshot of the whole chain.
    pub fn chain(&self) -> Arc<Vec<Block>> {
        self.chain.read().clone()
    }

    pub fn len(&self) -> usize {
        self.chain.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_block(&self) -> Option<Block> {
        self.chain.read().last().cloned()
    }

    pub fn block(&self, index: u64) -> Option<Block> {
        self.chain.read().get(index as usize).cloned()
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<Block> {
        self.chain().iter().find(|b| b.hash == hash).cloned()
    }

    pub fn block_status(&self, hash: &str) -> Option<BlockStatus> {
        self.chain().iter().find(|b| b.hash == hash).map(|b| b.status)
    }

    pub fn pending_blocks(&self) -> Vec<Block> {
        self.with_status(BlockStatus::Pending)
    }

    pub fn confirmed_blocks(&self) -> Vec<Block> {
        self.with_status(BlockStatus::Confirmed)
    }

    fn with_status(&self, status: BlockStatus) -> Vec<Block> {
        self.chain()
            .iter()
            .filter(|b| b.status == status)
            .cloned()
            .collect()
    }

    /// The block recording `file_id`, skipping rejected ones.
    pub fn file_block(&self, file_id: &str) -> Option<Block> {
        self.chain()
            .iter()
            .rev()
            .find(|b| {
                b.status != BlockStatus::Rejected
                    && b.data.as_file().is_some_and(|m| m.file_id == file_id)
            })
            .cloned()
    }

    pub fn file_metadata(&self, file_id: &str) -> Option<FileMetadata> {
        self.file_block(file_id)
            .and_then(|b| b.data.as_file().cloned())
    }

    pub fn is_deleted(&self, file_id: &str) -> bool {
        self.chain().iter().any(|b| {
            b.status != BlockStatus::Rejected
                && matches!(&b.data, BlockPayload::Deletion(d) if d.file_id == file_id)
        })
    }

    pub fn verify_ownership(&self, file_id: &str, owner: &str) -> bool {
        self.file_metadata(file_id)
            .is_some_and(|m| m.owner == owner)
    }

    /// Live files of `owner`, oldest first. Rejected and deleted files
    /// are skipped, pending ones unless asked for.
    pub fn user_files(&self, owner: &str, include_pending: bool) -> Vec<FileEntry> {
        let chain = self.chain();
        let deleted = deleted_ids(&chain);
        chain
            .iter()
            .filter(|b| match b.status {
                BlockStatus::Rejected => false,
                BlockStatus::Pending => include_pending,
                BlockStatus::Confirmed => true,
            })
            .filter_map(|b| b.data.as_file().map(|m| (b, m)))
            .filter(|(_, m)| m.owner == owner && !deleted.contains(m.file_id.as_str()))
            .map(|(b, m)| FileEntry::from_block(b, m))
            .collect()
    }

    /// Files currently shared with `user`: the latest share/unshare
    /// marker for the pair decides.
    pub fn shared_with(&self, user: &str) -> Vec<FileEntry> {
        let chain = self.chain();
        let deleted = deleted_ids(&chain);
        let mut grants: HashMap<&str, bool> = HashMap::new();
        for block in chain.iter().filter(|b| b.status != BlockStatus::Rejected) {
            match &block.data {
                BlockPayload::Share(s) if s.grantee == user => {
                    grants.insert(&s.file_id, true);
                }
                BlockPayload::Unshare(s) if s.grantee == user => {
                    grants.insert(&s.file_id, false);
                }
                _ => {}
            }
        }

        chain
            .iter()
            .filter(|b| b.status != BlockStatus::Rejected)
            .filter_map(|b| b.data.as_file().map(|m| (b, m)))
            .filter(|(_, m)| {
                grants.get(m.file_id.as_str()).copied().unwrap_or(false)
                    && !deleted.contains(m.file_id.as_str())
            })
            .map(|(b, m)| FileEntry::from_block(b, m))
            .collect()
    }

    pub fn stats(&self) -> LedgerStats {
        let chain = self.chain();
        let mut stats = LedgerStats {
            block_count: chain.len(),
            last_block_time: chain.last().map(|b| b.timestamp),
            ..Default::default()
        };
        let mut owners = HashSet::new();
        for block in chain.iter() {
            stats.total_confirmations += block.confirmation_count();
            owners.insert(block.data.owner());
            match &block.data {
                BlockPayload::FileMetadata(meta) => {
                    stats.file_count += 1;
                    match block.status {
                        BlockStatus::Pending => stats.pending_files += 1,
                        BlockStatus::Confirmed => stats.confirmed_files += 1,
                        BlockStatus::Rejected => stats.rejected_files += 1,
                    }
                    if block.status != BlockStatus::Rejected {
                        stats.total_size_bytes += meta.size;
                    }
                }
                BlockPayload::Deletion(_) if block.status != BlockStatus::Rejected => {
                    stats.deleted_files += 1;
                }
                _ => {}
            }
        }
        stats.unique_owners = owners.len();
        stats
    }

    /// Re-run the load-time checks against the in-memory chain.
    pub fn verify_chain(&self) -> Result<(), LedgerError> {
        validate(&self.chain())
    }

    /// Pick up blocks other processes appended to the file since this
    /// ledger last read it. Returns whether the published chain changed.
    pub fn refresh(&self) -> Result<bool, LedgerError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let _writer = self.writer.lock();
        let _file = self.lock_file()?;
        let current = read_chain(path)?;
        let changed = **self.chain.read() != current;
        if changed {
            debug!(blocks = current.len(), "ledger reloaded from disk");
            *self.chain.write() = Arc::new(current);
        }
        Ok(changed)
    }

    /// Run `change` on a private copy of the chain; when it reports a
    /// change, persist the copy and publish it.
    ///
    /// A file-backed ledger holds an exclusive lock on `<path>.lock` for
    /// the whole read-change-write, and starts from the chain on disk,
    /// so several processes sharing one file never drop each other's
    /// blocks.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut Vec<Block>) -> Result<(T, bool), LedgerError>,
    ) -> Result<T, LedgerError> {
        let _writer = self.writer.lock();
        let _file = self.lock_file()?;
        let mut next = match &self.path {
            Some(path) => {
                let current = read_chain(path)?;
                *self.chain.write() = Arc::new(current.clone());
                current
            }
            None => Vec::clone(&self.chain.read()),
        };
        let (out, changed) = change(&mut next)?;
        if changed {
            self.persist(&next)?;
            *self.chain.write() = Arc::new(next);
        }
        Ok(out)
    }

    /// Exclusive advisory lock shared with every process using this
    /// ledger file. Released when the handle drops.
    fn lock_file(&self) -> Result<Option<std::fs::File>, LedgerError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        if let Some(dir) = lock_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(Some(file))
    }

    /// Write-to-temp then rename, so a crash leaves the old file intact.
    fn persist(&self, blocks: &[Block]) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, blocks)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| LedgerError::Io(e.error))?;
        Ok(())
    }
}

/// Read and validate the chain stored at `path`. A missing or blank file
/// is an empty chain.
fn read_chain(path: &Path) -> Result<Vec<Block>, LedgerError> {
    let blocks: Vec<Block> = match std::fs::read(path) {
        Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Vec::new(),
        Ok(raw) => serde_json::from_slice(&raw)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    validate(&blocks)?;
    Ok(blocks)
}

fn deleted_ids(chain: &[Block]) -> HashSet<&str> {
    chain
        .iter()
        .filter(|b| b.status != BlockStatus::Rejected)
        .filter_map(|b| match &b.data {
            BlockPayload::Deletion(d) => Some(d.file_id.as_str()),
            _ => None,
        })
        .collect()
}

/// Index, link and self-hash checks from genesis forward.
fn validate(blocks: &[Block]) -> Result<(), LedgerError> {
    for (position, block) in blocks.iter().enumerate() {
        let tampered = |reason: String| LedgerError::ChainTampered {
            index: position as u64,
            reason,
        };
        if block.index != position as u64 {
            return Err(tampered(format!("index field reads {}", block.index)));
        }
        let expected_prev = match position {
            0 => GENESIS_PREV_HASH,
            _ => blocks[position - 1].hash.as_str(),
        };
        if block.prev_hash != expected_prev {
            return Err(tampered("previous-hash link broken".into()));
        }
        let computed = block.compute_hash()?;
        if computed != block.hash {
            return Err(tampered(format!(
                "stored hash {} but contents hash to {computed}",
                block.hash
            )));
        }
    }
    Ok(())
}
