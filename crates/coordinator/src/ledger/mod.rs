//! Append-only, hash-linked record of files and the peers vouching for them.

mod block;
mod chain;

pub use block::{
    block_hash, Block, BlockPayload, BlockStatus, Confirmation, DeletionMarker, FileMetadata,
    PlacementRecord, ShareMarker, GENESIS_PREV_HASH,
};
pub use chain::{FileEntry, Ledger, LedgerStats};

use thiserror::Error;

use crate::config::CoordinatorConfig;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("chain tampered at block {index}: {reason}")]
    ChainTampered { index: u64, reason: String },
    #[error("consensus not reached: {have}/{need} confirmations")]
    ConsensusNotReached { have: usize, need: usize },
    #[error("block {0} not found")]
    BlockNotFound(String),
    #[error("block {hash} is already {status}")]
    InvalidTransition { hash: String, status: BlockStatus },
    #[error("ledger io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How many distinct confirmations make a block confirmed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuorumPolicy {
    pub min_confirmations: usize,
    /// Fraction of live peers, 0..=1.
    pub quorum_percent: f64,
    /// Whether a block short of quorum may be recorded as pending.
    pub allow_pending: bool,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            min_confirmations: 1,
            quorum_percent: 0.67,
            allow_pending: true,
        }
    }
}

impl QuorumPolicy {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            min_confirmations: config.min_confirmations,
            quorum_percent: config.quorum_percent,
            allow_pending: config.allow_pending,
        }
    }

    /// `max(min_confirmations, max(1, floor(quorum_percent * live)))`.
    pub fn required(&self, live_peers: usize) -> usize {
        let share = (self.quorum_percent * live_peers as f64).floor() as usize;
        self.min_confirmations.max(share.max(1))
    }
}
