use meshvault_codec::KdfParams;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// `prevHash` of the first block.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl BlockStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        })
    }
}

/// One chunk's assignment to the peers that accepted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRecord {
    pub index: usize,
    pub plaintext_hash: String,
    pub ciphertext_hash: String,
    /// Ciphertext length in bytes.
    pub size: u64,
    /// Peer ids, in the order retrieval should try them.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub owner: String,
    pub name: String,
    /// Plaintext size in bytes.
    pub size: u64,
    pub merkle_root: String,
    /// File key sealed under the owner's derived key, hex.
    pub wrapped_key: String,
    /// Salt for the owner-key derivation, hex.
    pub key_salt: String,
    pub kdf: KdfParams,
    pub placements: Vec<PlacementRecord>,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl FileMetadata {
    pub fn plaintext_hashes(&self) -> Vec<&str> {
        let mut records: Vec<&PlacementRecord> = self.placements.iter().collect();
        records.sort_by_key(|r| r.index);
        records.iter().map(|r| r.plaintext_hash.as_str()).collect()
    }

    /// Distinct peers across all placements, in first-seen order.
    pub fn peers(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for peer in self.placements.iter().flat_map(|r| r.peers.iter()) {
            if !seen.contains(peer) {
                seen.push(peer.clone());
            }
        }
        seen
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionMarker {
    pub file_id: String,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareMarker {
    pub file_id: String,
    pub owner: String,
    pub grantee: String,
}

/// What a block records, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockPayload {
    FileMetadata(FileMetadata),
    Deletion(DeletionMarker),
    Share(ShareMarker),
    Unshare(ShareMarker),
}

impl BlockPayload {
    pub fn file_id(&self) -> &str {
        match self {
            Self::FileMetadata(m) => &m.file_id,
            Self::Deletion(d) => &d.file_id,
            Self::Share(s) | Self::Unshare(s) => &s.file_id,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            Self::FileMetadata(m) => &m.owner,
            Self::Deletion(d) => &d.owner,
            Self::Share(s) | Self::Unshare(s) => &s.owner,
        }
    }

    pub fn as_file(&self) -> Option<&FileMetadata> {
        match self {
            Self::FileMetadata(m) => Some(m),
            _ => None,
        }
    }
}

/// A peer's attestation that it holds some of a block's chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub peer_id: String,
    pub chunk_hashes: Vec<String>,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub signature: Option<String>,
}

impl Confirmation {
    pub fn new(peer_id: impl Into<String>, chunk_hashes: Vec<String>, timestamp: i64) -> Self {
        Self {
            peer_id: peer_id.into(),
            chunk_hashes,
            timestamp,
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: Option<String>) -> Self {
        self.signature = signature;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    pub prev_hash: String,
    pub data: BlockPayload,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub hash: String,
    pub status: BlockStatus,
    #[serde(default)]
    pub confirmations: Vec<Confirmation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Block {
    /// Build a block and stamp its hash. Status starts pending.
    pub fn seal(
        index: u64,
        prev_hash: String,
        data: BlockPayload,
        timestamp: i64,
    ) -> Result<Self, serde_json::Error> {
        let hash = block_hash(index, &prev_hash, &data, timestamp)?;
        Ok(Self {
            index,
            prev_hash,
            data,
            timestamp,
            hash,
            status: BlockStatus::Pending,
            confirmations: Vec::new(),
            confirmed_at: None,
            rejected_at: None,
            rejection_reason: None,
        })
    }

    /// Hash over the immutable fields only.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        block_hash(self.index, &self.prev_hash, &self.data, self.timestamp)
    }

    pub fn has_confirmation_from(&self, peer_id: &str) -> bool {
        self.confirmations.iter().any(|c| c.peer_id == peer_id)
    }

    /// Distinct confirming peers.
    pub fn confirmation_count(&self) -> usize {
        let mut peers: Vec<&str> = self.confirmations.iter().map(|c| c.peer_id.as_str()).collect();
        peers.sort_unstable();
        peers.dedup();
        peers.len()
    }
}

/// SHA-256 of the compact, key-sorted JSON of
/// `{data, index, prev_hash, timestamp}`.
pub fn block_hash(
    index: u64,
    prev_hash: &str,
    data: &BlockPayload,
    timestamp: i64,
) -> Result<String, serde_json::Error> {
    let mut header = serde_json::Map::new();
    header.insert("data".into(), serde_json::to_value(data)?);
    header.insert("index".into(), Value::from(index));
    header.insert("prev_hash".into(), Value::from(prev_hash));
    header.insert("timestamp".into(), Value::from(timestamp));

    let mut canonical = String::new();
    write_canonical(&Value::Object(header), &mut canonical)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Compact JSON with object keys sorted at every depth, independent of
/// how the map type orders its entries.
fn write_canonical(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out)?;
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
