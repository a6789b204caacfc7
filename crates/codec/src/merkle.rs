use sha2::{Digest, Sha256};

use crate::{sha256_hex, CodecError};

/// Merkle root over already-hashed hex leaves.
///
/// Parents hash the raw 32-byte digests of both children. A level with an
/// odd node count duplicates its last node before pairing. No leaves gives
/// the hash of the empty string. The root is persisted in ledger blocks, so
/// this shape must not change.
pub fn merkle_root<S: AsRef<str>>(hashes: &[S]) -> Result<String, CodecError> {
    if hashes.is_empty() {
        return Ok(sha256_hex(&[]));
    }
    let mut level = decode_leaves(hashes)?;
    while level.len() > 1 {
        level = next_level(level);
    }
    Ok(hex::encode(level[0]))
}

/// Every level of the tree as hex, leaves first and the root last.
pub fn build_merkle_tree<S: AsRef<str>>(hashes: &[S]) -> Result<Vec<Vec<String>>, CodecError> {
    if hashes.is_empty() {
        return Ok(vec![vec![sha256_hex(&[])]]);
    }
    let mut level = decode_leaves(hashes)?;
    let mut levels = vec![level.iter().map(hex::encode).collect::<Vec<_>>()];
    while level.len() > 1 {
        level = next_level(level);
        levels.push(level.iter().map(hex::encode).collect());
    }
    Ok(levels)
}

pub fn verify_merkle_root<S: AsRef<str>>(hashes: &[S], expected_root: &str) -> bool {
    match merkle_root(hashes) {
        Ok(root) => root.eq_ignore_ascii_case(expected_root),
        Err(_) => false,
    }
}

fn decode_leaves<S: AsRef<str>>(hashes: &[S]) -> Result<Vec<[u8; 32]>, CodecError> {
    hashes
        .iter()
        .map(|h| {
            let raw = h.as_ref();
            let bytes = hex::decode(raw).map_err(|_| CodecError::InvalidHash(raw.to_string()))?;
            <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| CodecError::InvalidHash(raw.to_string()))
        })
        .collect()
}

fn next_level(mut level: Vec<[u8; 32]>) -> Vec<[u8; 32]> {
    if level.len() % 2 == 1 {
        if let Some(last) = level.last().copied() {
            level.push(last);
        }
    }
    level
        .chunks(2)
        .map(|pair| {
            let mut hasher = Sha256::new();
            hasher.update(pair[0]);
            hasher.update(pair[1]);
            hasher.finalize().into()
        })
        .collect()
}
