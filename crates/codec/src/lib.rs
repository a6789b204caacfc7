//! Client-side file codec: fixed-size chunking, SHA-256 Merkle roots, and
//! AES-256-GCM envelope encryption with a per-file key wrapped under an
//! owner-derived key. Pure functions, no I/O.

mod chunker;
mod crypto;
mod error;
mod merkle;

pub use chunker::{reassemble, split, Chunk, Chunks, DEFAULT_CHUNK_SIZE};
pub use crypto::{
    decrypt_chunk, derive_user_key, encrypt_chunk, generate_file_key, generate_salt,
    unwrap_file_key, wrap_file_key, FileKey, KdfParams, SymmetricKey, UserKey, KEY_LEN,
    NONCE_LEN, SALT_LEN, TAG_LEN,
};
pub use error::CodecError;
pub use merkle::{build_merkle_tree, merkle_root, verify_merkle_root};

use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn verify_chunk_hash(data: &[u8], expected: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn chunk_hash_check() {
        let h = sha256_hex(b"chunk");
        assert!(verify_chunk_hash(b"chunk", &h));
        assert!(!verify_chunk_hash(b"chunK", &h));
    }
}
