use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CodecError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 16;

/// 256-bit AES-GCM key, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

/// Random per-file key shared by all chunks of one file.
pub type FileKey = SymmetricKey;
/// Key derived from an owner's secret; only ever used to wrap file keys.
pub type UserKey = SymmetricKey;

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let arr = <[u8; KEY_LEN]>::try_from(bytes)
            .map_err(|_| CodecError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Argon2id cost. `iterations` is the time cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub iterations: u32,
    pub memory_kib: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: 3,
            memory_kib: 19 * 1024,
        }
    }
}

pub fn generate_file_key() -> FileKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    SymmetricKey(key)
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// `nonce ‖ ciphertext ‖ tag` under a fresh random 96-bit nonce.
pub fn encrypt_chunk(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CodecError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CodecError::InvalidKeyLength(KEY_LEN))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CodecError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_chunk(data: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CodecError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CodecError::AuthenticationFailure);
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CodecError::InvalidKeyLength(KEY_LEN))?;
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CodecError::AuthenticationFailure)
}

/// Same secret and salt always give the same key.
pub fn derive_user_key(
    secret: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<UserKey, CodecError> {
    let argon_params = Params::new(params.memory_kib, params.iterations, 1, Some(KEY_LEN))
        .map_err(|e| CodecError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(secret, salt, &mut key)
        .map_err(|e| CodecError::KeyDerivation(e.to_string()))?;
    let derived = SymmetricKey(key);
    key.zeroize();
    Ok(derived)
}

pub fn wrap_file_key(file_key: &FileKey, user_key: &UserKey) -> Result<Vec<u8>, CodecError> {
    encrypt_chunk(file_key.as_bytes(), user_key)
}

/// A tag failure here means the owner's secret was wrong, not corruption.
pub fn unwrap_file_key(wrapped: &[u8], user_key: &UserKey) -> Result<FileKey, CodecError> {
    let mut raw = decrypt_chunk(wrapped, user_key)?;
    let key = SymmetricKey::from_slice(&raw);
    raw.zeroize();
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfParams {
        KdfParams {
            iterations: 1,
            memory_kib: 64,
        }
    }

    #[test]
    fn round_trip_including_empty() {
        let key = generate_file_key();
        for plaintext in [&b""[..], b"x", &[7u8; 1000][..]] {
            let sealed = encrypt_chunk(plaintext, &key).unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
            assert_eq!(decrypt_chunk(&sealed, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let key = generate_file_key();
        let a = encrypt_chunk(b"same", &key).unwrap();
        let b = encrypt_chunk(b"same", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_or_short_input_fails_authentication() {
        let key = generate_file_key();
        let mut sealed = encrypt_chunk(b"payload", &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            decrypt_chunk(&sealed, &key),
            Err(CodecError::AuthenticationFailure)
        ));
        assert!(matches!(
            decrypt_chunk(&[0u8; 5], &key),
            Err(CodecError::AuthenticationFailure)
        ));
    }

    #[test]
    fn derivation_is_deterministic_per_secret_and_salt() {
        let salt = [9u8; SALT_LEN];
        let a = derive_user_key(b"hunter2", &salt, &cheap()).unwrap();
        let b = derive_user_key(b"hunter2", &salt, &cheap()).unwrap();
        let c = derive_user_key(b"hunter3", &salt, &cheap()).unwrap();
        let d = derive_user_key(b"hunter2", &[8u8; SALT_LEN], &cheap()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn short_salt_is_a_derivation_error() {
        assert!(matches!(
            derive_user_key(b"pw", b"abc", &cheap()),
            Err(CodecError::KeyDerivation(_))
        ));
    }

    #[test]
    fn wrong_secret_cannot_unwrap() {
        let salt = generate_salt();
        let owner = derive_user_key(b"right", &salt, &cheap()).unwrap();
        let intruder = derive_user_key(b"wrong", &salt, &cheap()).unwrap();
        let file_key = generate_file_key();

        let wrapped = wrap_file_key(&file_key, &owner).unwrap();
        assert_eq!(unwrap_file_key(&wrapped, &owner).unwrap(), file_key);
        assert!(matches!(
            unwrap_file_key(&wrapped, &intruder),
            Err(CodecError::AuthenticationFailure)
        ));
    }

    #[test]
    fn debug_does_not_leak_key_material() {
        let key = SymmetricKey::from_bytes([0xAB; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "SymmetricKey(..)");
    }
}
