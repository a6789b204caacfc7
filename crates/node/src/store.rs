use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use meshvault_protocol::{ContentAddress, StoreStatus};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

const USED_BYTES_KEY: &[u8] = b"__meta:used_bytes";
const ENCRYPTION_KEY: &[u8] = b"__meta:node_encryption_key";
const CHUNK_PREFIX: &str = "c:";
const SIZES_TREE: &str = "chunk_sizes";
const AT_REST_NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block store: {0}")]
    Db(#[from] sled::Error),
    #[error("capacity exceeded: {needed} bytes needed, {capacity} byte limit")]
    CapacityExceeded { needed: u64, capacity: u64 },
    #[error("stored chunk {0} failed its integrity check")]
    Corrupted(String),
    #[error("at-rest encryption failed")]
    Encryption,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub status: StoreStatus,
    /// Address computed from the received bytes.
    pub address: ContentAddress,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCheck {
    pub exists: bool,
    pub valid: bool,
    pub size: u64,
}

/// Content-addressed chunk store on sled. Payloads are sealed under a
/// node-local key so the raw database never holds chunk bytes in clear,
/// even though those bytes are already client ciphertext.
pub struct SecureBlockStore {
    db: Db,
    sizes: Tree,
    max_bytes: u64,
    cipher: Aes256Gcm,
    // Serialises the used-bytes read-modify-write.
    write_lock: Mutex<()>,
}

impl SecureBlockStore {
    pub fn open(storage_path: impl AsRef<Path>, max_gb: u64) -> Result<Self, StoreError> {
        let max_bytes = max_gb
            .saturating_mul(1024)
            .saturating_mul(1024)
            .saturating_mul(1024);
        Self::with_capacity_bytes(storage_path, max_bytes)
    }

    pub fn with_capacity_bytes(
        storage_path: impl AsRef<Path>,
        max_bytes: u64,
    ) -> Result<Self, StoreError> {
        let storage_path = storage_path.as_ref();
        let db = sled::open(storage_path)?;
        let sizes = db.open_tree(SIZES_TREE)?;

        let cipher = match db.get(ENCRYPTION_KEY)? {
            Some(bytes) if bytes.len() == 32 => {
                Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes))
            }
            _ => {
                let key = Aes256Gcm::generate_key(OsRng);
                db.insert(ENCRYPTION_KEY, key.as_slice())?;
                db.flush()?;
                Aes256Gcm::new(&key)
            }
        };

        info!(
            path = %storage_path.display(),
            capacity_bytes = max_bytes,
            used_bytes = read_used_bytes(&db)?,
            chunks = sizes.len(),
            "block store opened"
        );
        Ok(Self {
            db,
            sizes,
            max_bytes,
            cipher,
            write_lock: Mutex::new(()),
        })
    }

    /// Idempotent: an address already held is answered with `Exists` and
    /// not rewritten. `expected`, when given, must equal the address of
    /// `data` or nothing is written.
    pub fn store(
        &self,
        expected: Option<&ContentAddress>,
        data: &[u8],
    ) -> Result<StoreOutcome, StoreError> {
        let address = ContentAddress::of(data);
        let size = data.len() as u64;
        let outcome = |status| StoreOutcome {
            status,
            address: address.clone(),
            size,
        };

        if let Some(expected) = expected {
            if *expected != address {
                warn!(expected = %expected.short(), actual = %address.short(), "store hash mismatch");
                return Ok(outcome(StoreStatus::HashMismatch));
            }
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.sizes.contains_key(address.as_str())? {
            debug!(cid = %address.short(), "chunk already held");
            return Ok(outcome(StoreStatus::Exists));
        }

        let sealed = self.seal(data)?;
        let used = read_used_bytes(&self.db)?;
        let projected = used.saturating_add(sealed.len() as u64);
        if projected > self.max_bytes {
            return Err(StoreError::CapacityExceeded {
                needed: projected,
                capacity: self.max_bytes,
            });
        }

        self.db.insert(chunk_key(&address), sealed)?;
        self.sizes.insert(address.as_str(), size.to_le_bytes().to_vec())?;
        write_used_bytes(&self.db, projected)?;
        debug!(cid = %address.short(), size, "chunk stored");
        Ok(outcome(StoreStatus::Stored))
    }

    /// Bytes whose address re-verifies, `None` when absent. Never serves
    /// data that fails the check.
    pub fn retrieve(&self, cid: &ContentAddress) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(payload) = self.db.get(chunk_key(cid))? else {
            return Ok(None);
        };
        let data = self
            .open_sealed(&payload)
            .ok_or_else(|| StoreError::Corrupted(cid.to_string()))?;
        if !cid.matches(&data) {
            return Err(StoreError::Corrupted(cid.to_string()));
        }
        Ok(Some(data))
    }

    /// Recorded size of the chunk, if held.
    pub fn exists(&self, cid: &ContentAddress) -> Result<Option<u64>, StoreError> {
        Ok(self.sizes.get(cid.as_str())?.map(|v| decode_u64(&v)))
    }

    pub fn verify(&self, cid: &ContentAddress) -> Result<ChunkCheck, StoreError> {
        match self.retrieve(cid) {
            Ok(Some(data)) => Ok(ChunkCheck {
                exists: true,
                valid: true,
                size: data.len() as u64,
            }),
            Ok(None) => Ok(ChunkCheck {
                exists: false,
                valid: false,
                size: 0,
            }),
            Err(StoreError::Corrupted(_)) => Ok(ChunkCheck {
                exists: true,
                valid: false,
                size: self.exists(cid)?.unwrap_or(0),
            }),
            Err(e) => Err(e),
        }
    }

    pub fn delete(&self, cid: &ContentAddress) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.sizes.remove(cid.as_str())?;
        let Some(v) = self.db.remove(chunk_key(cid))? else {
            return Ok(false);
        };
        let used = read_used_bytes(&self.db)?;
        write_used_bytes(&self.db, used.saturating_sub(v.len() as u64))?;
        debug!(cid = %cid.short(), "chunk deleted");
        Ok(true)
    }

    pub fn used_bytes(&self) -> u64 {
        read_used_bytes(&self.db).unwrap_or(0)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn chunk_count(&self) -> u64 {
        self.sizes.len() as u64
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn seal(&self, data: &[u8]) -> Result<Vec<u8>, StoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let encrypted = self
            .cipher
            .encrypt(&nonce, data)
            .map_err(|_| StoreError::Encryption)?;
        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&encrypted);
        Ok(payload)
    }

    /// Swap the bytes held under `cid` without touching its address.
    #[cfg(test)]
    pub(crate) fn overwrite(&self, cid: &ContentAddress, data: &[u8]) -> Result<(), StoreError> {
        self.db.insert(chunk_key(cid), self.seal(data)?)?;
        Ok(())
    }

    fn open_sealed(&self, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.len() < AT_REST_NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = payload.split_at(AT_REST_NONCE_LEN);
        self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
    }
}

fn chunk_key(cid: &ContentAddress) -> String {
    format!("{CHUNK_PREFIX}{cid}")
}

fn decode_u64(v: &[u8]) -> u64 {
    <[u8; 8]>::try_from(v).map(u64::from_le_bytes).unwrap_or(0)
}

fn read_used_bytes(db: &Db) -> Result<u64, sled::Error> {
    Ok(db.get(USED_BYTES_KEY)?.map(|v| decode_u64(&v)).unwrap_or(0))
}

fn write_used_bytes(db: &Db, bytes: u64) -> Result<(), sled::Error> {
    db.insert(USED_BYTES_KEY, bytes.to_le_bytes().to_vec())?;
    Ok(())
}
