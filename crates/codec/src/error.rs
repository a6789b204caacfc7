#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("invalid sha-256 hex digest: {0}")]
    InvalidHash(String),
    #[error("authentication failed: wrong key or corrupted ciphertext")]
    AuthenticationFailure,
    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed")]
    Encryption,
    #[error("chunk {0} missing from reassembly")]
    MissingChunk(usize),
}
