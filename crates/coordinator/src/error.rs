use meshvault_codec::CodecError;
use thiserror::Error;

use crate::ledger::LedgerError;

/// Failure of one operation against one peer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("peer rejected request: {0}")]
    Rejected(String),
    #[error("malformed peer reply: {0}")]
    Protocol(String),
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("store receipt failed verification")]
    InvalidReceipt,
    #[error("peer {0} is not connected")]
    NotConnected(String),
}

impl TransportError {
    /// Timeouts, connection failures and gateway-style 5xx are worth
    /// another attempt; anything the peer answered deliberately is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection(_) => true,
            Self::Http { status, .. } => matches!(*status, 500 | 502 | 503 | 504),
            Self::Rejected(_)
            | Self::Protocol(_)
            | Self::HashMismatch { .. }
            | Self::InvalidReceipt
            | Self::NotConnected(_) => false,
        }
    }
}

/// File-level outcomes surfaced to callers of the coordinator.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transient peer failure: {0}")]
    TransientPeerFailure(#[from] TransportError),
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),
    #[error("wrong secret: file key could not be unwrapped")]
    WrongSecret,
    #[error("access denied to file {0}")]
    AccessDenied(String),
    #[error("chunk {index} unavailable: no replica returned verified data")]
    ChunkUnavailable { index: usize },
    #[error("file {0} not found")]
    FileNotFound(String),
    #[error("chunk {index} could not be placed on any peer")]
    PlacementFailed { index: usize },
    #[error("no live peers")]
    NoPeers,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("codec: {0}")]
    Codec(CodecError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<CodecError> for CoreError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::AuthenticationFailure => Self::WrongSecret,
            other => Self::Codec(other),
        }
    }
}
