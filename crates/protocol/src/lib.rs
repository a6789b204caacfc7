//! Wire types spoken between storage peers and the coordinator.
//!
//! The same bodies travel over both bindings: as JSON over the
//! request/reply HTTP surface, and wrapped in a correlated
//! [`RequestEnvelope`]/[`ReplyEnvelope`] over the duplex channel.

mod address;
mod envelope;
mod receipt;

pub use address::{is_content_address, ContentAddress};
pub use envelope::{
    Operation, OperationResult, ReplyEnvelope, RequestEnvelope, RequestPayload, WsMessage,
};
pub use receipt::StoreReceipt;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{Deserialize, Serialize};

/// Header carrying the admin token on the HTTP `delete` route.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid content address: {0}")]
    InvalidAddress(String),
    #[error("invalid base64 payload: {0}")]
    InvalidPayload(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreStatus {
    Stored,
    Exists,
    HashMismatch,
}

impl StoreStatus {
    /// The peer holds the bytes after this call.
    pub fn is_held(self) -> bool {
        matches!(self, Self::Stored | Self::Exists)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreChunkRequest {
    /// Expected address; when absent the peer stores under the address it computes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_hash: Option<ContentAddress>,
    pub data_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreChunkResponse {
    pub status: StoreStatus,
    /// Address the peer computed from the bytes it received.
    pub chunk_hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<StoreReceipt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveChunkResponse {
    pub chunk_hash: ContentAddress,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistsResponse {
    pub chunk_hash: ContentAddress,
    pub exists: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub chunk_hash: ContentAddress,
    pub exists: bool,
    pub valid: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub chunk_hash: ContentAddress,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub status: String,
    pub node_id: String,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub chunk_count: u64,
}

/// Body of a non-2xx HTTP reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn encode_b64(data: &[u8]) -> String {
    B64.encode(data)
}

pub fn decode_b64(data: &str) -> Result<Vec<u8>, ProtocolError> {
    B64.decode(data)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&StoreStatus::HashMismatch).unwrap(),
            "\"hashMismatch\""
        );
        assert_eq!(serde_json::to_string(&StoreStatus::Stored).unwrap(), "\"stored\"");
        assert!(StoreStatus::Exists.is_held());
        assert!(!StoreStatus::HashMismatch.is_held());
    }

    #[test]
    fn store_request_uses_camel_case_and_optional_hash() {
        let req = StoreChunkRequest {
            chunk_hash: None,
            data_b64: encode_b64(b"hi"),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({ "dataB64": "aGk=" }));

        let parsed: StoreChunkRequest = serde_json::from_value(serde_json::json!({
            "chunkHash": ContentAddress::of(b"hi").to_string(),
            "dataB64": "aGk="
        }))
        .unwrap();
        assert_eq!(parsed.chunk_hash, Some(ContentAddress::of(b"hi")));
        assert_eq!(decode_b64(&parsed.data_b64).unwrap(), b"hi");
    }

    #[test]
    fn bad_base64_is_a_payload_error() {
        assert!(matches!(
            decode_b64("***"),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }
}
