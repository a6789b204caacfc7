use serde::{Deserialize, Serialize};

use crate::{
    ContentAddress, DeleteResponse, ExistsResponse, NodeHealth, RetrieveChunkResponse,
    StoreChunkResponse, VerifyResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Store,
    Retrieve,
    Exists,
    Delete,
    Verify,
    Ping,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_hash: Option<ContentAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
}

/// Coordinator → peer. The peer must echo `request_id` in its reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub payload: RequestPayload,
}

impl RequestEnvelope {
    pub fn new(request_id: impl Into<String>, operation: Operation, payload: RequestPayload) -> Self {
        Self {
            request_id: request_id.into(),
            operation,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationResult {
    Store(StoreChunkResponse),
    Retrieve(RetrieveChunkResponse),
    Exists(ExistsResponse),
    Delete(DeleteResponse),
    Verify(VerifyResponse),
    Ping(NodeHealth),
}

/// Peer → coordinator answer to one [`RequestEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplyEnvelope {
    pub fn ok(request_id: impl Into<String>, result: OperationResult) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Every frame on the duplex channel, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "node:register", rename_all = "camelCase")]
    NodeRegister {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        capacity_bytes: u64,
        used_bytes: u64,
        platform: String,
        version: String,
    },
    #[serde(rename = "registered", rename_all = "camelCase")]
    Registered { node_id: String },
    #[serde(rename = "heartbeat", rename_all = "camelCase")]
    Heartbeat {
        node_id: String,
        used_bytes: u64,
        timestamp: u64,
    },
    #[serde(rename = "request")]
    Request(RequestEnvelope),
    #[serde(rename = "reply")]
    Reply(ReplyEnvelope),
    #[serde(other)]
    Unknown,
}

impl WsMessage {
    /// The `type` discriminator, used to key unsolicited-message handlers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeRegister { .. } => "node:register",
            Self::Registered { .. } => "registered",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Request(_) => "request",
            Self::Reply(_) => "reply",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StoreStatus, StoreChunkResponse};

    #[test]
    fn request_frame_shape() {
        let msg = WsMessage::Request(RequestEnvelope::new(
            "req-1",
            Operation::Retrieve,
            RequestPayload {
                chunk_hash: Some(ContentAddress::of(b"x")),
                data_b64: None,
            },
        ));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["operation"], "retrieve");
        assert_eq!(
            json["payload"]["chunkHash"],
            ContentAddress::of(b"x").to_string()
        );
    }

    #[test]
    fn reply_frame_parses_typed_result() {
        let cid = ContentAddress::of(b"x");
        let raw = serde_json::json!({
            "type": "reply",
            "requestId": "req-9",
            "success": true,
            "result": {
                "operation": "store",
                "status": "exists",
                "chunkHash": cid.to_string(),
                "size": 1
            }
        });
        let msg: WsMessage = serde_json::from_value(raw).unwrap();
        let WsMessage::Reply(reply) = msg else {
            panic!("expected reply frame");
        };
        assert_eq!(reply.request_id, "req-9");
        match reply.result {
            Some(OperationResult::Store(StoreChunkResponse { status, .. })) => {
                assert_eq!(status, StoreStatus::Exists)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_types_are_tolerated() {
        let msg: WsMessage = serde_json::from_str(r#"{"type":"gossip"}"#).unwrap();
        assert_eq!(msg.kind(), "unknown");
    }

    #[test]
    fn register_frame_round_trips_camel_case() {
        let raw = r#"{"type":"node:register","nodeId":"n1","capacityBytes":10,"usedBytes":0,"platform":"linux","version":"0.1.0"}"#;
        let msg: WsMessage = serde_json::from_str(raw).unwrap();
        match msg {
            WsMessage::NodeRegister { node_id, address, .. } => {
                assert_eq!(node_id, "n1");
                assert!(address.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
