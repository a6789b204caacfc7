use libp2p_identity::{Keypair, PeerId, PublicKey};
use serde::{Deserialize, Serialize};

use crate::{ContentAddress, ProtocolError};

/// A peer's signed acknowledgement that it holds `len` bytes under `cid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreReceipt {
    pub timestamp_ms: u64,
    /// Hex-encoded signature over [`StoreReceipt::payload`].
    pub signature: String,
    /// Hex-encoded protobuf public key of the signing peer.
    pub public_key: String,
}

impl StoreReceipt {
    pub fn payload(cid: &ContentAddress, len: usize, timestamp_ms: u64) -> Vec<u8> {
        format!("store:{cid}:{len}:{timestamp_ms}").into_bytes()
    }

    pub fn sign(
        keypair: &Keypair,
        cid: &ContentAddress,
        len: usize,
        timestamp_ms: u64,
    ) -> Result<Self, ProtocolError> {
        let signature = keypair
            .sign(&Self::payload(cid, len, timestamp_ms))
            .map_err(|e| ProtocolError::Signing(e.to_string()))?;
        Ok(Self {
            timestamp_ms,
            signature: hex::encode(signature),
            public_key: hex::encode(keypair.public().encode_protobuf()),
        })
    }

    pub fn verify(&self, cid: &ContentAddress, len: usize) -> bool {
        let (Ok(public_key), Ok(signature)) =
            (hex::decode(&self.public_key), hex::decode(&self.signature))
        else {
            return false;
        };
        verify_signature(
            &public_key,
            &signature,
            &Self::payload(cid, len, self.timestamp_ms),
        )
    }

    /// Peer id derived from the embedded public key, if it decodes.
    pub fn signer(&self) -> Option<String> {
        let bytes = hex::decode(&self.public_key).ok()?;
        let key = PublicKey::try_decode_protobuf(&bytes).ok()?;
        Some(key.to_peer_id().to_string())
    }

    /// Whether this receipt was signed by `peer_id`. Ids that are not
    /// key-derived carry nothing to compare against and always pass.
    pub fn issued_by(&self, peer_id: &str) -> bool {
        match peer_id.parse::<PeerId>() {
            Ok(expected) => self.signer() == Some(expected.to_string()),
            Err(_) => true,
        }
    }
}

fn verify_signature(public_key: &[u8], signature: &[u8], payload: &[u8]) -> bool {
    let Ok(public_key) = PublicKey::try_decode_protobuf(public_key) else {
        return false;
    };
    public_key.verify(payload, signature)
}
