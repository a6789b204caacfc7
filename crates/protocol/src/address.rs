use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// Lowercase hex SHA-256 of a chunk's ciphertext. The only key peers
/// index chunks by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Accepts the canonical form only: an address that differs in case
    /// names a different key.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        if !is_content_address(value) {
            return Err(ProtocolError::InvalidAddress(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    /// Address of `data` as computed locally.
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

/// Exactly 64 lowercase hex characters.
pub fn is_content_address(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ContentAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentAddress> for String {
    fn from(value: ContentAddress) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_of_known_vector() {
        let addr = ContentAddress::of(b"abc");
        assert_eq!(
            addr.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(addr.matches(b"abc"));
        assert!(!addr.matches(b"abd"));
    }

    #[test]
    fn parse_accepts_only_canonical_lowercase() {
        let lower = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(ContentAddress::parse(lower).unwrap(), ContentAddress::of(b"abc"));

        let upper = lower.to_ascii_uppercase();
        assert!(matches!(
            ContentAddress::parse(&upper),
            Err(ProtocolError::InvalidAddress(_))
        ));
        let mixed = format!("BA{}", &lower[2..]);
        assert!(ContentAddress::parse(&mixed).is_err());

        assert!(ContentAddress::parse("abc").is_err());
        assert!(ContentAddress::parse(&"g".repeat(64)).is_err());
        assert!(ContentAddress::parse(&"a".repeat(65)).is_err());
        assert!(!is_content_address(&upper));
    }

    #[test]
    fn serde_rejects_malformed_address() {
        let ok: Result<ContentAddress, _> = serde_json::from_str(&format!("\"{}\"", "0".repeat(64)));
        assert!(ok.is_ok());
        let bad: Result<ContentAddress, _> = serde_json::from_str("\"not-a-hash\"");
        assert!(bad.is_err());
        let shouted: Result<ContentAddress, _> =
            serde_json::from_str(&format!("\"{}\"", "A".repeat(64)));
        assert!(shouted.is_err());
    }
}
