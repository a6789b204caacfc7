use anyhow::Context;
use libp2p_identity::Keypair;
use std::fs;
use std::path::Path;

const IDENTITY_FILE: &str = "node_identity.key";

/// The node's ed25519 identity, created on first start and reused after.
pub fn load_or_create_identity(storage_path: impl AsRef<Path>) -> anyhow::Result<Keypair> {
    let key_path = storage_path.as_ref().join(IDENTITY_FILE);

    if key_path.exists() {
        let bytes = fs::read(&key_path)
            .with_context(|| format!("failed to read identity {}", key_path.display()))?;
        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .with_context(|| format!("failed to decode identity {}", key_path.display()))?;
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair.to_protobuf_encoding()?;
    fs::write(&key_path, encoded)
        .with_context(|| format!("failed to write identity {}", key_path.display()))?;
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_identity(dir.path()).unwrap();
        let second = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }
}
