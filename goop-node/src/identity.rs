//! Persistent node identity.
//!
//! The node's identity is its substrate secret key; the public endpoint id
//! derived from it is the PeerID every other node sees. The key is stored as
//! hex in the peer directory so the id is stable across restarts.

use std::path::Path;

use anyhow::Result;

/// Load the secret key from `path`, or generate and persist a fresh one.
pub fn load_or_create_secret_key(path: &Path) -> Result<iroh::SecretKey> {
    if path.exists() {
        let hex_str = std::fs::read_to_string(path)?;
        let bytes: [u8; 32] = hex::decode(hex_str.trim())
            .map_err(|e| anyhow::anyhow!("invalid identity key in {}: {e}", path.display()))?
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity key in {} has wrong length", path.display()))?;
        Ok(iroh::SecretKey::from_bytes(&bytes))
    } else {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = iroh::SecretKey::from_bytes(&bytes);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(key.to_bytes()))?;
        tracing::info!("Generated new identity key at {}", path.display());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let a = load_or_create_secret_key(&path).unwrap();
        let b = load_or_create_secret_key(&path).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn rejects_garbage_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, "not hex at all").unwrap();
        assert!(load_or_create_secret_key(&path).is_err());
    }
}
