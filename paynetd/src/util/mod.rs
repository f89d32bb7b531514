pub mod observability;

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use log::info;
use paynet::bitcoin::secp256k1::{rand, SecretKey};

/// Read the 32-byte node secret at `path`, generating it on first start
pub fn read_or_create_node_secret(path: &Path) -> anyhow::Result<[u8; 32]> {
    if path.exists() {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        return bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("{}: expected 32 bytes, got {}", path.display(), b.len()));
    }
    let secret = SecretKey::new(&mut rand::thread_rng()).secret_bytes();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    fs::write(path, secret).with_context(|| format!("write {}", path.display()))?;
    info!("generated a new node secret at {}", path.display());
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn node_secret_test() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regtest").join("node_secret");
        let secret = read_or_create_node_secret(&path).unwrap();
        assert_eq!(read_or_create_node_secret(&path).unwrap(), secret);

        fs::write(&path, [1u8; 5]).unwrap();
        assert!(read_or_create_node_secret(&path).is_err());
    }
}
