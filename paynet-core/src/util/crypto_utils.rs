use bitcoin::hashes::sha256::Hash as Sha256Hash;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1::{self, ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};

use crate::error::{internal_error, Result};

fn tagged_hash(node_secret: &[u8; 32], info: &[u8], index: u64) -> [u8; 32] {
    let mut engine = Sha256Hash::engine();
    engine.input(node_secret);
    engine.input(info);
    engine.input(&index.to_be_bytes());
    Sha256Hash::from_engine(engine).to_byte_array()
}

/// The node's identity key pair
pub fn node_keys<C: secp256k1::Signing>(
    secp_ctx: &Secp256k1<C>,
    node_secret: &[u8; 32],
) -> Result<(SecretKey, PublicKey)> {
    let secret = SecretKey::from_slice(&tagged_hash(node_secret, b"node-identity", 0))
        .map_err(|e| internal_error(format!("node key: {}", e)))?;
    Ok((secret, PublicKey::from_secret_key(secp_ctx, &secret)))
}

/// Derive the funding key for the channel with the given key index.
///
/// Each channel gets its own index so that no two anchors share a key.
pub fn derive_funding_key<C: secp256k1::Signing>(
    secp_ctx: &Secp256k1<C>,
    node_secret: &[u8; 32],
    key_index: u64,
) -> Result<(SecretKey, PublicKey)> {
    let secret = SecretKey::from_slice(&tagged_hash(node_secret, b"channel-funding", key_index))
        .map_err(|e| internal_error(format!("funding key {}: {}", key_index, e)))?;
    Ok((secret, PublicKey::from_secret_key(secp_ctx, &secret)))
}

/// A temporary channel id, used until the anchor outpoint is known
pub fn temporary_channel_id_bytes(node_secret: &[u8; 32], key_index: u64) -> [u8; 32] {
    tagged_hash(node_secret, b"temporary-channel-id", key_index)
}

/// Sign a 32 byte sighash digest
pub fn sign_digest<C: secp256k1::Signing>(
    secp_ctx: &Secp256k1<C>,
    digest: [u8; 32],
    secret: &SecretKey,
) -> Signature {
    secp_ctx.sign_ecdsa(&Message::from_digest(digest), secret)
}

/// Verify a signature over a 32 byte sighash digest
pub fn verify_digest<C: secp256k1::Verification>(
    secp_ctx: &Secp256k1<C>,
    digest: [u8; 32],
    sig: &Signature,
    pubkey: &PublicKey,
) -> bool {
    secp_ctx.verify_ecdsa(&Message::from_digest(digest), sig, pubkey).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_keys_differ_per_index_test() {
        let secp_ctx = Secp256k1::new();
        let secret = [3u8; 32];
        let (_, pk0) = derive_funding_key(&secp_ctx, &secret, 0).unwrap();
        let (_, pk1) = derive_funding_key(&secp_ctx, &secret, 1).unwrap();
        let (_, pk0_again) = derive_funding_key(&secp_ctx, &secret, 0).unwrap();
        assert_ne!(pk0, pk1);
        assert_eq!(pk0, pk0_again);
        let (_, node_pk) = node_keys(&secp_ctx, &secret).unwrap();
        assert_ne!(node_pk, pk0);
    }

    #[test]
    fn sign_verify_digest_test() {
        let secp_ctx = Secp256k1::new();
        let (sk, pk) = derive_funding_key(&secp_ctx, &[9u8; 32], 4).unwrap();
        let sig = sign_digest(&secp_ctx, [1u8; 32], &sk);
        assert!(verify_digest(&secp_ctx, [1u8; 32], &sig, &pk));
        assert!(!verify_digest(&secp_ctx, [2u8; 32], &sig, &pk));
    }
}
