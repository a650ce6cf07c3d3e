//! X25519 keypair generation and key transport helpers.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{CryptoError, CryptoResult};

/// X25519 keys and the derived symmetric key are all 32 bytes.
pub const KEY_SIZE: usize = 32;

/// Generate a new X25519 keypair. Returns (private, public).
pub fn generate_keypair() -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let private = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&private);
    (private.to_bytes(), public.to_bytes())
}

/// Derive the public key from a private key.
pub fn public_key_from_private(private_key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Compute the X25519 shared secret between a local private key and a peer
/// public key.
pub fn shared_secret(
    private_key: &[u8; KEY_SIZE],
    peer_public_key: &[u8; KEY_SIZE],
) -> [u8; KEY_SIZE] {
    let secret = StaticSecret::from(*private_key);
    let peer = PublicKey::from(*peer_public_key);
    secret.diffie_hellman(&peer).to_bytes()
}

/// Encode a key to base64 for wire transport.
pub fn key_to_base64(key: &[u8; KEY_SIZE]) -> String {
    BASE64.encode(key)
}

/// Decode a base64-encoded 32-byte key.
pub fn key_from_base64(encoded: &str) -> CryptoResult<[u8; KEY_SIZE]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("key must be 32 bytes".to_string()))
}
