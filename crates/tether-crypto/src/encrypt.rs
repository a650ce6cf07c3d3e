//! Session-key derivation and authenticated encryption.
//!
//! HKDF parameters (must match every client platform):
//! - Hash: SHA-256
//! - Salt: session id string bytes
//! - Info: `b"tether-session-key-v1"`
//! - Output: 32 bytes
//!
//! Sealed blobs are `nonce(12) ‖ ciphertext ‖ tag(16)` under
//! ChaCha20-Poly1305.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::keys::KEY_SIZE;
use crate::{CryptoError, CryptoResult};

/// Domain-separation label for session-key derivation.
const SESSION_KEY_INFO: &[u8] = b"tether-session-key-v1";

/// ChaCha20-Poly1305 nonce size (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Derive the symmetric session key from an X25519 shared secret.
///
/// The session id goes in as HKDF salt, so the same keypair exchanged in a
/// different session yields an unrelated key.
pub fn derive_session_key(
    shared_secret: &[u8; KEY_SIZE],
    session_id: &str,
) -> CryptoResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(Some(session_id.as_bytes()), shared_secret);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(SESSION_KEY_INFO, &mut key)
        .map_err(|err| CryptoError::Derive(err.to_string()))?;
    Ok(key)
}

/// Encrypt a plaintext into a `nonce ‖ ciphertext ‖ tag` blob.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|err| CryptoError::Encrypt(err.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a `nonce ‖ ciphertext ‖ tag` blob. Fails closed on any tampering
/// or key mismatch.
pub fn open(key: &[u8; KEY_SIZE], sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::TooShort {
            min: NONCE_SIZE + TAG_SIZE,
            got: sealed.len(),
        });
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}
