//! Tether crypto library.
//!
//! Key material for the device-pairing handshake:
//! - X25519 ephemeral key exchange, one keypair per web session
//! - HKDF-SHA256 derivation of the symmetric session key, salted with the
//!   session id so a key never transfers between sessions
//! - ChaCha20-Poly1305 over `nonce(12) ‖ ciphertext ‖ tag(16)` blobs
//!
//! The relay never links against the encryption paths; it forwards sealed
//! payloads untouched.

pub mod encrypt;
pub mod keys;

/// Errors from key derivation and sealed-blob handling.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    Derive(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: authentication tag mismatch")]
    Decrypt,

    #[error("sealed data too short (need at least {min} bytes, got {got})")]
    TooShort { min: usize, got: usize },

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
