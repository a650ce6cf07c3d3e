//! Handshake error taxonomy.

use tether_crypto::CryptoError;

use crate::api::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The authorization poll loop exhausted its attempts.
    #[error("authorization polling exhausted after {attempts} attempts")]
    AuthorizationTimeout { attempts: u32 },

    /// The poll loop (or a blocking wait) was cancelled.
    #[error("handshake cancelled")]
    Cancelled,

    /// encrypt/decrypt called outside the authorized state. Callers must
    /// treat this as fatal to the session object, not retry.
    #[error("session is not authorized")]
    NotAuthorized,

    /// Authentication tag mismatch while opening a sealed payload. The
    /// owning session is failed; the relay is unaffected.
    #[error("decryption failed")]
    DecryptFailed,

    /// Authorization arrived without an encrypted session key or responder
    /// public key.
    #[error("authorization status is missing key material")]
    MissingKeyMaterial,

    #[error("session expired")]
    SessionExpired,

    #[error("session revoked")]
    SessionRevoked,

    #[error("no stored session to restore")]
    NoStoredSession,

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("session storage failed: {0}")]
    Storage(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;
