//! Web-session handshake.
//!
//! Bootstraps the symmetric key that makes payloads opaque to every relay in
//! the system. A thin client calls [`WebSession::init`] to register an
//! ephemeral public key, polls for authorization by a trusted device, derives
//! the session key via X25519 + HKDF, then encrypts and decrypts payloads for
//! the session's lifetime under idle and TTL supervision.
//!
//! Transport is external: the handshake rides on the consumed pairing API
//! behind [`api::PairingApi`].

pub mod api;
pub mod error;
pub mod handshake;
pub mod storage;

pub use api::{AuthorizationState, AuthorizingDevice, HttpPairingApi, PairingApi, Permission, SessionStatus};
pub use error::HandshakeError;
pub use handshake::{HandshakeConfig, SessionEvent, SessionState, WebSession};
pub use storage::{MemoryStore, SessionRecord, SessionStore};
