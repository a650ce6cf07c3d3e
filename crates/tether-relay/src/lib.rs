//! Crypto-blind session relay.
//!
//! Devices authenticate over a persistent WebSocket, subscribe to sessions,
//! and exchange opaque envelopes. The relay inspects routing metadata only;
//! payload bytes are forwarded exactly as received.
//!
//! Delivery is best-effort, at-most-once per connected member: there is no
//! replay, ack, or ordering guarantee across reconnects, and no ordering
//! across senders beyond the transport's own per-connection write order.

pub mod auth;
pub mod connection;
pub mod notify;
pub mod registry;
pub mod router;

pub use auth::{AuthContext, DeviceRole, DeviceTokenValidator, JwtDeviceValidator};
pub use notify::{DepartureKind, LoggingNotifier, OfflineNotifier};
pub use registry::ConnectionRegistry;
pub use router::SessionRouter;
