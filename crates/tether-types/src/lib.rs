//! Shared wire types for the Tether relay, sidecar IPC, and token broker.
//!
//! Three protocol surfaces live here:
//! - [`relay`]: JSON frames exchanged over the persistent device socket.
//! - [`sidecar`]: line-delimited JSON operations on the local sidecar socket.
//! - [`broker`]: the one-shot token broker request/response exchange.
//!
//! None of these types ever interpret an envelope payload: routing metadata
//! only. Payload bytes travel as opaque base64 or raw JSON values.

pub mod broker;
pub mod relay;
pub mod sidecar;
