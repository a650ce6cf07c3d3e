//! Sidecar pub/sub clients and their local plumbing.
//!
//! Two clients move opaque payloads through the external pub/sub backbone:
//! a retrying [`publisher::SideEffectPublisher`] and a backpressured,
//! one-in-flight [`consumer::CommandConsumer`]. Both obtain short-lived,
//! audience-scoped credentials from the local token broker; there is no
//! long-lived backbone secret in a sidecar process, and no unauthenticated
//! fallback.
//!
//! The daemon talks to a sidecar over the line-delimited JSON IPC surface in
//! [`ipc`].

pub mod backbone;
pub mod broker;
pub mod consumer;
pub mod effect;
pub mod error;
pub mod ipc;
pub mod publisher;

pub use backbone::{Backbone, BackboneChannel, InboundMessage, MessageHandler};
pub use broker::{BrokerClient, CredentialIssuer, CredentialSource, TokenBrokerRuntime, start_token_broker};
pub use consumer::{CommandConsumer, ConsumedMessage, ConsumerConfig};
pub use effect::SideEffect;
pub use error::SidecarError;
pub use ipc::{BackboneManager, IpcServerRuntime, MessageSink, SidecarManager, start_ipc_server};
pub use publisher::{PublisherConfig, SideEffectPublisher};
