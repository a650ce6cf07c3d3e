//! Backbone transport seam.
//!
//! The real pub/sub backbone is an external service; sidecar clients only
//! depend on these traits. Each [`Backbone::channel`] call returns an
//! independent handle: handles attach and detach without affecting each
//! other, and the publisher caches its own handles per channel name.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;

use tether_types::broker::BrokerCredential;

use crate::error::SidecarResult;

/// A message delivered by the backbone to a subscribed handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub channel: String,
    pub event: String,
    pub payload: Vec<u8>,
    pub received_at_ms: i64,
}

/// Delivery callback. The backbone awaits each invocation before delivering
/// the next message on the channel, which is what lets a slow handler apply
/// backpressure.
pub type MessageHandler = Box<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// The underlying pub/sub transport.
#[async_trait]
pub trait Backbone: Send + Sync {
    /// Establish the connection with a broker-issued credential. Blocks
    /// until connected or failed.
    async fn connect(&self, credential: &BrokerCredential) -> SidecarResult<()>;

    /// Obtain a fresh handle to a named channel.
    async fn channel(&self, name: &str) -> SidecarResult<Arc<dyn BackboneChannel>>;

    /// Release the connection.
    async fn close(&self);
}

/// One attached handle to a backbone channel.
#[async_trait]
pub trait BackboneChannel: Send + Sync {
    async fn publish(&self, event: &str, payload: &[u8]) -> SidecarResult<()>;

    /// Subscribe this handle to every event on the channel.
    async fn subscribe_all(&self, handler: MessageHandler) -> SidecarResult<()>;

    /// Drop this handle's subscriptions.
    async fn detach(&self);
}
