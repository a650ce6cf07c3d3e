//! Retrying side-effect publisher.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_types::broker::BrokerAudience;

use crate::backbone::{Backbone, BackboneChannel};
use crate::broker::CredentialSource;
use crate::effect::SideEffect;
use crate::error::{SidecarError, SidecarResult};

/// Attempts per publish call.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Channel used when the effect carries no override.
    pub default_channel: String,
    /// Bound on each publish attempt.
    pub publish_timeout: Duration,
    /// Delay between attempts.
    pub retry_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            default_channel: String::new(),
            publish_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Publishes side-effects to the backbone, retrying transient failures.
///
/// `publish` is safe to call concurrently; `close` may race in-flight
/// publishes, which then observe [`SidecarError::Closed`].
pub struct SideEffectPublisher {
    backbone: Arc<dyn Backbone>,
    credentials: Arc<dyn CredentialSource>,
    config: PublisherConfig,
    /// Channel handles cached per name under a single lock.
    channels: Mutex<HashMap<String, Arc<dyn BackboneChannel>>>,
    connected: AtomicBool,
    closed: CancellationToken,
}

impl SideEffectPublisher {
    pub fn new(
        backbone: Arc<dyn Backbone>,
        credentials: Arc<dyn CredentialSource>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            backbone,
            credentials,
            config,
            channels: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Obtain a credential from the broker and establish the backbone
    /// connection. Blocks until connected or failed.
    pub async fn connect(&self) -> SidecarResult<()> {
        if self.closed.is_cancelled() {
            return Err(SidecarError::Closed);
        }

        info!(channel = %self.config.default_channel, "connecting publisher to backbone");
        let credential = self
            .credentials
            .credential(BrokerAudience::EffectPublisher)
            .await?;
        self.backbone.connect(&credential).await?;
        self.connected.store(true, Ordering::SeqCst);

        info!(client_id = %credential.client_id, "publisher connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    /// Publish a side-effect.
    ///
    /// Channel and event resolve from the effect's overrides, falling back
    /// to the default channel and the effect's type name; the body is the
    /// effect's payload when present, else the serialized effect itself.
    pub async fn publish(&self, effect: &SideEffect) -> SidecarResult<()> {
        let event = if effect.event.is_empty() {
            effect.effect_type.clone()
        } else {
            effect.event.clone()
        };

        let channel = if effect.channel.is_empty() {
            self.config.default_channel.clone()
        } else {
            effect.channel.clone()
        };

        let payload = match &effect.payload {
            Some(value) => serde_json::to_vec(value)?,
            None => serde_json::to_vec(effect)?,
        };

        debug!(
            channel = %channel,
            event = %event,
            session_id = %effect.session_id,
            payload_len = payload.len(),
            "publishing side-effect"
        );
        self.publish_raw(&channel, &event, &payload).await
    }

    /// Publish an opaque payload directly to a channel/event pair.
    pub async fn publish_raw(&self, channel: &str, event: &str, payload: &[u8]) -> SidecarResult<()> {
        if channel.is_empty() {
            return Err(SidecarError::InvalidChannel);
        }
        if event.is_empty() {
            return Err(SidecarError::InvalidEvent);
        }

        let handle = self.channel_handle(channel).await?;

        let mut last_error: Option<SidecarError> = None;
        for attempt in 1..=MAX_RETRIES {
            let result =
                tokio::time::timeout(self.config.publish_timeout, handle.publish(event, payload))
                    .await;

            match result {
                Ok(Ok(())) => {
                    debug!(channel = %channel, event = %event, attempt, "publish successful");
                    return Ok(());
                }
                Ok(Err(err)) => last_error = Some(err),
                Err(_) => last_error = Some(SidecarError::Timeout),
            }

            warn!(
                channel = %channel,
                event = %event,
                attempt,
                error = %last_error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "publish attempt failed"
            );

            if attempt < MAX_RETRIES {
                // The inter-attempt delay loses to the close signal; caller
                // cancellation simply drops this future.
                tokio::select! {
                    _ = self.closed.cancelled() => return Err(SidecarError::Closed),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }
        }

        error!(
            channel = %channel,
            event = %event,
            max_retries = MAX_RETRIES,
            "publish failed after retries"
        );
        Err(SidecarError::PublishFailed {
            attempts: MAX_RETRIES,
            source: Box::new(last_error.unwrap_or(SidecarError::NotConnected)),
        })
    }

    async fn channel_handle(&self, name: &str) -> SidecarResult<Arc<dyn BackboneChannel>> {
        if self.closed.is_cancelled() {
            return Err(SidecarError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SidecarError::NotConnected);
        }

        let mut channels = self.channels.lock().await;
        if let Some(handle) = channels.get(name) {
            return Ok(handle.clone());
        }
        let handle = self.backbone.channel(name).await?;
        channels.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Idempotent shutdown: unblocks pending retry delays and releases the
    /// connection. Later publishes fail with [`SidecarError::Closed`].
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.connected.store(false, Ordering::SeqCst);
        info!("closing publisher");
        self.backbone.close().await;
    }
}
