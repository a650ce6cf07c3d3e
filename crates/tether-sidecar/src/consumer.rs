//! Backpressured command consumer.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tether_types::broker::BrokerAudience;

use crate::backbone::{Backbone, BackboneChannel};
use crate::broker::CredentialSource;
use crate::error::{SidecarError, SidecarResult};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Device-scoped channel to attach to.
    pub channel: String,
    /// Event name to accept. Empty accepts every event; anything else drops
    /// non-matching events before they touch the queue.
    pub command_event: String,
    /// Output queue capacity. The default of 1 is the one-in-flight
    /// contract: at most one command is buffered ahead of the caller.
    pub queue_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            channel: String::new(),
            command_event: String::new(),
            queue_capacity: 1,
        }
    }
}

/// A command received from the backbone, normalized to id + opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Subscribes to one device-scoped channel and feeds a bounded queue.
///
/// The delivery path blocks while the queue slot is occupied; the backbone's
/// per-channel ordering does the rest. Credentials come from the token
/// broker per connect attempt; the consumer never holds a long-lived
/// secret.
pub struct CommandConsumer {
    backbone: Arc<dyn Backbone>,
    credentials: Arc<dyn CredentialSource>,
    config: ConsumerConfig,
    queue_tx: StdMutex<Option<mpsc::Sender<ConsumedMessage>>>,
    queue_rx: StdMutex<Option<mpsc::Receiver<ConsumedMessage>>>,
    channel: Mutex<Option<Arc<dyn BackboneChannel>>>,
    closed: CancellationToken,
}

impl CommandConsumer {
    pub fn new(
        backbone: Arc<dyn Backbone>,
        credentials: Arc<dyn CredentialSource>,
        config: ConsumerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            backbone,
            credentials,
            config,
            queue_tx: StdMutex::new(Some(tx)),
            queue_rx: StdMutex::new(Some(rx)),
            channel: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Take the output queue. Yields `None` once the consumer is closed and
    /// drained.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<ConsumedMessage>> {
        self.queue_rx.lock().expect("queue lock poisoned").take()
    }

    /// Exchange the broker token for a credential, attach to the configured
    /// channel, and subscribe to all its events.
    pub async fn connect(&self) -> SidecarResult<()> {
        if self.closed.is_cancelled() {
            return Err(SidecarError::Closed);
        }

        info!(channel = %self.config.channel, "connecting consumer to backbone");
        let credential = self
            .credentials
            .credential(BrokerAudience::CommandConsumer)
            .await?;
        self.backbone.connect(&credential).await?;

        let handle = self.backbone.channel(&self.config.channel).await?;

        let tx = self
            .queue_tx
            .lock()
            .expect("queue lock poisoned")
            .clone()
            .ok_or(SidecarError::Closed)?;
        let closed = self.closed.clone();
        let command_event = self.config.command_event.clone();

        handle
            .subscribe_all(Box::new(move |message| {
                let tx = tx.clone();
                let closed = closed.clone();
                let command_event = command_event.clone();
                Box::pin(async move {
                    if !command_event.is_empty() && message.event != command_event {
                        debug!(
                            id = %message.message_id,
                            event = %message.event,
                            expected_event = %command_event,
                            "skipping non-command event"
                        );
                        return;
                    }

                    let delivered = ConsumedMessage {
                        id: message.message_id,
                        payload: message.payload,
                    };

                    // Blocks while the queue slot is occupied; a close
                    // interrupts the wait.
                    tokio::select! {
                        _ = closed.cancelled() => {}
                        result = tx.send(delivered) => { let _ = result; }
                    }
                })
            }))
            .await?;

        *self.channel.lock().await = Some(handle);
        info!(channel = %self.config.channel, "consumer subscribed");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && self.channel.lock().await.is_some()
    }

    /// Idempotent shutdown: interrupts any blocked push, detaches the
    /// channel, and closes the output queue exactly once.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        info!("closing consumer");

        if let Some(handle) = self.channel.lock().await.take() {
            handle.detach().await;
        }
        self.backbone.close().await;

        let _ = self.queue_tx.lock().expect("queue lock poisoned").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::testing::{MemoryBackbone, RejectingCredentials, StaticCredentials};
    use std::time::Duration;

    fn consumer_with(backbone: &MemoryBackbone, command_event: &str) -> CommandConsumer {
        CommandConsumer::new(
            Arc::new(backbone.clone()),
            Arc::new(StaticCredentials),
            ConsumerConfig {
                channel: "commands:dev-1".into(),
                command_event: command_event.into(),
                queue_capacity: 1,
            },
        )
    }

    #[tokio::test]
    async fn broker_rejection_is_terminal() {
        let backbone = MemoryBackbone::new();
        let consumer = CommandConsumer::new(
            Arc::new(backbone.clone()),
            Arc::new(RejectingCredentials),
            ConsumerConfig::default(),
        );

        let err = consumer.connect().await.unwrap_err();
        assert!(matches!(err, SidecarError::BrokerRejected(_)));
        assert!(backbone.connect_credentials().is_empty());
    }

    #[tokio::test]
    async fn matching_events_reach_the_queue() {
        let backbone = MemoryBackbone::new();
        let consumer = consumer_with(&backbone, "command");
        let mut messages = consumer.take_messages().unwrap();
        consumer.connect().await.unwrap();

        backbone.deliver("commands:dev-1", "command", b"encrypted-1").await;

        let message = messages.recv().await.unwrap();
        assert_eq!(message.payload, b"encrypted-1");
        assert!(!message.id.is_empty());
    }

    #[tokio::test]
    async fn non_matching_events_are_dropped_silently() {
        let backbone = MemoryBackbone::new();
        let consumer = consumer_with(&backbone, "command");
        let mut messages = consumer.take_messages().unwrap();
        consumer.connect().await.unwrap();

        backbone.deliver("commands:dev-1", "presence", b"noise").await;
        backbone.deliver("commands:dev-1", "command", b"real").await;

        // Only the command arrives; the presence event never took the slot.
        assert_eq!(messages.recv().await.unwrap().payload, b"real");
        assert!(messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_event_filter_accepts_everything() {
        let backbone = MemoryBackbone::new();
        let consumer = consumer_with(&backbone, "");
        let mut messages = consumer.take_messages().unwrap();
        consumer.connect().await.unwrap();

        backbone.deliver("commands:dev-1", "anything", b"payload").await;
        assert_eq!(messages.recv().await.unwrap().payload, b"payload");
    }

    #[tokio::test]
    async fn second_delivery_blocks_until_queue_drains() {
        let backbone = MemoryBackbone::new();
        let consumer = consumer_with(&backbone, "command");
        let mut messages = consumer.take_messages().unwrap();
        consumer.connect().await.unwrap();

        backbone.deliver("commands:dev-1", "command", b"first").await;

        let blocked = {
            let backbone = backbone.clone();
            tokio::spawn(async move {
                backbone.deliver("commands:dev-1", "command", b"second").await;
            })
        };

        // The slot is occupied, so the second delivery must still be parked.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(messages.recv().await.unwrap().payload, b"first");
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("second delivery never unblocked")
            .unwrap();
        assert_eq!(messages.recv().await.unwrap().payload, b"second");
    }

    #[tokio::test]
    async fn close_interrupts_blocked_push_and_closes_queue() {
        let backbone = MemoryBackbone::new();
        let consumer = consumer_with(&backbone, "command");
        let mut messages = consumer.take_messages().unwrap();
        consumer.connect().await.unwrap();

        backbone.deliver("commands:dev-1", "command", b"first").await;
        let blocked = {
            let backbone = backbone.clone();
            tokio::spawn(async move {
                backbone.deliver("commands:dev-1", "command", b"second").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        consumer.close().await;
        consumer.close().await; // idempotent

        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("blocked push never interrupted")
            .unwrap();

        // The buffered message drains, then the queue reports closed.
        assert_eq!(messages.recv().await.unwrap().payload, b"first");
        assert!(messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_after_close_fails() {
        let backbone = MemoryBackbone::new();
        let consumer = consumer_with(&backbone, "command");
        consumer.close().await;
        assert!(matches!(
            consumer.connect().await.unwrap_err(),
            SidecarError::Closed
        ));
    }
}
