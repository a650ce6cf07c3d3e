//! Sidecar error taxonomy.

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("not connected to backbone")]
    NotConnected,

    #[error("client closed")]
    Closed,

    #[error("event name is required")]
    InvalidEvent,

    #[error("channel name is required")]
    InvalidChannel,

    /// Retries exhausted. Terminal to the publish call only; the publisher
    /// stays usable.
    #[error("publish failed after {attempts} attempts: {source}")]
    PublishFailed {
        attempts: u32,
        #[source]
        source: Box<SidecarError>,
    },

    /// No credential obtained. Terminal: callers must never fall back to an
    /// unauthenticated connection attempt.
    #[error("broker rejected token request: {0}")]
    BrokerRejected(String),

    #[error("backbone error: {0}")]
    Backbone(String),

    #[error("operation timed out")]
    Timeout,

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SidecarResult<T> = Result<T, SidecarError>;
