//! Sidecar IPC operations.
//!
//! Line-delimited JSON over a local socket, one operation per line, bounded
//! frame size. Every request carries a `request_id` and receives exactly one
//! ack; subscriptions additionally stream `message.v1` frames until the
//! subscription or the connection goes away.

use serde::{Deserialize, Serialize};

pub const OP_PUBLISH: &str = "publish.v1";
pub const OP_PUBLISH_ACK: &str = "publish.ack.v1";
pub const OP_OBJECT_SET: &str = "object.set.v1";
pub const OP_SUBSCRIBE: &str = "subscribe.v1";
pub const OP_SUBSCRIBE_ACK: &str = "subscribe.ack.v1";
pub const OP_MESSAGE: &str = "message.v1";

/// Default bound on a single IPC frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct OperationEnvelope {
    op: String,
}

/// `publish.v1` / `publish.ack.v1` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub op: String,
    pub request_id: String,
    pub channel: String,
    pub event: String,
    pub payload_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `object.set.v1` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSetRequest {
    pub op: String,
    pub request_id: String,
    pub channel: String,
    pub key: String,
    pub value_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `subscribe.v1` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub op: String,
    pub request_id: String,
    pub subscription_id: String,
    pub channel: String,
    /// Empty accepts every event on the channel.
    #[serde(default)]
    pub event: String,
}

/// The single ack every request receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAck {
    pub op: String,
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestAck {
    pub fn ok(op: &str, request_id: impl Into<String>) -> Self {
        Self {
            op: op.to_string(),
            request_id: request_id.into(),
            ok: true,
            error: None,
        }
    }

    pub fn failed(op: &str, request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            op: op.to_string(),
            request_id: request_id.into(),
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Asynchronous `message.v1` frame delivered for an active subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFrame {
    pub op: String,
    pub subscription_id: String,
    pub message_id: String,
    pub channel: String,
    pub event: String,
    pub payload_b64: String,
    pub received_at_ms: i64,
}

/// A parsed sidecar request.
#[derive(Debug, Clone)]
pub enum SidecarRequest {
    Publish(PublishRequest),
    PublishWithAck(PublishRequest),
    ObjectSet(ObjectSetRequest),
    Subscribe(SubscribeRequest),
}

/// Why a request line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarParseError {
    InvalidEnvelope(String),
    InvalidBody { op: String, detail: String },
    UnknownOp(String),
}

impl std::fmt::Display for SidecarParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEnvelope(detail) => write!(f, "invalid operation envelope: {detail}"),
            Self::InvalidBody { op, detail } => write!(f, "invalid {op} request: {detail}"),
            Self::UnknownOp(op) => write!(f, "unknown operation: {op}"),
        }
    }
}

impl std::error::Error for SidecarParseError {}

impl SidecarRequest {
    /// Parse one IPC line. The `op` field selects the body shape.
    pub fn parse(line: &[u8]) -> Result<Self, SidecarParseError> {
        let envelope: OperationEnvelope = serde_json::from_slice(line)
            .map_err(|err| SidecarParseError::InvalidEnvelope(err.to_string()))?;

        let body_error = |err: serde_json::Error| SidecarParseError::InvalidBody {
            op: envelope.op.clone(),
            detail: err.to_string(),
        };

        match envelope.op.as_str() {
            OP_PUBLISH => serde_json::from_slice(line)
                .map(SidecarRequest::Publish)
                .map_err(body_error),
            OP_PUBLISH_ACK => serde_json::from_slice(line)
                .map(SidecarRequest::PublishWithAck)
                .map_err(body_error),
            OP_OBJECT_SET => serde_json::from_slice(line)
                .map(SidecarRequest::ObjectSet)
                .map_err(body_error),
            OP_SUBSCRIBE => serde_json::from_slice(line)
                .map(SidecarRequest::Subscribe)
                .map_err(body_error),
            other => Err(SidecarParseError::UnknownOp(other.to_string())),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Publish(r) | Self::PublishWithAck(r) => &r.request_id,
            Self::ObjectSet(r) => &r.request_id,
            Self::Subscribe(r) => &r.request_id,
        }
    }
}
