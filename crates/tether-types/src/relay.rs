//! Relay protocol frames.
//!
//! One JSON object per WebSocket text frame. Control frames (AUTH, SUBSCRIBE,
//! UNSUBSCRIBE, HEARTBEAT) drive the connection lifecycle; everything else is
//! an [`Envelope`] that the relay forwards byte-for-byte without touching the
//! payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control frames sent by a device to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    #[serde(rename = "AUTH", rename_all = "camelCase")]
    Auth {
        device_id: String,
        device_token: String,
    },

    #[serde(rename = "SUBSCRIBE", rename_all = "camelCase")]
    Subscribe { session_id: String },

    #[serde(rename = "UNSUBSCRIBE", rename_all = "camelCase")]
    Unsubscribe { session_id: String },

    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
}

/// Which routed plane an envelope belongs to. Both are forwarded identically;
/// the distinction only matters to the devices at either end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Session,
    Control,
}

/// A routed message. The relay reads `session_id` and `sender_id` to route
/// and validate; `payload` is never inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub session_id: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque payload, typically base64 ciphertext.
    pub payload: serde_json::Value,
}

/// Everything a device can send, after classification.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Control(ControlFrame),
    Envelope(Envelope),
}

/// Why an inbound frame could not be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The frame was not valid JSON.
    InvalidJson,
    /// Valid JSON, but not a recognizable frame.
    InvalidMessage,
}

impl ClientFrame {
    /// Classify a raw text frame without consuming the payload.
    ///
    /// Control `type` values are matched first; `session`/`control` envelopes
    /// go through minimal metadata validation. Anything else is
    /// [`FrameError::InvalidMessage`].
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| FrameError::InvalidJson)?;

        let frame_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(FrameError::InvalidMessage)?;

        match frame_type {
            "AUTH" | "SUBSCRIBE" | "UNSUBSCRIBE" | "HEARTBEAT" => {
                serde_json::from_value(value)
                    .map(ClientFrame::Control)
                    .map_err(|_| FrameError::InvalidMessage)
            }
            "session" | "control" => serde_json::from_value(value)
                .map(ClientFrame::Envelope)
                .map_err(|_| FrameError::InvalidMessage),
            _ => Err(FrameError::InvalidMessage),
        }
    }
}

/// Structured error codes surfaced in `ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidJson,
    InvalidMessage,
    NotAuthenticated,
    SenderMismatch,
    NotInSession,
    InvalidAuth,
}

/// Codes carried by `DELIVERY_FAILED` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryFailureCode {
    SessionNotFound,
    DeviceOffline,
}

/// Frames sent by the relay to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "AUTH_SUCCESS", rename_all = "camelCase")]
    AuthSuccess { device_id: String },

    #[serde(rename = "AUTH_FAILURE")]
    AuthFailure { error: String },

    #[serde(rename = "HEARTBEAT_ACK")]
    HeartbeatAck,

    #[serde(rename = "ERROR")]
    Error { code: ErrorCode, message: String },

    #[serde(rename = "DELIVERY_FAILED", rename_all = "camelCase")]
    DeliveryFailed {
        code: DeliveryFailureCode,
        session_id: String,
    },

    #[serde(rename = "MEMBER_LEFT", rename_all = "camelCase")]
    MemberLeft {
        session_id: String,
        device_id: String,
    },
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> String {
        // ServerFrame contains only plain fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_auth_frame() {
        let frame =
            ClientFrame::parse(r#"{"type":"AUTH","deviceId":"dev-1","deviceToken":"tok"}"#)
                .unwrap();
        match frame {
            ClientFrame::Control(ControlFrame::Auth {
                device_id,
                device_token,
            }) => {
                assert_eq!(device_id, "dev-1");
                assert_eq!(device_token, "tok");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parse_session_envelope() {
        let text = r#"{"type":"session","sessionId":"s-1","senderId":"dev-1","timestamp":"2026-01-01T00:00:00Z","payload":"b64=="}"#;
        let frame = ClientFrame::parse(text).unwrap();
        match frame {
            ClientFrame::Envelope(env) => {
                assert_eq!(env.kind, EnvelopeKind::Session);
                assert_eq!(env.session_id, "s-1");
                assert_eq!(env.sender_id, "dev-1");
                assert_eq!(env.payload, serde_json::json!("b64=="));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_bad_json() {
        assert_eq!(
            ClientFrame::parse("{not json").unwrap_err(),
            FrameError::InvalidJson
        );
    }

    #[test]
    fn parse_rejects_unknown_type() {
        assert_eq!(
            ClientFrame::parse(r#"{"type":"NONSENSE"}"#).unwrap_err(),
            FrameError::InvalidMessage
        );
    }

    #[test]
    fn parse_rejects_envelope_missing_sender() {
        let text = r#"{"type":"session","sessionId":"s-1","timestamp":"2026-01-01T00:00:00Z","payload":""}"#;
        assert_eq!(
            ClientFrame::parse(text).unwrap_err(),
            FrameError::InvalidMessage
        );
    }

    #[test]
    fn server_frames_serialize_with_expected_tags() {
        let cases = vec![
            (
                ServerFrame::AuthSuccess {
                    device_id: "dev-1".into(),
                },
                "AUTH_SUCCESS",
            ),
            (
                ServerFrame::AuthFailure {
                    error: "bad token".into(),
                },
                "AUTH_FAILURE",
            ),
            (ServerFrame::HeartbeatAck, "HEARTBEAT_ACK"),
            (
                ServerFrame::error(ErrorCode::SenderMismatch, "spoofed sender"),
                "ERROR",
            ),
            (
                ServerFrame::DeliveryFailed {
                    code: DeliveryFailureCode::DeviceOffline,
                    session_id: "s-1".into(),
                },
                "DELIVERY_FAILED",
            ),
            (
                ServerFrame::MemberLeft {
                    session_id: "s-1".into(),
                    device_id: "dev-2".into(),
                },
                "MEMBER_LEFT",
            ),
        ];

        for (frame, tag) in cases {
            let json = frame.to_json();
            assert!(
                json.contains(&format!("\"type\":\"{tag}\"")),
                "expected tag {tag} in {json}"
            );
        }
    }

    #[test]
    fn error_codes_use_screaming_snake_case() {
        let json = ServerFrame::error(ErrorCode::NotInSession, "x").to_json();
        assert!(json.contains("\"code\":\"NOT_IN_SESSION\""));

        let json = ServerFrame::DeliveryFailed {
            code: DeliveryFailureCode::SessionNotFound,
            session_id: "s".into(),
        }
        .to_json();
        assert!(json.contains("\"code\":\"SESSION_NOT_FOUND\""));
    }

    #[test]
    fn envelope_roundtrip_preserves_payload_value() {
        let text = r#"{"type":"control","sessionId":"s","senderId":"d","timestamp":"2026-01-01T00:00:00Z","payload":{"nested":[1,2,3]}}"#;
        let frame = ClientFrame::parse(text).unwrap();
        let ClientFrame::Envelope(env) = frame else {
            panic!("expected envelope");
        };
        assert_eq!(env.payload["nested"][2], 3);
    }
}
