//! Side-effect envelope published to the backbone.

use serde::{Deserialize, Serialize};

/// A side-effect emitted by the daemon for real-time sync to other devices.
///
/// `channel` and `event` override the publisher's defaults when present;
/// `payload` replaces the serialized envelope as the published body. The
/// publisher never interprets the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideEffect {
    #[serde(rename = "type")]
    pub effect_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
}

impl SideEffect {
    pub fn new(effect_type: impl Into<String>) -> Self {
        Self {
            effect_type: effect_type.into(),
            ..Self::default()
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_omits_empty_overrides() {
        let effect = SideEffect::new("message_appended").with_session("s-1");
        let json = serde_json::to_string(&effect).unwrap();
        assert!(json.contains("\"type\":\"message_appended\""));
        assert!(json.contains("\"session_id\":\"s-1\""));
        assert!(!json.contains("channel"));
        assert!(!json.contains("payload"));
    }

    #[test]
    fn overrides_roundtrip() {
        let effect = SideEffect::new("session_updated")
            .with_channel("effects:u1")
            .with_event("custom_event")
            .with_payload(serde_json::json!({"k": "v"}));
        let parsed: SideEffect =
            serde_json::from_str(&serde_json::to_string(&effect).unwrap()).unwrap();
        assert_eq!(parsed.channel, "effects:u1");
        assert_eq!(parsed.event, "custom_event");
        assert_eq!(parsed.payload.unwrap()["k"], "v");
    }
}
