//! Token broker IPC types.
//!
//! A sidecar client writes one [`BrokerTokenRequest`] to the broker socket,
//! half-closes, and reads one [`BrokerTokenResponse`] back. Any `ok: false`
//! or malformed response is terminal for the caller.

use serde::{Deserialize, Serialize};

/// Which sidecar role a credential is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerAudience {
    EffectPublisher,
    CommandConsumer,
}

impl BrokerAudience {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EffectPublisher => "effect_publisher",
            Self::CommandConsumer => "command_consumer",
        }
    }
}

/// Request written by a sidecar client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTokenRequest {
    pub broker_token: String,
    pub audience: BrokerAudience,
    pub device_id: String,
}

/// Short-lived backbone credential issued per connect attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerCredential {
    pub token: String,
    /// Expiry as unix millis.
    pub expires: i64,
    #[serde(rename = "clientId")]
    pub client_id: String,
    /// Issue time as unix millis.
    pub issued: i64,
    /// Serialized capability grant, audience-scoped.
    pub capability: String,
}

/// Response written by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTokenResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_details: Option<BrokerCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BrokerTokenResponse {
    pub fn granted(credential: BrokerCredential) -> Self {
        Self {
            ok: true,
            token_details: Some(credential),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            token_details: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_snake_case_fields() {
        let request = BrokerTokenRequest {
            broker_token: "bt".into(),
            audience: BrokerAudience::EffectPublisher,
            device_id: "6f5db7f9-c6ef-4d60-88f8-39f62f272f07".into(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"broker_token\":\"bt\""));
        assert!(json.contains("\"audience\":\"effect_publisher\""));
        assert!(json.contains("\"device_id\""));
    }

    #[test]
    fn credential_preserves_client_id_casing() {
        let credential = BrokerCredential {
            token: "tok".into(),
            expires: 2_000,
            client_id: "user-1".into(),
            issued: 1_000,
            capability: r#"{"effects:*":["publish"]}"#.into(),
        };
        let json = serde_json::to_string(&credential).unwrap();
        assert!(json.contains("\"clientId\":\"user-1\""));

        let parsed: BrokerCredential = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, credential);
    }

    #[test]
    fn rejected_response_omits_token_details() {
        let json =
            serde_json::to_string(&BrokerTokenResponse::rejected("invalid broker token")).unwrap();
        assert!(!json.contains("token_details"));
        assert!(json.contains("\"ok\":false"));

        let parsed: BrokerTokenResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("invalid broker token"));
    }
}
