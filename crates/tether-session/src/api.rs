//! Consumed web-session HTTP surface.
//!
//! The handshake never owns transport; it talks to the session API through
//! [`PairingApi`]. The reqwest-backed implementation covers the real
//! deployment; tests substitute their own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("session API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("session API returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("session API returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Permission level granted to the web session by the authorizing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Observer,
    Operator,
}

/// Remote authorization state reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationState {
    Pending,
    Active,
    Expired,
    Revoked,
}

/// Device that approved the session, when known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizingDevice {
    pub device_id: String,
    pub device_name: String,
}

/// `POST init` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub session_id: String,
    pub session_token: String,
    /// Out-of-band pairing payload (QR content etc.).
    pub bootstrap_payload: String,
    pub expires_at: DateTime<Utc>,
}

/// `GET status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub status: AuthorizationState,
    /// Base64 `nonce ‖ ciphertext` blob holding the session key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_session_key: Option<String>,
    /// Base64 X25519 public key of the responder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_ttl_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorizing_device: Option<AuthorizingDevice>,
}

/// External session-creation/status/teardown API.
#[async_trait]
pub trait PairingApi: Send + Sync {
    /// Register the ephemeral public key, creating a pending session.
    async fn create_session(&self, public_key_b64: &str) -> Result<InitResponse, ApiError>;

    async fn fetch_status(
        &self,
        session_id: &str,
        session_token: &str,
    ) -> Result<SessionStatus, ApiError>;

    /// Report activity so the server can extend idle bookkeeping.
    async fn touch(&self, session_id: &str, session_token: &str) -> Result<(), ApiError>;

    /// Delete the session server-side.
    async fn revoke(
        &self,
        session_id: &str,
        session_token: &str,
        reason: &str,
    ) -> Result<(), ApiError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    public_key: &'a str,
}

#[derive(Debug, Serialize)]
struct RevokeRequest<'a> {
    reason: &'a str,
}

/// reqwest-backed [`PairingApi`].
pub struct HttpPairingApi {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpPairingApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http_client: reqwest::Client::new(),
        }
    }

    fn session_url(&self, suffix: &str) -> String {
        format!("{}/api/v1/web-sessions{}", self.base_url, suffix)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }
}

#[async_trait]
impl PairingApi for HttpPairingApi {
    async fn create_session(&self, public_key_b64: &str) -> Result<InitResponse, ApiError> {
        let response = self
            .http_client
            .post(self.session_url(""))
            .json(&CreateSessionRequest {
                public_key: public_key_b64,
            })
            .send()
            .await?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| ApiError::InvalidResponse(err.to_string()))
    }

    async fn fetch_status(
        &self,
        session_id: &str,
        session_token: &str,
    ) -> Result<SessionStatus, ApiError> {
        let response = self
            .http_client
            .get(self.session_url(&format!("/{session_id}/status")))
            .bearer_auth(session_token)
            .send()
            .await?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| ApiError::InvalidResponse(err.to_string()))
    }

    async fn touch(&self, session_id: &str, session_token: &str) -> Result<(), ApiError> {
        let response = self
            .http_client
            .patch(self.session_url(&format!("/{session_id}/touch")))
            .bearer_auth(session_token)
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn revoke(
        &self,
        session_id: &str,
        session_token: &str,
        reason: &str,
    ) -> Result<(), ApiError> {
        let response = self
            .http_client
            .delete(self.session_url(&format!("/{session_id}")))
            .bearer_auth(session_token)
            .json(&RevokeRequest { reason })
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }
}
