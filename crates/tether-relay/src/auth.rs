//! Device authentication.
//!
//! Token validation itself is an external capability; the relay consumes it
//! through [`DeviceTokenValidator`]. The JWT-backed implementation covers the
//! common deployment where the web app signs device tokens with a shared
//! secret.

use async_trait::async_trait;
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

/// Role a device plays within its sessions.
///
/// When an executor disconnects, its sessions are effectively over for the
/// remaining members; a participant leaving is routine membership churn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Executor,
    Participant,
}

/// Identity attached to a connection after successful AUTH.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub device_id: String,
    pub user_id: String,
    pub device_name: String,
    pub role: DeviceRole,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid device token: {0}")]
    InvalidToken(String),

    #[error("token is not valid for device {0}")]
    DeviceMismatch(String),
}

/// External validator for device tokens.
#[async_trait]
pub trait DeviceTokenValidator: Send + Sync {
    /// Validate `token` for `device_id`, returning the device's identity.
    async fn validate(&self, device_id: &str, token: &str) -> Result<AuthContext, AuthError>;
}

/// Claims carried by a signed device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaims {
    /// Device id the token was issued to.
    pub sub: String,
    pub user_id: String,
    pub device_name: String,
    pub role: DeviceRole,
    pub exp: usize,
}

/// Validates device tokens as HS256 JWTs signed with a shared secret.
pub struct JwtDeviceValidator {
    decoding_key: DecodingKey,
}

impl JwtDeviceValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

#[async_trait]
impl DeviceTokenValidator for JwtDeviceValidator {
    async fn validate(&self, device_id: &str, token: &str) -> Result<AuthContext, AuthError> {
        let token_data = decode::<DeviceClaims>(token, &self.decoding_key, &Validation::default())
            .map_err(|err| AuthError::InvalidToken(err.to_string()))?;

        let claims = token_data.claims;
        if claims.sub != device_id {
            return Err(AuthError::DeviceMismatch(device_id.to_string()));
        }

        Ok(AuthContext {
            device_id: claims.sub,
            user_id: claims.user_id,
            device_name: claims.device_name,
            role: claims.role,
        })
    }
}
