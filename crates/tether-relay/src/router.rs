//! Envelope routing.
//!
//! The router validates routing metadata in a fixed order, then fans the
//! *original* frame text out to the session's other members. Payload bytes
//! are never looked at.

use tracing::debug;

use tether_types::relay::{DeliveryFailureCode, Envelope, ErrorCode, ServerFrame};

use crate::auth::AuthContext;
use crate::registry::ConnectionRegistry;

/// Routes envelopes between session members.
#[derive(Clone)]
pub struct SessionRouter {
    registry: ConnectionRegistry,
}

impl SessionRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Route one envelope. Returns the frame to send back to the sender,
    /// if any.
    ///
    /// Check order: authentication, sender identity, session existence,
    /// membership, then best-effort fan-out of `raw` to every other member.
    pub async fn route(
        &self,
        auth: Option<&AuthContext>,
        raw: &str,
        envelope: &Envelope,
    ) -> Option<ServerFrame> {
        let Some(ctx) = auth else {
            return Some(ServerFrame::error(
                ErrorCode::NotAuthenticated,
                "authenticate before sending envelopes",
            ));
        };

        // A connection may only route envelopes under its own device id.
        if envelope.sender_id != ctx.device_id {
            return Some(ServerFrame::error(
                ErrorCode::SenderMismatch,
                format!("senderId does not match connection device {}", ctx.device_id),
            ));
        }

        let members = self.registry.session_members(&envelope.session_id).await;
        if members.is_empty() {
            return Some(ServerFrame::DeliveryFailed {
                code: DeliveryFailureCode::SessionNotFound,
                session_id: envelope.session_id.clone(),
            });
        }

        if !members.iter().any(|member| member == &ctx.device_id) {
            return Some(ServerFrame::error(
                ErrorCode::NotInSession,
                format!("device is not a member of session {}", envelope.session_id),
            ));
        }

        let (delivered, others) = self
            .registry
            .broadcast_raw(&envelope.session_id, &ctx.device_id, raw)
            .await;

        debug!(
            session_id = %envelope.session_id,
            sender_id = %ctx.device_id,
            delivered,
            others,
            "routed envelope"
        );

        if delivered == 0 && others > 0 {
            return Some(ServerFrame::DeliveryFailed {
                code: DeliveryFailureCode::DeviceOffline,
                session_id: envelope.session_id.clone(),
            });
        }

        None
    }
}
