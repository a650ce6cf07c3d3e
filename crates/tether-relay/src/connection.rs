//! Per-connection WebSocket loop.
//!
//! Each accepted socket runs one task. Frames are classified, control frames
//! drive auth/subscription state, and envelopes go through the router. All
//! outbound traffic (replies and routed broadcasts alike) funnels through a
//! single per-connection channel so write ordering follows processing order.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_types::relay::{ClientFrame, ControlFrame, ErrorCode, FrameError, ServerFrame};

use crate::auth::{AuthContext, DeviceTokenValidator};
use crate::registry::ConnectionRegistry;
use crate::router::SessionRouter;

/// Handle a single device connection until it closes.
pub async fn handle_connection(
    socket: WebSocket,
    registry: ConnectionRegistry,
    router: SessionRouter,
    validator: Arc<dyn DeviceTokenValidator>,
) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4();

    // Outbound channel; registered with the registry once the device
    // authenticates.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut auth: Option<AuthContext> = None;

    debug!(conn_id = %conn_id, "connection accepted");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(text) = outbound else { break };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(ctx) = &auth {
                            registry.touch_presence(&ctx.device_id).await;
                        }
                        let reply = handle_frame(
                            &registry,
                            &router,
                            validator.as_ref(),
                            conn_id,
                            &tx,
                            &mut auth,
                            &text,
                        )
                        .await;
                        if let Some(frame) = reply {
                            if tx.send(frame.to_json()).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(conn_id = %conn_id, error = %err, "websocket error");
                        break;
                    }
                }
            }
        }
    }

    if let Some(ctx) = &auth {
        registry.handle_disconnect(ctx, conn_id).await;
        info!(conn_id = %conn_id, device_id = %ctx.device_id, "device disconnected");
    } else {
        debug!(conn_id = %conn_id, "unauthenticated connection closed");
    }
}

async fn handle_frame(
    registry: &ConnectionRegistry,
    router: &SessionRouter,
    validator: &dyn DeviceTokenValidator,
    conn_id: Uuid,
    tx: &mpsc::UnboundedSender<String>,
    auth: &mut Option<AuthContext>,
    text: &str,
) -> Option<ServerFrame> {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(FrameError::InvalidJson) => {
            return Some(ServerFrame::error(ErrorCode::InvalidJson, "frame is not valid JSON"));
        }
        Err(FrameError::InvalidMessage) => {
            return Some(ServerFrame::error(
                ErrorCode::InvalidMessage,
                "frame is not a recognized message",
            ));
        }
    };

    match frame {
        ClientFrame::Control(ControlFrame::Auth {
            device_id,
            device_token,
        }) => match validator.validate(&device_id, &device_token).await {
            Ok(ctx) => {
                // Re-AUTH under a different device id retires the old
                // registration and its memberships first.
                if let Some(previous) = auth.as_ref() {
                    if previous.device_id != ctx.device_id {
                        registry.handle_disconnect(previous, conn_id).await;
                    }
                }
                registry.register_device(&ctx.device_id, conn_id, tx.clone()).await;
                info!(conn_id = %conn_id, device_id = %ctx.device_id, "device authenticated");
                let device_id = ctx.device_id.clone();
                *auth = Some(ctx);
                Some(ServerFrame::AuthSuccess { device_id })
            }
            Err(err) => {
                // The socket stays open; the device may retry AUTH.
                warn!(conn_id = %conn_id, device_id = %device_id, error = %err, "authentication failed");
                Some(ServerFrame::AuthFailure {
                    error: err.to_string(),
                })
            }
        },

        ClientFrame::Control(ControlFrame::Subscribe { session_id }) => {
            let Some(ctx) = auth.as_ref() else {
                return Some(ServerFrame::error(
                    ErrorCode::NotAuthenticated,
                    "authenticate before subscribing",
                ));
            };
            registry.subscribe(&ctx.device_id, &session_id).await;
            debug!(device_id = %ctx.device_id, session_id = %session_id, "subscribed");
            None
        }

        ClientFrame::Control(ControlFrame::Unsubscribe { session_id }) => {
            let Some(ctx) = auth.as_ref() else {
                return Some(ServerFrame::error(
                    ErrorCode::NotAuthenticated,
                    "authenticate before unsubscribing",
                ));
            };
            registry.unsubscribe(&ctx.device_id, &session_id).await;
            debug!(device_id = %ctx.device_id, session_id = %session_id, "unsubscribed");
            None
        }

        ClientFrame::Control(ControlFrame::Heartbeat) => Some(ServerFrame::HeartbeatAck),

        ClientFrame::Envelope(envelope) => router.route(auth.as_ref(), text, &envelope).await,
    }
}
