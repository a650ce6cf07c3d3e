//! Connection and session-membership state.
//!
//! One registry is shared by every connection task. Device channels carry
//! serialized frames; membership is derived purely from live subscriptions;
//! there is no explicit session-creation step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use tether_types::relay::ServerFrame;

use crate::auth::{AuthContext, DeviceRole};
use crate::notify::{DepartureKind, OfflineNotifier};

/// Shared relay state: who is connected, and which sessions they follow.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// device_id -> (conn_id, outbound frame channel)
    device_channels: RwLock<HashMap<String, (Uuid, mpsc::UnboundedSender<String>)>>,

    /// session_id -> member device ids
    sessions: RwLock<HashMap<String, HashSet<String>>>,

    /// device_id -> last frame seen
    presence: RwLock<HashMap<String, DateTime<Utc>>>,

    notifier: Arc<dyn OfflineNotifier>,
}

impl ConnectionRegistry {
    pub fn new(notifier: Arc<dyn OfflineNotifier>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                device_channels: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                presence: RwLock::new(HashMap::new()),
                notifier,
            }),
        }
    }

    /// Register an authenticated device's outbound channel and record
    /// presence. A newer connection for the same device replaces the old one.
    pub async fn register_device(
        &self,
        device_id: &str,
        conn_id: Uuid,
        tx: mpsc::UnboundedSender<String>,
    ) {
        self.inner
            .device_channels
            .write()
            .await
            .insert(device_id.to_string(), (conn_id, tx));
        self.touch_presence(device_id).await;
        debug!(device_id = %device_id, conn_id = %conn_id, "device registered");
    }

    /// Refresh the device's last-seen timestamp.
    pub async fn touch_presence(&self, device_id: &str) {
        self.inner
            .presence
            .write()
            .await
            .insert(device_id.to_string(), Utc::now());
    }

    /// Devices with a live connection.
    pub async fn online_devices(&self) -> Vec<String> {
        self.inner
            .device_channels
            .read()
            .await
            .keys()
            .cloned()
            .collect()
    }

    pub async fn is_online(&self, device_id: &str) -> bool {
        self.inner
            .device_channels
            .read()
            .await
            .contains_key(device_id)
    }

    /// Add the device to a session. Returns false if it was already a member.
    pub async fn subscribe(&self, device_id: &str, session_id: &str) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(device_id.to_string())
    }

    /// Remove the device from a session. No-op if it was not a member.
    pub async fn unsubscribe(&self, device_id: &str, session_id: &str) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(members) = sessions.get_mut(session_id) {
            members.remove(device_id);
            if members.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// Current members of a session; empty when the session has none.
    pub async fn session_members(&self, session_id: &str) -> Vec<String> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Send an already-serialized frame to a device. Returns whether the
    /// frame was handed to a live connection.
    pub async fn send_to_device(&self, device_id: &str, text: &str) -> bool {
        let channels = self.inner.device_channels.read().await;
        match channels.get(device_id) {
            Some((_, tx)) => tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    /// Fan a raw envelope out to every member except the sender.
    ///
    /// Returns `(delivered, other_members)`. Write failures are logged and
    /// counted as undelivered; nothing is retried at this layer.
    pub async fn broadcast_raw(&self, session_id: &str, sender_id: &str, raw: &str) -> (usize, usize) {
        let members = self.session_members(session_id).await;
        let mut delivered = 0usize;
        let mut others = 0usize;

        for member in &members {
            if member == sender_id {
                continue;
            }
            others += 1;
            if self.send_to_device(member, raw).await {
                delivered += 1;
            } else {
                warn!(
                    session_id = %session_id,
                    device_id = %member,
                    "broadcast write failed, member offline"
                );
            }
        }

        (delivered, others)
    }

    /// Tear down a closed connection.
    ///
    /// Skipped entirely when a newer connection has already taken over the
    /// device id. Otherwise: membership is removed, MEMBER_LEFT goes to each
    /// affected session's remaining members, and offline members are notified
    /// off the close path.
    pub async fn handle_disconnect(&self, ctx: &AuthContext, conn_id: Uuid) {
        let is_current = {
            let channels = self.inner.device_channels.read().await;
            channels
                .get(&ctx.device_id)
                .is_some_and(|(stored, _)| *stored == conn_id)
        };
        if !is_current {
            return;
        }

        self.inner.device_channels.write().await.remove(&ctx.device_id);
        self.inner.presence.write().await.remove(&ctx.device_id);

        // Pull the device out of every session it was following.
        let affected: Vec<String> = {
            let mut sessions = self.inner.sessions.write().await;
            let mut affected = Vec::new();
            sessions.retain(|session_id, members| {
                if members.remove(&ctx.device_id) {
                    affected.push(session_id.clone());
                }
                !members.is_empty()
            });
            affected
        };

        let kind = match ctx.role {
            DeviceRole::Executor => DepartureKind::SessionEnded,
            DeviceRole::Participant => DepartureKind::MemberLeft,
        };

        for session_id in affected {
            let frame = ServerFrame::MemberLeft {
                session_id: session_id.clone(),
                device_id: ctx.device_id.clone(),
            }
            .to_json();

            let members = self.session_members(&session_id).await;
            let mut offline = Vec::new();
            for member in members {
                if !self.send_to_device(&member, &frame).await {
                    offline.push(member);
                }
            }

            let notifier = self.inner.notifier.clone();
            let device_id = ctx.device_id.clone();
            tokio::spawn(async move {
                notifier
                    .notify_departure(&session_id, &device_id, &offline, kind)
                    .await;
            });
        }
    }
}
