//! Offline-member notification seam.
//!
//! When a device disconnects, session members that are not currently
//! connected are informed through an external collaborator (push, email,
//! whatever the deployment wires in). The relay only decides *what* happened.

use async_trait::async_trait;
use tracing::info;

/// What a departure means to the session's remaining members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureKind {
    /// An executor-role device left; the session is effectively over.
    SessionEnded,
    /// A participant left; the session continues.
    MemberLeft,
}

/// External notification collaborator.
#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    /// Notify `offline_members` of `session_id` that `device_id` departed.
    async fn notify_departure(
        &self,
        session_id: &str,
        device_id: &str,
        offline_members: &[String],
        kind: DepartureKind,
    );
}

/// Default notifier that records departures in the log stream.
pub struct LoggingNotifier;

#[async_trait]
impl OfflineNotifier for LoggingNotifier {
    async fn notify_departure(
        &self,
        session_id: &str,
        device_id: &str,
        offline_members: &[String],
        kind: DepartureKind,
    ) {
        info!(
            session_id = %session_id,
            device_id = %device_id,
            offline_members = offline_members.len(),
            kind = ?kind,
            "session departure"
        );
    }
}
