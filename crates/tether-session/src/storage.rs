//! Scoped persistence for handshake state.
//!
//! A session survives page reloads / process restarts through whatever store
//! the host wires in. Key material is kept base64-encoded, matching how it
//! travels on the wire.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted handshake fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub session_token: String,
    /// Base64 X25519 private key.
    pub private_key: String,
    pub expires_at: DateTime<Utc>,
    /// Base64 symmetric session key, present once authorized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Storage seam for the handshake.
pub trait SessionStore: Send + Sync {
    fn save(&self, record: &SessionRecord) -> Result<(), String>;
    fn load(&self) -> Result<Option<SessionRecord>, String>;
    fn clear(&self) -> Result<(), String>;
}

/// In-memory store, used in tests and short-lived embedders.
#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<Option<SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, record: &SessionRecord) -> Result<(), String> {
        *self.record.lock().map_err(|e| e.to_string())? = Some(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionRecord>, String> {
        Ok(self.record.lock().map_err(|e| e.to_string())?.clone())
    }

    fn clear(&self) -> Result<(), String> {
        *self.record.lock().map_err(|e| e.to_string())? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip_and_clear() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());

        let record = SessionRecord {
            session_id: "s-1".into(),
            session_token: "tok".into(),
            private_key: "cHJpdg==".into(),
            expires_at: Utc::now(),
            session_key: None,
        };
        store.save(&record).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), record);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn record_serializes_without_absent_session_key() {
        let record = SessionRecord {
            session_id: "s-1".into(),
            session_token: "tok".into(),
            private_key: "cHJpdg==".into(),
            expires_at: "2026-01-01T00:00:00Z".parse().unwrap(),
            session_key: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("sessionKey"));
        assert!(json.contains("\"sessionId\":\"s-1\""));
    }
}
