//! Session handshake state machine.
//!
//! State flow: `Idle → WaitingForAuth → Authorized → {IdleTimeout | Expired |
//! Error}`, with `Revoked` reachable from any non-terminal state via
//! [`WebSession::revoke`]. A session object runs one handshake attempt; the
//! authorization poll loop and every timer race the session's cancellation
//! token.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_crypto::{CryptoError, encrypt, keys};

use crate::api::{AuthorizationState, AuthorizingDevice, PairingApi, Permission, SessionStatus};
use crate::error::{HandshakeError, HandshakeResult};
use crate::storage::{SessionRecord, SessionStore};

/// Handshake tuning knobs.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Delay between authorization status polls.
    pub poll_interval: Duration,
    /// Poll attempts before the handshake fails with AuthorizationTimeout.
    pub max_poll_attempts: u32,
    /// Period of the idle monitor.
    pub idle_check_interval: Duration,
    /// Idle window applied when the status endpoint does not supply one.
    pub default_max_idle_seconds: u64,
    /// How far before expiry the pre-warning fires (capped at half the TTL).
    pub expiry_warning_lead: Duration,
    /// Minimum spacing between remote touch calls from record_activity.
    pub touch_min_interval: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 150,
            idle_check_interval: Duration::from_secs(30),
            default_max_idle_seconds: 900,
            expiry_warning_lead: Duration::from_secs(300),
            touch_min_interval: Duration::from_secs(60),
        }
    }
}

/// Observable session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WaitingForAuth,
    Authorized,
    IdleTimeout,
    Expired,
    Revoked,
    Error,
}

impl SessionState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::IdleTimeout | Self::Expired | Self::Revoked | Self::Error
        )
    }
}

/// Events emitted on the session's broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Authorized,
    ExpiryWarning,
    IdleTimeout,
    Revoked,
}

/// Returned by [`WebSession::init`] for out-of-band device pairing.
#[derive(Debug, Clone)]
pub struct SessionBootstrap {
    pub session_id: String,
    pub bootstrap_payload: String,
    pub expires_at: DateTime<Utc>,
}

struct SessionInner {
    state: SessionState,
    session_id: Option<String>,
    session_token: Option<String>,
    private_key: Option<[u8; keys::KEY_SIZE]>,
    session_key: Option<[u8; keys::KEY_SIZE]>,
    expires_at: Option<DateTime<Utc>>,
    max_idle_seconds: Option<u64>,
    last_activity: DateTime<Utc>,
    idle_expires_at: Option<DateTime<Utc>>,
    permission: Option<Permission>,
    authorizing_device: Option<AuthorizingDevice>,
    last_touch: Option<DateTime<Utc>>,
    idle_task: Option<JoinHandle<()>>,
    warning_task: Option<JoinHandle<()>>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            session_token: None,
            private_key: None,
            session_key: None,
            expires_at: None,
            max_idle_seconds: None,
            last_activity: Utc::now(),
            idle_expires_at: None,
            permission: None,
            authorizing_device: None,
            last_touch: None,
            idle_task: None,
            warning_task: None,
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(task) = self.idle_task.take() {
            task.abort();
        }
        if let Some(task) = self.warning_task.take() {
            task.abort();
        }
    }
}

/// One web session's handshake and key lifecycle.
pub struct WebSession {
    config: HandshakeConfig,
    api: Arc<dyn PairingApi>,
    store: Arc<dyn SessionStore>,
    inner: Mutex<SessionInner>,
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
}

impl WebSession {
    pub fn new(
        api: Arc<dyn PairingApi>,
        store: Arc<dyn SessionStore>,
        config: HandshakeConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            config,
            api,
            store,
            inner: Mutex::new(SessionInner::new()),
            cancel: CancellationToken::new(),
            events,
        })
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn permission(&self) -> Option<Permission> {
        self.lock().permission
    }

    pub fn authorizing_device(&self) -> Option<AuthorizingDevice> {
        self.lock().authorizing_device.clone()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock().expires_at
    }

    pub fn idle_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock().idle_expires_at
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Cancel any in-flight poll loop or blocking wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Generate the ephemeral keypair, register it with the pairing API, and
    /// persist the pending session. Returns the out-of-band bootstrap data.
    pub async fn init(self: &Arc<Self>) -> HandshakeResult<SessionBootstrap> {
        {
            let inner = self.lock();
            if inner.state != SessionState::Idle {
                return Err(HandshakeError::InvalidState(format!(
                    "init is only valid from Idle, session is {:?}",
                    inner.state
                )));
            }
        }

        let (private_key, public_key) = keys::generate_keypair();
        let response = self
            .api
            .create_session(&keys::key_to_base64(&public_key))
            .await?;

        let record = SessionRecord {
            session_id: response.session_id.clone(),
            session_token: response.session_token.clone(),
            private_key: keys::key_to_base64(&private_key),
            expires_at: response.expires_at,
            session_key: None,
        };
        self.store.save(&record).map_err(HandshakeError::Storage)?;

        {
            let mut inner = self.lock();
            inner.state = SessionState::WaitingForAuth;
            inner.session_id = Some(response.session_id.clone());
            inner.session_token = Some(response.session_token);
            inner.private_key = Some(private_key);
            inner.expires_at = Some(response.expires_at);
        }

        info!(session_id = %response.session_id, "web session initialized");
        Ok(SessionBootstrap {
            session_id: response.session_id,
            bootstrap_payload: response.bootstrap_payload,
            expires_at: response.expires_at,
        })
    }

    /// Poll the status endpoint until the session is authorized, fails, or
    /// the attempt limit runs out. Cancellable at every iteration.
    pub async fn wait_for_authorization(self: &Arc<Self>) -> HandshakeResult<()> {
        let (session_id, session_token) = self.credentials()?;

        for attempt in 1..=self.config.max_poll_attempts {
            if self.cancel.is_cancelled() {
                return Err(HandshakeError::Cancelled);
            }

            match self.api.fetch_status(&session_id, &session_token).await {
                Ok(status) => match status.status {
                    AuthorizationState::Pending => {
                        debug!(session_id = %session_id, attempt, "authorization pending");
                    }
                    AuthorizationState::Active => {
                        self.handle_authorization(status).await?;
                        return Ok(());
                    }
                    AuthorizationState::Expired => {
                        self.set_state(SessionState::Expired);
                        return Err(HandshakeError::SessionExpired);
                    }
                    AuthorizationState::Revoked => {
                        self.set_state(SessionState::Revoked);
                        return Err(HandshakeError::SessionRevoked);
                    }
                },
                // Transient API failures spend an attempt and keep polling.
                Err(err) => {
                    warn!(session_id = %session_id, attempt, error = %err, "status poll failed");
                }
            }

            if attempt < self.config.max_poll_attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(HandshakeError::Cancelled),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        self.set_state(SessionState::Error);
        Err(HandshakeError::AuthorizationTimeout {
            attempts: self.config.max_poll_attempts,
        })
    }

    /// Derive the session key from an `active` status and move to Authorized.
    pub async fn handle_authorization(self: &Arc<Self>, status: SessionStatus) -> HandshakeResult<()> {
        let sealed_b64 = status
            .encrypted_session_key
            .as_deref()
            .ok_or(HandshakeError::MissingKeyMaterial)?;
        let responder_b64 = status
            .responder_public_key
            .as_deref()
            .ok_or(HandshakeError::MissingKeyMaterial)?;

        let (session_id, private_key) = {
            let inner = self.lock();
            let session_id = inner
                .session_id
                .clone()
                .ok_or_else(|| HandshakeError::InvalidState("no session id".into()))?;
            let private_key = inner
                .private_key
                .ok_or_else(|| HandshakeError::InvalidState("no ephemeral private key".into()))?;
            (session_id, private_key)
        };

        let responder_public = keys::key_from_base64(responder_b64)?;
        let shared = keys::shared_secret(&private_key, &responder_public);
        let derived = encrypt::derive_session_key(&shared, &session_id)?;

        let sealed = BASE64
            .decode(sealed_b64)
            .map_err(|err| HandshakeError::Crypto(CryptoError::InvalidKey(err.to_string())))?;
        let session_key_bytes = match encrypt::open(&derived, &sealed) {
            Ok(bytes) => bytes,
            Err(CryptoError::Decrypt) => {
                self.fail_session();
                return Err(HandshakeError::DecryptFailed);
            }
            Err(other) => return Err(other.into()),
        };
        let session_key: [u8; keys::KEY_SIZE] = session_key_bytes.try_into().map_err(|_| {
            HandshakeError::Crypto(CryptoError::InvalidKey(
                "session key must be 32 bytes".into(),
            ))
        })?;

        let now = Utc::now();
        let max_idle = status
            .max_idle_seconds
            .unwrap_or(self.config.default_max_idle_seconds);
        {
            let mut inner = self.lock();
            inner.state = SessionState::Authorized;
            inner.session_key = Some(session_key);
            inner.permission = status.permission;
            inner.max_idle_seconds = Some(max_idle);
            inner.authorizing_device = status.authorizing_device.clone();
            if let Some(ttl) = status.session_ttl_seconds {
                inner.expires_at = Some(now + chrono::Duration::seconds(ttl as i64));
            }
            inner.last_activity = now;
            inner.idle_expires_at = Some(now + chrono::Duration::seconds(max_idle as i64));
        }

        // Persist the key so a reload can resume without re-pairing. Failure
        // costs restoreability, not the live session.
        match self.store.load() {
            Ok(Some(mut record)) => {
                record.session_key = Some(keys::key_to_base64(&session_key));
                if let Err(err) = self.store.save(&record) {
                    warn!(session_id = %session_id, error = %err, "failed persisting session key");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(session_id = %session_id, error = %err, "failed reading session store"),
        }

        self.arm_idle_monitor();
        self.arm_expiry_warning();
        let _ = self.events.send(SessionEvent::Authorized);

        info!(
            session_id = %session_id,
            permission = ?status.permission,
            max_idle_seconds = max_idle,
            "session authorized"
        );
        Ok(())
    }

    /// Reset the activity clock; issues a remote touch at most once per
    /// configured interval. Must be called on every successful use of the
    /// session.
    pub async fn record_activity(&self) -> HandshakeResult<()> {
        let (touch_due, credentials) = {
            let mut inner = self.lock();
            if inner.state != SessionState::Authorized {
                return Err(HandshakeError::NotAuthorized);
            }
            let now = Utc::now();
            inner.last_activity = now;
            if let Some(max_idle) = inner.max_idle_seconds {
                inner.idle_expires_at = Some(now + chrono::Duration::seconds(max_idle as i64));
            }
            let touch_interval = chrono::Duration::from_std(self.config.touch_min_interval)
                .unwrap_or_else(|_| chrono::Duration::zero());
            let touch_due = inner
                .last_touch
                .is_none_or(|last| now - last >= touch_interval);
            if touch_due {
                inner.last_touch = Some(now);
            }
            (
                touch_due,
                (inner.session_id.clone(), inner.session_token.clone()),
            )
        };

        if touch_due {
            if let (Some(session_id), Some(session_token)) = credentials {
                if let Err(err) = self.api.touch(&session_id, &session_token).await {
                    warn!(session_id = %session_id, error = %err, "touch failed");
                }
            }
        }
        Ok(())
    }

    /// Encrypt a payload under the session key.
    pub fn encrypt(&self, plaintext: &[u8]) -> HandshakeResult<Vec<u8>> {
        let key = self.authorized_key()?;
        Ok(encrypt::seal(&key, plaintext)?)
    }

    /// Decrypt a payload. An authentication failure fails the session.
    pub fn decrypt(&self, sealed: &[u8]) -> HandshakeResult<Vec<u8>> {
        let key = self.authorized_key()?;
        match encrypt::open(&key, sealed) {
            Ok(plaintext) => Ok(plaintext),
            Err(CryptoError::Decrypt) => {
                self.fail_session();
                Err(HandshakeError::DecryptFailed)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Best-effort remote deletion, then unconditional local teardown.
    pub async fn revoke(&self, reason: &str) {
        let credentials = {
            let inner = self.lock();
            (inner.session_id.clone(), inner.session_token.clone())
        };

        if let (Some(session_id), Some(session_token)) = credentials {
            if let Err(err) = self.api.revoke(&session_id, &session_token, reason).await {
                warn!(session_id = %session_id, error = %err, "remote revoke failed");
            }
        }

        self.teardown(SessionState::Revoked);
        let _ = self.events.send(SessionEvent::Revoked);
        info!(reason = %reason, "session revoked");
    }

    /// Rehydrate a persisted session. Expired records are cleared and fail;
    /// records holding a session key resume authorized with the idle monitor
    /// re-armed, others resume waiting for authorization.
    pub async fn restore_from_storage(self: &Arc<Self>) -> HandshakeResult<SessionState> {
        let record = self
            .store
            .load()
            .map_err(HandshakeError::Storage)?
            .ok_or(HandshakeError::NoStoredSession)?;

        if record.expires_at <= Utc::now() {
            if let Err(err) = self.store.clear() {
                warn!(error = %err, "failed clearing expired session record");
            }
            return Err(HandshakeError::SessionExpired);
        }

        let private_key = keys::key_from_base64(&record.private_key)?;
        let session_key = match &record.session_key {
            Some(encoded) => Some(keys::key_from_base64(encoded)?),
            None => None,
        };

        let restored = {
            let mut inner = self.lock();
            inner.session_id = Some(record.session_id.clone());
            inner.session_token = Some(record.session_token);
            inner.private_key = Some(private_key);
            inner.expires_at = Some(record.expires_at);
            inner.last_activity = Utc::now();
            if let Some(key) = session_key {
                inner.session_key = Some(key);
                inner.max_idle_seconds = Some(self.config.default_max_idle_seconds);
                inner.idle_expires_at = Some(
                    Utc::now()
                        + chrono::Duration::seconds(self.config.default_max_idle_seconds as i64),
                );
                inner.state = SessionState::Authorized;
            } else {
                inner.state = SessionState::WaitingForAuth;
            }
            inner.state
        };

        if restored == SessionState::Authorized {
            self.arm_idle_monitor();
            self.arm_expiry_warning();
        }

        info!(session_id = %record.session_id, state = ?restored, "session restored");
        Ok(restored)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session state lock poisoned")
    }

    fn credentials(&self) -> HandshakeResult<(String, String)> {
        let inner = self.lock();
        match (&inner.session_id, &inner.session_token) {
            (Some(id), Some(token)) => Ok((id.clone(), token.clone())),
            _ => Err(HandshakeError::InvalidState(
                "session has not been initialized".into(),
            )),
        }
    }

    fn authorized_key(&self) -> HandshakeResult<[u8; keys::KEY_SIZE]> {
        let inner = self.lock();
        if inner.state != SessionState::Authorized {
            return Err(HandshakeError::NotAuthorized);
        }
        inner.session_key.ok_or(HandshakeError::NotAuthorized)
    }

    fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    /// Terminal failure of this session object (bad key material).
    fn fail_session(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::Error;
        inner.session_key = None;
        inner.cancel_timers();
    }

    fn teardown(&self, state: SessionState) {
        {
            let mut inner = self.lock();
            inner.cancel_timers();
            inner.state = state;
            inner.session_key = None;
        }
        self.cancel.cancel();
        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed clearing session store");
        }
    }

    /// Periodic idle check; transitions to IdleTimeout and self-stops once
    /// the idle window elapses without activity.
    fn arm_idle_monitor(self: &Arc<Self>) {
        let period = self.config.idle_check_interval;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };
                if session.idle_window_elapsed() {
                    session.enter_idle_timeout();
                    break;
                }
            }
        });

        let mut inner = self.lock();
        if let Some(old) = inner.idle_task.replace(handle) {
            old.abort();
        }
    }

    fn idle_window_elapsed(&self) -> bool {
        let inner = self.lock();
        inner.state == SessionState::Authorized
            && inner
                .idle_expires_at
                .is_some_and(|deadline| Utc::now() >= deadline)
    }

    fn enter_idle_timeout(&self) {
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Authorized {
                return;
            }
            inner.state = SessionState::IdleTimeout;
            if let Some(task) = inner.warning_task.take() {
                task.abort();
            }
        }
        let _ = self.events.send(SessionEvent::IdleTimeout);
        info!("session idle timeout");
    }

    /// Single-shot warning ahead of session expiry.
    fn arm_expiry_warning(self: &Arc<Self>) {
        let Some(expires_at) = self.lock().expires_at else {
            return;
        };
        let ttl = match (expires_at - Utc::now()).to_std() {
            Ok(ttl) => ttl,
            Err(_) => return, // already expired
        };
        let lead = self.config.expiry_warning_lead.min(ttl / 2);
        let delay = ttl.saturating_sub(lead);

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = weak.upgrade() {
                let _ = session.events.send(SessionEvent::ExpiryWarning);
                debug!("session expiry warning fired");
            }
        });

        let mut inner = self.lock();
        if let Some(old) = inner.warning_task.replace(handle) {
            old.abort();
        }
    }
}
