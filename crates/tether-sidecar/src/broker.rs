//! Local token broker.
//!
//! Sidecars never hold a long-lived backbone secret. Each connect attempt
//! trades a per-process broker token for a short-lived, audience-scoped
//! credential over a one-shot unix-socket exchange. The broker validates the
//! caller, consults its cache, and otherwise asks the upstream issuer.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_types::broker::{
    BrokerAudience, BrokerCredential, BrokerTokenRequest, BrokerTokenResponse,
};

use crate::error::{SidecarError, SidecarResult};

/// Cached credentials are discarded this long before their expiry.
const CACHE_REFRESH_MARGIN_MS: i64 = 120_000;
const MAX_REQUEST_BYTES: usize = 16 * 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of backbone credentials for a sidecar client.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credential(&self, audience: BrokerAudience) -> SidecarResult<BrokerCredential>;
}

/// Client side of the broker exchange: one request, one response, over a
/// unix socket with the write half shut down after the request.
pub struct BrokerClient {
    pub socket_path: PathBuf,
    pub broker_token: String,
    pub device_id: String,
}

#[async_trait]
impl CredentialSource for BrokerClient {
    async fn credential(&self, audience: BrokerAudience) -> SidecarResult<BrokerCredential> {
        let request = serde_json::to_vec(&BrokerTokenRequest {
            broker_token: self.broker_token.clone(),
            audience,
            device_id: self.device_id.clone(),
        })?;

        let mut stream = UnixStream::connect(&self.socket_path).await?;
        stream.write_all(&request).await?;
        stream.shutdown().await?;

        let mut response_bytes = Vec::new();
        tokio::time::timeout(IO_TIMEOUT, stream.read_to_end(&mut response_bytes))
            .await
            .map_err(|_| SidecarError::Timeout)??;

        let response: BrokerTokenResponse = serde_json::from_slice(&response_bytes)
            .map_err(|err| SidecarError::BrokerRejected(format!("invalid broker response: {err}")))?;

        if !response.ok {
            return Err(SidecarError::BrokerRejected(
                response.error.unwrap_or_else(|| "request refused".to_string()),
            ));
        }
        let credential = response
            .token_details
            .ok_or_else(|| SidecarError::BrokerRejected("response missing token details".into()))?;
        if credential.token.is_empty() {
            return Err(SidecarError::BrokerRejected("response missing token".into()));
        }
        Ok(credential)
    }
}

/// Upstream credential issuance (the web API in production).
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(
        &self,
        audience: BrokerAudience,
        device_id: &str,
    ) -> Result<BrokerCredential, String>;
}

#[derive(Clone, Eq, Hash, PartialEq)]
struct CacheKey {
    audience: BrokerAudience,
    device_id: String,
}

/// Handles and per-audience tokens for a running broker.
pub struct TokenBrokerRuntime {
    pub publisher_token: String,
    pub consumer_token: String,
    pub shutdown_tx: oneshot::Sender<()>,
    pub task: JoinHandle<()>,
}

struct BrokerState {
    issuer: Arc<dyn CredentialIssuer>,
    publisher_token: String,
    consumer_token: String,
    cache: RwLock<HashMap<CacheKey, BrokerCredential>>,
}

/// Start the local token broker on `socket_path`.
///
/// Generates one broker token per audience; these are handed to the sidecar
/// processes out of band (environment of the spawned process).
pub async fn start_token_broker(
    socket_path: PathBuf,
    issuer: Arc<dyn CredentialIssuer>,
) -> Result<TokenBrokerRuntime, String> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).map_err(|err| {
            format!("failed to remove stale broker socket {}: {err}", socket_path.display())
        })?;
    }

    let listener = UnixListener::bind(&socket_path).map_err(|err| {
        format!("failed to bind broker socket {}: {err}", socket_path.display())
    })?;

    if let Err(err) = std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
    {
        warn!(
            socket = %socket_path.display(),
            error = %err,
            "failed to tighten permissions on broker socket"
        );
    }

    let publisher_token = Uuid::new_v4().to_string();
    let consumer_token = Uuid::new_v4().to_string();

    let state = Arc::new(BrokerState {
        issuer,
        publisher_token: publisher_token.clone(),
        consumer_token: consumer_token.clone(),
        cache: RwLock::new(HashMap::new()),
    });

    let socket_for_task = socket_path.clone();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        run_listener(listener, state, shutdown_rx).await;
        if let Err(err) = std::fs::remove_file(&socket_for_task) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    socket = %socket_for_task.display(),
                    error = %err,
                    "failed removing broker socket during shutdown"
                );
            }
        }
    });

    info!(socket = %socket_path.display(), "started local token broker");

    Ok(TokenBrokerRuntime {
        publisher_token,
        consumer_token,
        shutdown_tx,
        task,
    })
}

async fn run_listener(
    listener: UnixListener,
    state: Arc<BrokerState>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("shutting down local token broker");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, state).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "failed accepting broker connection");
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, state: Arc<BrokerState>) {
    let response = match read_request(&mut stream).await {
        Ok(request) => match state.resolve_credential(request).await {
            Ok(credential) => BrokerTokenResponse::granted(credential),
            Err(error) => BrokerTokenResponse::rejected(error),
        },
        Err(error) => BrokerTokenResponse::rejected(error),
    };

    if let Err(error) = write_response(&mut stream, response).await {
        warn!(error = %error, "failed writing broker response");
    }
}

impl BrokerState {
    async fn resolve_credential(&self, request: BrokerTokenRequest) -> Result<BrokerCredential, String> {
        if !self.validate_broker_token(request.audience, &request.broker_token) {
            return Err("invalid broker token".to_string());
        }

        let device_id = normalize_device_id(&request.device_id)?;
        let cache_key = CacheKey {
            audience: request.audience,
            device_id: device_id.clone(),
        };

        if let Some(cached) = self.get_cached(&cache_key).await {
            debug!(audience = request.audience.as_str(), "serving cached credential");
            return Ok(cached);
        }

        let fresh = self.issuer.issue(request.audience, &device_id).await?;
        if fresh.token.is_empty() {
            return Err("issuer returned an empty token".to_string());
        }
        if fresh.client_id.is_empty() {
            return Err("issuer returned no client id".to_string());
        }

        self.cache.write().await.insert(cache_key, fresh.clone());
        debug!(audience = request.audience.as_str(), "issued fresh credential");
        Ok(fresh)
    }

    fn validate_broker_token(&self, audience: BrokerAudience, broker_token: &str) -> bool {
        match audience {
            BrokerAudience::EffectPublisher => broker_token == self.publisher_token,
            BrokerAudience::CommandConsumer => broker_token == self.consumer_token,
        }
    }

    async fn get_cached(&self, key: &CacheKey) -> Option<BrokerCredential> {
        let now_ms = Utc::now().timestamp_millis();
        let cached = self.cache.read().await.get(key).cloned();

        let cached = cached?;
        if is_cache_valid(cached.expires, now_ms) {
            return Some(cached);
        }

        self.cache.write().await.remove(key);
        None
    }
}

async fn read_request(stream: &mut UnixStream) -> Result<BrokerTokenRequest, String> {
    let mut bytes = Vec::with_capacity(512);
    let mut chunk = [0_u8; 1024];

    loop {
        let read = tokio::time::timeout(IO_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| "timed out while reading broker request".to_string())?
            .map_err(|err| format!("failed reading broker request: {err}"))?;

        if read == 0 {
            break;
        }

        bytes.extend_from_slice(&chunk[..read]);
        if bytes.len() > MAX_REQUEST_BYTES {
            return Err("broker request body is too large".to_string());
        }
    }

    if bytes.is_empty() {
        return Err("empty broker request body".to_string());
    }

    serde_json::from_slice(&bytes).map_err(|err| format!("invalid broker request JSON: {err}"))
}

async fn write_response(stream: &mut UnixStream, response: BrokerTokenResponse) -> Result<(), String> {
    let payload = serde_json::to_vec(&response)
        .map_err(|err| format!("failed serializing broker response: {err}"))?;

    tokio::time::timeout(IO_TIMEOUT, stream.write_all(&payload))
        .await
        .map_err(|_| "timed out while writing broker response".to_string())?
        .map_err(|err| format!("failed writing broker response: {err}"))?;
    Ok(())
}

fn normalize_device_id(raw_device_id: &str) -> Result<String, String> {
    Uuid::parse_str(raw_device_id)
        .map(|parsed| parsed.to_string())
        .map_err(|_| "device_id must be a valid UUID".to_string())
}

fn is_cache_valid(expires_ms: i64, now_ms: i64) -> bool {
    now_ms + CACHE_REFRESH_MARGIN_MS < expires_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DEVICE_ID: &str = "6f5db7f9-c6ef-4d60-88f8-39f62f272f07";

    struct StubIssuer {
        calls: AtomicUsize,
        expires_in_ms: i64,
    }

    impl StubIssuer {
        fn new(expires_in_ms: i64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                expires_in_ms,
            })
        }
    }

    #[async_trait]
    impl CredentialIssuer for StubIssuer {
        async fn issue(
            &self,
            audience: BrokerAudience,
            device_id: &str,
        ) -> Result<BrokerCredential, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now().timestamp_millis();
            Ok(BrokerCredential {
                token: format!("token-{}", self.calls.load(Ordering::SeqCst)),
                expires: now + self.expires_in_ms,
                client_id: "user-1".into(),
                issued: now,
                capability: format!("{{\"{}:*\":[\"publish\"]}}", audience.as_str()),
            })
        }
    }

    async fn start(
        issuer: Arc<StubIssuer>,
    ) -> (TokenBrokerRuntime, PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("broker.sock");
        let runtime = start_token_broker(socket_path.clone(), issuer).await.unwrap();
        (runtime, socket_path, dir)
    }

    fn client(socket_path: &PathBuf, broker_token: &str) -> BrokerClient {
        BrokerClient {
            socket_path: socket_path.clone(),
            broker_token: broker_token.to_string(),
            device_id: DEVICE_ID.to_string(),
        }
    }

    #[tokio::test]
    async fn valid_request_yields_credential() {
        let issuer = StubIssuer::new(3_600_000);
        let (runtime, socket_path, _dir) = start(issuer.clone()).await;

        let credential = client(&socket_path, &runtime.publisher_token)
            .credential(BrokerAudience::EffectPublisher)
            .await
            .unwrap();
        assert_eq!(credential.token, "token-1");
        assert_eq!(credential.client_id, "user-1");
    }

    #[tokio::test]
    async fn wrong_broker_token_is_rejected() {
        let issuer = StubIssuer::new(3_600_000);
        let (_runtime, socket_path, _dir) = start(issuer.clone()).await;

        let err = client(&socket_path, "stolen-token")
            .credential(BrokerAudience::EffectPublisher)
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::BrokerRejected(_)));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn audience_tokens_are_not_interchangeable() {
        let issuer = StubIssuer::new(3_600_000);
        let (runtime, socket_path, _dir) = start(issuer).await;

        // The publisher's broker token must not mint consumer credentials.
        let err = client(&socket_path, &runtime.publisher_token)
            .credential(BrokerAudience::CommandConsumer)
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::BrokerRejected(_)));
    }

    #[tokio::test]
    async fn invalid_device_id_is_rejected() {
        let issuer = StubIssuer::new(3_600_000);
        let (runtime, socket_path, _dir) = start(issuer).await;

        let mut bad_client = client(&socket_path, &runtime.publisher_token);
        bad_client.device_id = "not-a-uuid".into();
        let err = bad_client
            .credential(BrokerAudience::EffectPublisher)
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::BrokerRejected(_)));
    }

    #[tokio::test]
    async fn malformed_request_gets_error_response() {
        let issuer = StubIssuer::new(3_600_000);
        let (_runtime, socket_path, _dir) = start(issuer).await;

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        stream.write_all(b"{this is not json").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let parsed: BrokerTokenResponse = serde_json::from_slice(&response).unwrap();
        assert!(!parsed.ok);
        assert!(parsed.error.unwrap().contains("invalid broker request"));
    }

    #[tokio::test]
    async fn fresh_credential_is_cached_until_refresh_margin() {
        let issuer = StubIssuer::new(3_600_000);
        let (runtime, socket_path, _dir) = start(issuer.clone()).await;
        let broker_client = client(&socket_path, &runtime.publisher_token);

        let first = broker_client
            .credential(BrokerAudience::EffectPublisher)
            .await
            .unwrap();
        let second = broker_client
            .credential(BrokerAudience::EffectPublisher)
            .await
            .unwrap();

        assert_eq!(first.token, second.token);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn near_expiry_credential_is_reissued() {
        // Expires inside the refresh margin, so the cache never serves it.
        let issuer = StubIssuer::new(CACHE_REFRESH_MARGIN_MS / 2);
        let (runtime, socket_path, _dir) = start(issuer.clone()).await;
        let broker_client = client(&socket_path, &runtime.publisher_token);

        let first = broker_client
            .credential(BrokerAudience::EffectPublisher)
            .await
            .unwrap();
        let second = broker_client
            .credential(BrokerAudience::EffectPublisher)
            .await
            .unwrap();

        assert_ne!(first.token, second.token);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_validity_respects_refresh_margin() {
        assert!(is_cache_valid(1_000_000, 800_000));
        assert!(!is_cache_valid(910_000, 800_000));
    }
}
