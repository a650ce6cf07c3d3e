//! Sidecar IPC server.
//!
//! Line-delimited JSON over a local unix socket, bounded frame size. Every
//! request is acked exactly once; subscriptions stream `message.v1` frames
//! to the requesting connection until it unsubscribes or disconnects.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use tether_types::sidecar::{
    DEFAULT_MAX_FRAME_BYTES, MessageFrame, OP_MESSAGE, OP_PUBLISH_ACK, OP_SUBSCRIBE_ACK,
    ObjectSetRequest, PublishRequest, RequestAck, SidecarRequest, SubscribeRequest,
};

use crate::backbone::{Backbone, BackboneChannel, InboundMessage};
use crate::error::{SidecarError, SidecarResult};
use crate::publisher::SideEffectPublisher;

/// Where subscribed messages for one IPC connection land.
pub type MessageSink = Box<dyn Fn(InboundMessage) + Send + Sync>;

/// Operations the IPC surface delegates to.
#[async_trait]
pub trait SidecarManager: Send + Sync {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> SidecarResult<()>;

    /// Publish on the acknowledged plane.
    async fn publish_with_ack(
        &self,
        channel: &str,
        event: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> SidecarResult<()>;

    /// Keyed last-write-wins publish on the target channel.
    async fn object_set(
        &self,
        channel: &str,
        key: &str,
        value: &[u8],
        timeout: Option<Duration>,
    ) -> SidecarResult<()>;

    async fn subscribe(
        &self,
        subscription_key: &str,
        channel: &str,
        event: &str,
        sink: MessageSink,
    ) -> SidecarResult<()>;

    async fn unsubscribe(&self, subscription_key: &str);
}

/// Handles for a running IPC server.
pub struct IpcServerRuntime {
    pub shutdown_tx: oneshot::Sender<()>,
    pub task: JoinHandle<()>,
}

/// Start the IPC server on `socket_path`. A `max_frame_bytes` of 0 selects
/// the default bound.
pub async fn start_ipc_server(
    socket_path: PathBuf,
    max_frame_bytes: usize,
    manager: Arc<dyn SidecarManager>,
) -> std::io::Result<IpcServerRuntime> {
    let max_frame_bytes = if max_frame_bytes == 0 {
        DEFAULT_MAX_FRAME_BYTES
    } else {
        max_frame_bytes
    };
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    if let Err(err) = std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
    {
        warn!(socket = %socket_path.display(), error = %err, "failed to set socket permissions");
    }

    info!(socket = %socket_path.display(), "sidecar IPC server listening");

    let socket_for_task = socket_path.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let manager = manager.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, manager, max_frame_bytes).await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "failed accepting IPC connection");
                        }
                    }
                }
            }
        }
        let _ = std::fs::remove_file(&socket_for_task);
    });

    Ok(IpcServerRuntime { shutdown_tx, task })
}

async fn handle_connection(
    stream: UnixStream,
    manager: Arc<dyn SidecarManager>,
    max_frame_bytes: usize,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!(connection_id = %connection_id, "IPC client connected");

    let (read_half, mut write_half) = stream.into_split();

    // Single writer task per connection; acks and subscription messages
    // share it.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut line = Vec::new();
        let mut limited = (&mut reader).take(max_frame_bytes as u64 + 1);
        match limited.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let had_newline = line.last() == Some(&b'\n');
                if had_newline {
                    line.pop();
                }
                if line.len() > max_frame_bytes {
                    warn!(
                        connection_id = %connection_id,
                        max_frame_bytes,
                        "IPC frame exceeded max size"
                    );
                    break;
                }
                if !line.is_empty() {
                    if let Err(err) = process_line(
                        manager.as_ref(),
                        &connection_id,
                        &out_tx,
                        &mut subscriptions,
                        &line,
                    )
                    .await
                    {
                        warn!(
                            connection_id = %connection_id,
                            error = %err,
                            "failed processing IPC frame"
                        );
                    }
                }
                if !had_newline {
                    break; // EOF after a final unterminated frame
                }
            }
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "IPC read error");
                break;
            }
        }
    }

    for key in &subscriptions {
        manager.unsubscribe(key).await;
    }
    drop(out_tx);
    let _ = writer.await;
    info!(connection_id = %connection_id, "IPC client disconnected");
}

async fn process_line(
    manager: &dyn SidecarManager,
    connection_id: &str,
    out_tx: &mpsc::UnboundedSender<String>,
    subscriptions: &mut HashSet<String>,
    line: &[u8],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let request = SidecarRequest::parse(line)?;
    match request {
        SidecarRequest::Publish(request) => {
            handle_publish(manager, out_tx, request, false).await;
        }
        SidecarRequest::PublishWithAck(request) => {
            handle_publish(manager, out_tx, request, true).await;
        }
        SidecarRequest::ObjectSet(request) => {
            handle_object_set(manager, out_tx, request).await;
        }
        SidecarRequest::Subscribe(request) => {
            handle_subscribe(manager, connection_id, out_tx, subscriptions, request).await;
        }
    }
    Ok(())
}

fn send_ack(out_tx: &mpsc::UnboundedSender<String>, ack: RequestAck) {
    let _ = out_tx.send(serde_json::to_string(&ack).unwrap_or_default());
}

async fn handle_publish(
    manager: &dyn SidecarManager,
    out_tx: &mpsc::UnboundedSender<String>,
    request: PublishRequest,
    with_ack: bool,
) {
    if request.request_id.is_empty() {
        return send_ack(
            out_tx,
            RequestAck::failed(OP_PUBLISH_ACK, "", "request_id is required"),
        );
    }
    if request.channel.is_empty() {
        return send_ack(
            out_tx,
            RequestAck::failed(OP_PUBLISH_ACK, request.request_id, "channel is required"),
        );
    }
    if request.event.is_empty() {
        return send_ack(
            out_tx,
            RequestAck::failed(OP_PUBLISH_ACK, request.request_id, "event is required"),
        );
    }

    let payload = match BASE64.decode(&request.payload_b64) {
        Ok(payload) => payload,
        Err(_) => {
            return send_ack(
                out_tx,
                RequestAck::failed(
                    OP_PUBLISH_ACK,
                    request.request_id,
                    "payload_b64 must be valid base64",
                ),
            );
        }
    };

    let timeout = request.timeout_ms.map(Duration::from_millis);
    let result = if with_ack {
        manager
            .publish_with_ack(&request.channel, &request.event, &payload, timeout)
            .await
    } else {
        manager
            .publish(&request.channel, &request.event, &payload, timeout)
            .await
    };

    let ack = match result {
        Ok(()) => RequestAck::ok(OP_PUBLISH_ACK, request.request_id),
        Err(err) => RequestAck::failed(OP_PUBLISH_ACK, request.request_id, err.to_string()),
    };
    send_ack(out_tx, ack);
}

async fn handle_object_set(
    manager: &dyn SidecarManager,
    out_tx: &mpsc::UnboundedSender<String>,
    request: ObjectSetRequest,
) {
    if request.request_id.is_empty() {
        return send_ack(
            out_tx,
            RequestAck::failed(OP_PUBLISH_ACK, "", "request_id is required"),
        );
    }
    if request.channel.is_empty() {
        return send_ack(
            out_tx,
            RequestAck::failed(OP_PUBLISH_ACK, request.request_id, "channel is required"),
        );
    }
    if request.key.is_empty() {
        return send_ack(
            out_tx,
            RequestAck::failed(OP_PUBLISH_ACK, request.request_id, "key is required"),
        );
    }

    let value = match BASE64.decode(&request.value_b64) {
        Ok(value) => value,
        Err(_) => {
            return send_ack(
                out_tx,
                RequestAck::failed(
                    OP_PUBLISH_ACK,
                    request.request_id,
                    "value_b64 must be valid base64",
                ),
            );
        }
    };

    let timeout = request.timeout_ms.map(Duration::from_millis);
    let ack = match manager
        .object_set(&request.channel, &request.key, &value, timeout)
        .await
    {
        Ok(()) => RequestAck::ok(OP_PUBLISH_ACK, request.request_id),
        Err(err) => RequestAck::failed(OP_PUBLISH_ACK, request.request_id, err.to_string()),
    };
    send_ack(out_tx, ack);
}

async fn handle_subscribe(
    manager: &dyn SidecarManager,
    connection_id: &str,
    out_tx: &mpsc::UnboundedSender<String>,
    subscriptions: &mut HashSet<String>,
    request: SubscribeRequest,
) {
    if request.request_id.is_empty() {
        return send_ack(
            out_tx,
            RequestAck::failed(OP_SUBSCRIBE_ACK, "", "request_id is required"),
        );
    }
    if request.subscription_id.is_empty() {
        return send_ack(
            out_tx,
            RequestAck::failed(
                OP_SUBSCRIBE_ACK,
                request.request_id,
                "subscription_id is required",
            ),
        );
    }
    if request.channel.is_empty() {
        return send_ack(
            out_tx,
            RequestAck::failed(OP_SUBSCRIBE_ACK, request.request_id, "channel is required"),
        );
    }

    let subscription_key = format!("{connection_id}:{}", request.subscription_id);
    let subscription_id = request.subscription_id.clone();
    let sink_tx = out_tx.clone();
    let sink: MessageSink = Box::new(move |message| {
        let frame = MessageFrame {
            op: OP_MESSAGE.to_string(),
            subscription_id: subscription_id.clone(),
            message_id: message.message_id,
            channel: message.channel,
            event: message.event,
            payload_b64: BASE64.encode(&message.payload),
            received_at_ms: message.received_at_ms,
        };
        if let Ok(encoded) = serde_json::to_string(&frame) {
            let _ = sink_tx.send(encoded);
        }
    });

    let ack = match manager
        .subscribe(&subscription_key, &request.channel, &request.event, sink)
        .await
    {
        Ok(()) => {
            subscriptions.insert(subscription_key);
            RequestAck::ok(OP_SUBSCRIBE_ACK, request.request_id)
        }
        Err(err) => RequestAck::failed(OP_SUBSCRIBE_ACK, request.request_id, err.to_string()),
    };
    send_ack(out_tx, ack);
}

/// Production [`SidecarManager`] wired over the publisher and the backbone.
pub struct BackboneManager {
    publisher: Arc<SideEffectPublisher>,
    backbone: Arc<dyn Backbone>,
    subscriptions: Mutex<HashMap<String, Arc<dyn BackboneChannel>>>,
}

impl BackboneManager {
    pub fn new(publisher: Arc<SideEffectPublisher>, backbone: Arc<dyn Backbone>) -> Self {
        Self {
            publisher,
            backbone,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    async fn publish_bounded(
        &self,
        channel: &str,
        event: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> SidecarResult<()> {
        match timeout {
            Some(timeout) => tokio::time::timeout(
                timeout,
                self.publisher.publish_raw(channel, event, payload),
            )
            .await
            .map_err(|_| SidecarError::Timeout)?,
            None => self.publisher.publish_raw(channel, event, payload).await,
        }
    }
}

#[async_trait]
impl SidecarManager for BackboneManager {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> SidecarResult<()> {
        self.publish_bounded(channel, event, payload, timeout).await
    }

    async fn publish_with_ack(
        &self,
        channel: &str,
        event: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> SidecarResult<()> {
        // Both planes ride the same retrying publisher.
        self.publish_bounded(channel, event, payload, timeout).await
    }

    async fn object_set(
        &self,
        channel: &str,
        key: &str,
        value: &[u8],
        timeout: Option<Duration>,
    ) -> SidecarResult<()> {
        let body = serde_json::to_vec(&serde_json::json!({
            "key": key,
            "value_b64": BASE64.encode(value),
        }))?;
        self.publish_bounded(channel, "object.set", &body, timeout)
            .await
    }

    async fn subscribe(
        &self,
        subscription_key: &str,
        channel: &str,
        event: &str,
        sink: MessageSink,
    ) -> SidecarResult<()> {
        let handle = self.backbone.channel(channel).await?;

        let event_filter = event.to_string();
        handle
            .subscribe_all(Box::new(move |message| {
                if event_filter.is_empty() || message.event == event_filter {
                    sink(message);
                }
                Box::pin(async {})
            }))
            .await?;

        self.subscriptions
            .lock()
            .await
            .insert(subscription_key.to_string(), handle);
        Ok(())
    }

    async fn unsubscribe(&self, subscription_key: &str) {
        let handle = self.subscriptions.lock().await.remove(subscription_key);
        if let Some(handle) = handle {
            handle.detach().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::testing::{MemoryBackbone, StaticCredentials};
    use crate::publisher::PublisherConfig;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncBufReadExt;

    struct RecordingManager {
        published: StdMutex<Vec<(String, String, Vec<u8>, bool)>>,
        sinks: StdMutex<HashMap<String, MessageSink>>,
        unsubscribed: StdMutex<Vec<String>>,
    }

    impl RecordingManager {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: StdMutex::new(Vec::new()),
                sinks: StdMutex::new(HashMap::new()),
                unsubscribed: StdMutex::new(Vec::new()),
            })
        }

        fn trigger(&self, subscription_key: &str, message: InboundMessage) {
            let sinks = self.sinks.lock().unwrap();
            sinks[subscription_key](message);
        }
    }

    #[async_trait]
    impl SidecarManager for RecordingManager {
        async fn publish(
            &self,
            channel: &str,
            event: &str,
            payload: &[u8],
            _timeout: Option<Duration>,
        ) -> SidecarResult<()> {
            self.published.lock().unwrap().push((
                channel.to_string(),
                event.to_string(),
                payload.to_vec(),
                false,
            ));
            Ok(())
        }

        async fn publish_with_ack(
            &self,
            channel: &str,
            event: &str,
            payload: &[u8],
            _timeout: Option<Duration>,
        ) -> SidecarResult<()> {
            self.published.lock().unwrap().push((
                channel.to_string(),
                event.to_string(),
                payload.to_vec(),
                true,
            ));
            Ok(())
        }

        async fn object_set(
            &self,
            _channel: &str,
            _key: &str,
            _value: &[u8],
            _timeout: Option<Duration>,
        ) -> SidecarResult<()> {
            Ok(())
        }

        async fn subscribe(
            &self,
            subscription_key: &str,
            _channel: &str,
            _event: &str,
            sink: MessageSink,
        ) -> SidecarResult<()> {
            self.sinks
                .lock()
                .unwrap()
                .insert(subscription_key.to_string(), sink);
            Ok(())
        }

        async fn unsubscribe(&self, subscription_key: &str) {
            self.unsubscribed
                .lock()
                .unwrap()
                .push(subscription_key.to_string());
        }
    }

    async fn start_test_server(
        max_frame_bytes: usize,
    ) -> (Arc<RecordingManager>, IpcServerRuntime, PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("sidecar.sock");
        let manager = RecordingManager::new();
        let runtime = start_ipc_server(socket_path.clone(), max_frame_bytes, manager.clone())
            .await
            .unwrap();
        (manager, runtime, socket_path, dir)
    }

    async fn send_line(stream: &mut UnixStream, line: &str) {
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
    }

    async fn read_line(reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("timed out reading IPC line")
            .unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn publish_request_is_acked_once() {
        let (manager, _runtime, socket_path, _dir) = start_test_server(64 * 1024).await;
        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let payload = BASE64.encode(b"opaque");
        writer
            .write_all(
                format!(
                    "{{\"op\":\"publish.v1\",\"request_id\":\"r-1\",\"channel\":\"effects:u1\",\"event\":\"ev\",\"payload_b64\":\"{payload}\"}}\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let ack: RequestAck = serde_json::from_str(&read_line(&mut reader).await).unwrap();
        assert!(ack.ok);
        assert_eq!(ack.request_id, "r-1");
        assert_eq!(ack.op, OP_PUBLISH_ACK);

        let published = manager.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "effects:u1");
        assert_eq!(published[0].2, b"opaque");
        assert!(!published[0].3);
    }

    #[tokio::test]
    async fn invalid_publish_requests_are_acked_with_errors() {
        let (manager, _runtime, socket_path, _dir) = start_test_server(64 * 1024).await;
        let mut stream = UnixStream::connect(&socket_path).await.unwrap();

        send_line(
            &mut stream,
            r#"{"op":"publish.v1","request_id":"r-1","channel":"","event":"ev","payload_b64":""}"#,
        )
        .await;
        send_line(
            &mut stream,
            r#"{"op":"publish.v1","request_id":"r-2","channel":"c","event":"ev","payload_b64":"!!!"}"#,
        )
        .await;

        let (read_half, _write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let ack: RequestAck = serde_json::from_str(&read_line(&mut reader).await).unwrap();
        assert!(!ack.ok);
        assert!(ack.error.unwrap().contains("channel is required"));

        let ack: RequestAck = serde_json::from_str(&read_line(&mut reader).await).unwrap();
        assert!(!ack.ok);
        assert!(ack.error.unwrap().contains("base64"));

        assert!(manager.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_op_is_skipped_and_connection_stays_alive() {
        let (_manager, _runtime, socket_path, _dir) = start_test_server(64 * 1024).await;
        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        writer
            .write_all(b"{\"op\":\"teleport.v1\",\"request_id\":\"r-0\"}\n")
            .await
            .unwrap();
        let payload = BASE64.encode(b"x");
        writer
            .write_all(
                format!(
                    "{{\"op\":\"publish.v1\",\"request_id\":\"r-1\",\"channel\":\"c\",\"event\":\"e\",\"payload_b64\":\"{payload}\"}}\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        // Only the valid request is acked; the unknown op produced nothing.
        let ack: RequestAck = serde_json::from_str(&read_line(&mut reader).await).unwrap();
        assert_eq!(ack.request_id, "r-1");
        assert!(ack.ok);
    }

    #[tokio::test]
    async fn subscription_streams_messages_until_disconnect() {
        let (manager, _runtime, socket_path, _dir) = start_test_server(64 * 1024).await;
        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        writer
            .write_all(
                b"{\"op\":\"subscribe.v1\",\"request_id\":\"r-1\",\"subscription_id\":\"sub-1\",\"channel\":\"commands:dev-1\"}\n",
            )
            .await
            .unwrap();
        let ack: RequestAck = serde_json::from_str(&read_line(&mut reader).await).unwrap();
        assert!(ack.ok);
        assert_eq!(ack.op, OP_SUBSCRIBE_ACK);

        let subscription_key = manager
            .sinks
            .lock()
            .unwrap()
            .keys()
            .next()
            .unwrap()
            .clone();
        manager.trigger(
            &subscription_key,
            InboundMessage {
                message_id: "m-1".into(),
                channel: "commands:dev-1".into(),
                event: "command".into(),
                payload: b"encrypted".to_vec(),
                received_at_ms: 1_700_000_000_000,
            },
        );

        let frame: MessageFrame = serde_json::from_str(&read_line(&mut reader).await).unwrap();
        assert_eq!(frame.op, OP_MESSAGE);
        assert_eq!(frame.subscription_id, "sub-1");
        assert_eq!(BASE64.decode(&frame.payload_b64).unwrap(), b"encrypted");

        // Disconnecting tears the subscription down.
        drop(writer);
        drop(reader);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            manager.unsubscribed.lock().unwrap().as_slice(),
            [subscription_key]
        );
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_connection() {
        let (_manager, _runtime, socket_path, _dir) = start_test_server(128).await;
        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let huge = "x".repeat(1024);
        writer
            .write_all(format!("{{\"op\":\"publish.v1\",\"request_id\":\"{huge}\"}}\n").as_bytes())
            .await
            .unwrap();

        let mut buf = String::new();
        let n = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        assert_eq!(n, 0, "expected connection close, got: {buf}");
    }

    #[tokio::test]
    async fn backbone_manager_routes_subscriptions_through_the_event_filter() {
        let backbone = MemoryBackbone::new();
        let publisher = Arc::new(SideEffectPublisher::new(
            Arc::new(backbone.clone()),
            Arc::new(StaticCredentials),
            PublisherConfig {
                default_channel: "effects:u1".into(),
                ..PublisherConfig::default()
            },
        ));
        publisher.connect().await.unwrap();
        let manager = BackboneManager::new(publisher, Arc::new(backbone.clone()));

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<InboundMessage>();
        manager
            .subscribe(
                "conn:sub-1",
                "commands:dev-1",
                "command",
                Box::new(move |message| {
                    let _ = seen_tx.send(message);
                }),
            )
            .await
            .unwrap();

        backbone.deliver("commands:dev-1", "presence", b"noise").await;
        backbone.deliver("commands:dev-1", "command", b"real").await;

        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen.payload, b"real");
        assert!(seen_rx.try_recv().is_err());

        // After unsubscribe nothing more arrives.
        manager.unsubscribe("conn:sub-1").await;
        backbone.deliver("commands:dev-1", "command", b"late").await;
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn backbone_manager_object_set_publishes_keyed_body() {
        let backbone = MemoryBackbone::new();
        let publisher = Arc::new(SideEffectPublisher::new(
            Arc::new(backbone.clone()),
            Arc::new(StaticCredentials),
            PublisherConfig::default(),
        ));
        publisher.connect().await.unwrap();
        let manager = BackboneManager::new(publisher, Arc::new(backbone.clone()));

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<InboundMessage>();
        manager
            .subscribe(
                "conn:sub-1",
                "state:u1",
                "object.set",
                Box::new(move |message| {
                    let _ = seen_tx.send(message);
                }),
            )
            .await
            .unwrap();

        manager
            .object_set("state:u1", "cursor", b"position-7", None)
            .await
            .unwrap();

        let seen = seen_rx.recv().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&seen.payload).unwrap();
        assert_eq!(body["key"], "cursor");
        assert_eq!(
            BASE64.decode(body["value_b64"].as_str().unwrap()).unwrap(),
            b"position-7"
        );
    }
}
