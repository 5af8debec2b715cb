//! WebSocket binding of [`Protocol`].
//!
//! One connection per audio channel. Each connection has a reader task
//! (incoming frames -> callbacks) and a writer task (outgoing queue ->
//! socket). The main loop blocks on the runtime only while opening.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::{Error as WsError, protocol::Message};
use url::Url;

use crate::protocol::{
    AudioParams, ClientHello, DEFAULT_SERVER_SAMPLE_RATE, Protocol, ProtocolCallbacks, ServerHello,
};
use crate::util::lock;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    pub url: String,
    pub token: String,
    pub device_id: String,
    pub client_id: String,
    pub audio_params: AudioParams,
    pub handshake_timeout: Duration,
}

/// Why opening the audio channel failed. The display text is what the
/// network-error callback receives.
#[derive(Debug, thiserror::Error)]
pub enum OpenChannelError {
    #[error("无法连接服务")]
    Connect(String),
    #[error("不支持的传输方式: {0}")]
    TransportMismatch(String),
    #[error("连接已断开")]
    ClosedDuringHandshake,
    #[error("等待响应超时")]
    HandshakeTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Open,
    Closed,
}

struct Session {
    server_sample_rate: u32,
    session_id: String,
}

/// State shared between the protocol and one connection's tasks.
struct Link {
    phase: Mutex<Phase>,
    callbacks: Arc<ProtocolCallbacks>,
}

impl Link {
    /// Move to `Closed`, returning the phase it left.
    fn close(&self) -> Phase {
        std::mem::replace(&mut *lock(&self.phase), Phase::Closed)
    }
}

/// Slot holding the live connection, shared with its reader task.
type ConnectionSlot = Arc<Mutex<Option<Connection>>>;

struct Connection {
    link: Arc<Link>,
    tx: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Drop the socket. Fires channel-closed only if asked and the channel
    /// had completed its handshake.
    fn shutdown(self, notify: bool) {
        let was = self.link.close();
        self.reader.abort();
        // dropping tx ends the writer, which sends a close frame
        drop(self.tx);
        if notify && was == Phase::Open {
            self.link.callbacks.audio_channel_closed();
        }
    }
}

pub struct WebsocketProtocol {
    config: WebsocketConfig,
    runtime: Handle,
    callbacks: Arc<ProtocolCallbacks>,
    session: Arc<Mutex<Session>>,
    connection: ConnectionSlot,
}

impl WebsocketProtocol {
    pub fn new(config: WebsocketConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            callbacks: Arc::new(ProtocolCallbacks::default()),
            session: Arc::new(Mutex::new(Session {
                server_sample_rate: DEFAULT_SERVER_SAMPLE_RATE,
                session_id: String::new(),
            })),
            connection: Arc::new(Mutex::new(None)),
        }
    }

    fn build_request(&self) -> anyhow::Result<Request<()>> {
        // 根据配置构建WebSocket请求
        let url = Url::parse(&self.config.url)?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => anyhow::bail!("Missing host in {}", self.config.url),
        };

        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Host", HeaderValue::from_str(&host)?);
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.config.token))?,
        );
        headers.insert("Protocol-Version", HeaderValue::from_static("1"));
        headers.insert("Device-Id", HeaderValue::from_str(&self.config.device_id)?);
        headers.insert("Client-Id", HeaderValue::from_str(&self.config.client_id)?);
        Ok(request)
    }

    async fn connect(&self) -> Result<Connection, OpenChannelError> {
        let timeout = self.config.handshake_timeout;
        let request = self
            .build_request()
            .map_err(|e| OpenChannelError::Connect(format!("{:#}", e)))?;

        log::info!("Connecting to {}...", self.config.url);
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| OpenChannelError::Connect("connect timed out".into()))?
            .map_err(|e| OpenChannelError::Connect(e.to_string()))?;
        log::info!("Connected!");

        let (mut write, read) = ws_stream.split();

        // 发送Hello消息进行初始化链接
        let hello = ClientHello::new("websocket", &self.config.audio_params);
        let hello_json = serde_json::to_string(&hello)
            .map_err(|e| OpenChannelError::Connect(e.to_string()))?;
        log::debug!("Sending Hello: {}", hello_json);
        write
            .send(Message::Text(hello_json.into()))
            .await
            .map_err(|e| OpenChannelError::Connect(e.to_string()))?;

        let link = Arc::new(Link {
            phase: Mutex::new(Phase::Handshaking),
            callbacks: self.callbacks.clone(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (hello_tx, hello_rx) = oneshot::channel();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write.send(message).await {
                    log::warn!("WebSocket send failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });
        let reader = tokio::spawn(read_loop(
            read,
            link.clone(),
            self.session.clone(),
            self.connection.clone(),
            hello_tx,
        ));

        let connection = Connection { link, tx, reader };

        // 等待服务器hello响应
        let result = match tokio::time::timeout(timeout, hello_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(OpenChannelError::ClosedDuringHandshake),
            Err(_) => Err(OpenChannelError::HandshakeTimeout),
        };

        match result {
            Ok(()) => {
                let mut phase = lock(&connection.link.phase);
                if *phase == Phase::Handshaking {
                    *phase = Phase::Open;
                    drop(phase);
                    Ok(connection)
                } else {
                    drop(phase);
                    connection.shutdown(false);
                    Err(OpenChannelError::ClosedDuringHandshake)
                }
            }
            Err(e) => {
                connection.shutdown(false);
                Err(e)
            }
        }
    }
}

async fn read_loop<S>(
    mut read: S,
    link: Arc<Link>,
    session: Arc<Mutex<Session>>,
    slot: ConnectionSlot,
    hello_tx: oneshot::Sender<Result<(), OpenChannelError>>,
) where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut hello_tx = Some(hello_tx);

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Binary(data)) => link.callbacks.incoming_audio(data),
            Ok(Message::Text(text)) => {
                let root: Value = match serde_json::from_str(text.as_str()) {
                    Ok(root) => root,
                    Err(e) => {
                        log::warn!("Invalid JSON from server: {}, data: {}", e, text.as_str());
                        continue;
                    }
                };
                match root.get("type").and_then(Value::as_str) {
                    Some("hello") => {
                        let result = parse_server_hello(&root, &session);
                        if let Some(tx) = hello_tx.take() {
                            let _ = tx.send(result);
                        }
                    }
                    Some(_) => {
                        log::info!("Received Text: {}", text.as_str());
                        link.callbacks.incoming_json(&root);
                    }
                    None => log::warn!("Missing message type, data: {}", text.as_str()),
                }
            }
            Ok(Message::Close(frame)) => {
                log::info!("Server closed connection: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    if let Some(tx) = hello_tx.take() {
        let _ = tx.send(Err(OpenChannelError::ClosedDuringHandshake));
    }
    if link.close() == Phase::Open {
        log::info!("Websocket disconnected");
        // dropping the connection ends the writer and frees the socket
        let stale = {
            let mut slot = lock(&slot);
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(&c.link, &link)) {
                slot.take()
            } else {
                None
            }
        };
        drop(stale);
        link.callbacks.audio_channel_closed();
    }
}

fn parse_server_hello(root: &Value, session: &Mutex<Session>) -> Result<(), OpenChannelError> {
    let hello: ServerHello = serde_json::from_value(root.clone()).unwrap_or_default();
    let transport = hello.transport.unwrap_or_default();
    if transport != "websocket" {
        log::error!("Unsupported transport: {}", transport);
        return Err(OpenChannelError::TransportMismatch(transport));
    }

    let mut session = lock(session);
    if let Some(sample_rate) = hello.audio_params.and_then(|p| p.sample_rate) {
        session.server_sample_rate = sample_rate;
    }
    session.session_id = hello.session_id.unwrap_or_default();
    log::info!(
        "Server hello: session_id={}, sample_rate={}",
        session.session_id,
        session.server_sample_rate
    );
    Ok(())
}

impl Protocol for WebsocketProtocol {
    fn callbacks(&self) -> &ProtocolCallbacks {
        &self.callbacks
    }

    fn server_sample_rate(&self) -> u32 {
        lock(&self.session).server_sample_rate
    }

    fn session_id(&self) -> String {
        lock(&self.session).session_id.clone()
    }

    fn open_audio_channel(&self) -> bool {
        // 旧连接直接丢弃，不再通知 closed
        if let Some(previous) = lock(&self.connection).take() {
            previous.shutdown(false);
        }

        match self.runtime.block_on(self.connect()) {
            Ok(connection) => {
                *lock(&self.connection) = Some(connection);
                self.callbacks.audio_channel_opened();
                true
            }
            Err(e) => {
                log::error!("Failed to open audio channel: {:?}", e);
                self.callbacks.network_error(&e.to_string());
                false
            }
        }
    }

    fn close_audio_channel(&self) {
        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            connection.shutdown(true);
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|c| *lock(&c.link.phase) == Phase::Open)
    }

    fn send_audio(&self, frame: Bytes) {
        if let Some(connection) = lock(&self.connection).as_ref() {
            let _ = connection.tx.send(Message::Binary(frame));
        }
    }

    fn send_text(&self, text: &str) {
        if let Some(connection) = lock(&self.connection).as_ref() {
            let _ = connection.tx.send(Message::Text(text.to_string().into()));
        }
    }
}

impl Drop for WebsocketProtocol {
    fn drop(&mut self) {
        if let Some(connection) = lock(&self.connection).take() {
            connection.shutdown(false);
        }
    }
}
