//! WebSocket link between the client core and a DEX server.
//!
//! The core consumes the narrow [`DexLink`] trait; [`WsConn`] implements it
//! over tokio-tungstenite. A spawned connection task owns the socket and
//! multiplexes inbound frames, outbound commands, keepalive, and shutdown.
//! Responses that match an outstanding [`DexLink::request`] resolve it
//! directly; every other message flows to the message source the core's
//! listener drains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{interval, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};

use crate::msg::{Message, MessageKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsFrame>;
type WsSource = SplitStream<WsStream>;

/// Dial timeout for the initial connection and each reconnect attempt.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Link-layer errors.
#[derive(Debug, Error)]
pub enum CommsError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),

    #[error("TLS certificate error: {0}")]
    Tls(String),

    #[error("not connected")]
    NotConnected,

    #[error("request message carries no id")]
    MissingId,

    #[error("internal channel closed")]
    ChannelClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("message encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for CommsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match err {
            Error::ConnectionClosed | Error::AlreadyClosed => CommsError::NotConnected,
            Error::Url(e) => CommsError::InvalidUrl(e.to_string()),
            Error::Io(e) => CommsError::ConnectionFailed(e.to_string()),
            other => CommsError::Protocol(other.to_string()),
        }
    }
}

/// Configuration for one DEX link.
#[derive(Clone)]
pub struct WsCfg {
    pub url: String,
    /// The connection is considered dead when nothing arrives within this
    /// window. Default 60 s.
    pub ping_wait: Duration,
    /// TLS certificate filepath for servers with self-signed certificates.
    pub cert_path: Option<String>,
    pub reconnect_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Invoked after a lost connection has been re-established, so the owner
    /// can resubscribe and refresh its books.
    pub reconnect_sync: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl WsCfg {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_wait: Duration::from_secs(60),
            cert_path: None,
            reconnect_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            reconnect_sync: None,
        }
    }
}

impl std::fmt::Debug for WsCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsCfg")
            .field("url", &self.url)
            .field("ping_wait", &self.ping_wait)
            .field("cert_path", &self.cert_path)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish_non_exhaustive()
    }
}

/// The link contract the client core consumes. Satisfied by [`WsConn`], or
/// by a stub for testing.
#[async_trait]
pub trait DexLink: Send + Sync {
    /// Next unique request id for this link.
    fn next_id(&self) -> u64;

    /// Fire-and-forget send.
    async fn send(&self, msg: Message) -> Result<(), CommsError>;

    /// Send a request and await the response bearing the same id.
    async fn request(&self, msg: Message) -> Result<Message, CommsError>;

    /// Take the inbound message stream. Yields `None` after the first call.
    fn take_message_source(&self) -> Option<mpsc::Receiver<Message>>;

    /// Resolve once the connection task has exited.
    async fn wait_for_shutdown(&self);
}

enum LinkCommand {
    Send(String),
    Close,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>>;

/// A live WebSocket connection to one DEX server.
pub struct WsConn {
    next_id: AtomicU64,
    cmd_tx: mpsc::Sender<LinkCommand>,
    source_rx: parking_lot::Mutex<Option<mpsc::Receiver<Message>>>,
    pending: PendingMap,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsConn {
    /// Dial the server and spawn the connection task. The task exits when
    /// `shutdown` flips true, the peer closes, or reconnection gives up.
    pub async fn connect(cfg: WsCfg, shutdown: watch::Receiver<bool>) -> Result<Arc<Self>, CommsError> {
        let stream = dial(&cfg).await?;
        let (sink, source) = stream.split();

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (source_tx, source_rx) = mpsc::channel(128);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let ctx = ConnContext {
            cfg,
            source_tx,
            pending: pending.clone(),
            shutdown,
        };
        let task = tokio::spawn(connection_task(sink, source, cmd_rx, ctx));

        Ok(Arc::new(Self {
            next_id: AtomicU64::new(1),
            cmd_tx,
            source_rx: parking_lot::Mutex::new(Some(source_rx)),
            pending,
            task: Mutex::new(Some(task)),
        }))
    }

    /// Ask the connection task to close the socket and exit.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(LinkCommand::Close).await;
    }
}

#[async_trait]
impl DexLink for WsConn {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, msg: Message) -> Result<(), CommsError> {
        let text = serde_json::to_string(&msg)?;
        self.cmd_tx
            .send(LinkCommand::Send(text))
            .await
            .map_err(|_| CommsError::ChannelClosed)
    }

    async fn request(&self, msg: Message) -> Result<Message, CommsError> {
        let id = msg.id.ok_or(CommsError::MissingId)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(err) = self.send(msg).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }
        rx.await.map_err(|_| CommsError::ChannelClosed)
    }

    fn take_message_source(&self) -> Option<mpsc::Receiver<Message>> {
        self.source_rx.lock().take()
    }

    async fn wait_for_shutdown(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Dial, honoring a per-server certificate override when configured.
async fn dial(cfg: &WsCfg) -> Result<WsStream, CommsError> {
    let attempt = async {
        if let Some(cert_path) = &cfg.cert_path {
            let pem = std::fs::read(cert_path)
                .map_err(|e| CommsError::Tls(format!("certificate read error: {e}")))?;
            let cert = native_tls::Certificate::from_pem(&pem)
                .map_err(|e| CommsError::Tls(e.to_string()))?;
            let connector = native_tls::TlsConnector::builder()
                .add_root_certificate(cert)
                .build()
                .map_err(|e| CommsError::Tls(e.to_string()))?;
            let (stream, _) = connect_async_tls_with_config(
                cfg.url.as_str(),
                None,
                false,
                Some(Connector::NativeTls(connector)),
            )
            .await?;
            Ok(stream)
        } else {
            let (stream, _) = connect_async(cfg.url.as_str()).await?;
            Ok(stream)
        }
    };
    tokio::time::timeout(CONNECTION_TIMEOUT, attempt)
        .await
        .map_err(|_| CommsError::Timeout)?
}

struct ConnContext {
    cfg: WsCfg,
    source_tx: mpsc::Sender<Message>,
    pending: PendingMap,
    shutdown: watch::Receiver<bool>,
}

async fn connection_task(
    mut sink: WsSink,
    mut source: WsSource,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
    mut ctx: ConnContext,
) {
    let mut ping_interval = interval(ctx.cfg.ping_wait / 2);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_inbound = Instant::now();
    let mut reconnect_attempt = 0u32;

    loop {
        tokio::select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        last_inbound = Instant::now();
                        route_inbound(&text, &ctx.source_tx, &ctx.pending).await;
                    }
                    Some(Ok(WsFrame::Ping(data))) => {
                        last_inbound = Instant::now();
                        if let Err(e) = sink.send(WsFrame::Pong(data)).await {
                            tracing::warn!("failed to send pong: {e}");
                        }
                    }
                    Some(Ok(WsFrame::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(WsFrame::Binary(_))) | Some(Ok(WsFrame::Frame(_))) => {}
                    Some(Ok(WsFrame::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("code {}, reason: {}", f.code, f.reason))
                            .unwrap_or_else(|| "no reason".to_string());
                        tracing::info!("websocket closed by peer: {reason}");
                        match re_establish(&ctx, &mut reconnect_attempt).await {
                            Some((new_sink, new_source)) => {
                                sink = new_sink;
                                source = new_source;
                                last_inbound = Instant::now();
                            }
                            None => return,
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("websocket read error: {e}");
                        match re_establish(&ctx, &mut reconnect_attempt).await {
                            Some((new_sink, new_source)) => {
                                sink = new_sink;
                                source = new_source;
                                last_inbound = Instant::now();
                            }
                            None => return,
                        }
                    }
                    None => {
                        tracing::info!("websocket stream ended");
                        match re_establish(&ctx, &mut reconnect_attempt).await {
                            Some((new_sink, new_source)) => {
                                sink = new_sink;
                                source = new_source;
                                last_inbound = Instant::now();
                            }
                            None => return,
                        }
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(LinkCommand::Send(text)) => {
                        if let Err(e) = sink.send(WsFrame::Text(text)).await {
                            tracing::warn!("failed to send message: {e}");
                        }
                    }
                    Some(LinkCommand::Close) | None => {
                        let _ = sink.send(WsFrame::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        }))).await;
                        return;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if last_inbound.elapsed() > ctx.cfg.ping_wait {
                    tracing::warn!(
                        "nothing received within the ping wait ({:?}), reconnecting",
                        ctx.cfg.ping_wait,
                    );
                    match re_establish(&ctx, &mut reconnect_attempt).await {
                        Some((new_sink, new_source)) => {
                            sink = new_sink;
                            source = new_source;
                            last_inbound = Instant::now();
                        }
                        None => return,
                    }
                } else if let Err(e) = sink.send(WsFrame::Ping(Vec::new())).await {
                    tracing::warn!("failed to send ping: {e}");
                }
            }

            changed = ctx.shutdown.changed() => {
                if changed.is_err() || *ctx.shutdown.borrow() {
                    let _ = sink.send(WsFrame::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "shutdown".into(),
                    }))).await;
                    return;
                }
            }
        }
    }
}

/// Parse an inbound frame and either resolve the matching pending request or
/// forward it to the listener. Forwarding applies backpressure: a slow
/// listener blocks the transport, which is the configured policy.
async fn route_inbound(text: &str, source_tx: &mpsc::Sender<Message>, pending: &PendingMap) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("failed to parse inbound message: {e}");
            return;
        }
    };

    if msg.kind == MessageKind::Response {
        if let Some(id) = msg.id {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(msg);
                return;
            }
        }
    }

    if source_tx.send(msg).await.is_err() {
        tracing::debug!("message source receiver dropped");
    }
}

/// Reconnect with jittered exponential backoff. Outstanding requests are
/// failed, and the owner's resubscribe hook runs on success. `None` means
/// the attempts are exhausted and the task should exit.
async fn re_establish(ctx: &ConnContext, attempt: &mut u32) -> Option<(WsSink, WsSource)> {
    ctx.pending.lock().await.clear();

    while *attempt < ctx.cfg.reconnect_attempts {
        *attempt += 1;

        // Full jitter between zero and the exponential delay.
        let ceiling = ctx
            .cfg
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(ctx.cfg.max_delay_ms);
        let delay = rand::thread_rng().gen_range(0..=ceiling);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        match dial(&ctx.cfg).await {
            Ok(stream) => {
                tracing::info!("reconnected to {}", ctx.cfg.url);
                *attempt = 0;
                if let Some(hook) = &ctx.cfg.reconnect_sync {
                    hook();
                }
                return Some(stream.split());
            }
            Err(e) => {
                tracing::error!("reconnect attempt {attempt} to {} failed: {e}", ctx.cfg.url);
            }
        }
    }
    tracing::error!("giving up on {} after {} attempts", ctx.cfg.url, attempt);
    None
}
