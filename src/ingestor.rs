/// Stream ingestor - owns the websocket lifecycle
///
/// Connecting -> Subscribing -> Streaming -> Closed | Failed.
/// A clean close pauses and goes back to Connecting; anything else that breaks
/// the session trips the shutdown flag.

use anyhow::{Context, Result, anyhow};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::models::extract_sender;
use crate::queue::{HandoffSender, PutError};
use crate::settings::{
    PROGRESS_LOG_EVERY, QUEUE_OP_TIMEOUT, SUBSCRIPTION_MSG, WS_INTERMSG_TIMEOUT, WS_RECONNECT_PAUSE,
};
use crate::shutdown::ShutdownFlag;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where to connect and how long each wait may last
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub subscription: String,
    pub reconnect_pause: Duration,
    pub recv_timeout: Duration,
    pub queue_timeout: Duration,
}

impl FeedConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subscription: SUBSCRIPTION_MSG.to_string(),
            reconnect_pause: WS_RECONNECT_PAUSE,
            recv_timeout: WS_INTERMSG_TIMEOUT,
            queue_timeout: QUEUE_OP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Subscribing,
    Streaming,
    Closed,
    Failed,
}

/// Counter of extracted senders, readable from any thread
#[derive(Debug, Clone, Default)]
pub struct IngestorStats {
    received: Arc<AtomicU64>,
}

impl IngestorStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn bump(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// How a connected session ended without error
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Peer or transport closed cleanly; reconnect unless shutting down
    Closed,
    /// Shutdown flag observed
    Shutdown,
}

/// Outcome of one bounded wait on the socket
enum Frame {
    Message(Message),
    Closed,
    Shutdown,
}

pub struct StreamIngestor {
    feed: FeedConfig,
    queue: HandoffSender<String>,
    shutdown: ShutdownFlag,
    stats: IngestorStats,
    state: StreamState,
}

impl StreamIngestor {
    pub fn new(feed: FeedConfig, queue: HandoffSender<String>, shutdown: ShutdownFlag) -> Self {
        Self {
            feed,
            queue,
            shutdown,
            stats: IngestorStats::default(),
            state: StreamState::Connecting,
        }
    }

    pub fn stats(&self) -> IngestorStats {
        self.stats.clone()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Drive sessions until shutdown or a fatal error
    pub async fn run(&mut self) {
        while !self.shutdown.is_set() {
            match self.session().await {
                Ok(SessionEnd::Closed) => {
                    self.state = StreamState::Closed;
                    if self.shutdown.is_set() {
                        info!("[ingestor] Connection closed during shutdown, not reconnecting");
                        break;
                    }
                    info!(
                        "[ingestor] Connection closed, reconnecting in {:?}",
                        self.feed.reconnect_pause
                    );
                    tokio::time::sleep(self.feed.reconnect_pause).await;
                }
                Ok(SessionEnd::Shutdown) => break,
                Err(e) => {
                    self.state = StreamState::Failed;
                    if self.shutdown.is_set() {
                        debug!("[ingestor] Ignoring error during shutdown: {:#}", e);
                    } else {
                        error!("[ingestor] Fatal stream error: {:#}", e);
                        self.shutdown.trigger();
                    }
                    break;
                }
            }
        }
        info!(
            "[ingestor] Stopped after {} received transactions",
            self.stats.received()
        );
    }

    async fn session(&mut self) -> Result<SessionEnd> {
        self.state = StreamState::Connecting;
        let Some(connected) = self.until_shutdown(connect_async(self.feed.url.as_str())).await else {
            debug!("[ingestor] Shutdown during connect");
            return Ok(SessionEnd::Shutdown);
        };
        let (mut ws, _) =
            connected.with_context(|| format!("Failed to connect to {}", self.feed.url))?;
        info!("[ingestor] Connected to {}", self.feed.url);

        self.state = StreamState::Subscribing;
        let subscription = Message::Text(self.feed.subscription.clone());
        if !self.send_frame(&mut ws, subscription, "Failed to send subscription request").await? {
            return Ok(SessionEnd::Shutdown);
        }

        // The first data frame is the confirmation; its shape is not checked
        loop {
            match self.next_frame(&mut ws).await? {
                Frame::Message(Message::Text(_) | Message::Binary(_)) => {
                    debug!("[ingestor] Subscription confirmed");
                    break;
                }
                Frame::Message(Message::Ping(data)) => {
                    if !self.send_frame(&mut ws, Message::Pong(data), "Failed to answer ping").await? {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                Frame::Message(_) => {}
                Frame::Closed => return Ok(SessionEnd::Closed),
                Frame::Shutdown => return Ok(self.close(ws).await),
            }
        }

        self.state = StreamState::Streaming;
        loop {
            let frame = self.next_frame(&mut ws).await?;
            let end = match frame {
                Frame::Message(Message::Text(text)) => self.handle_payload(&text).await?,
                Frame::Message(Message::Binary(bin)) => match String::from_utf8(bin) {
                    Ok(text) => self.handle_payload(&text).await?,
                    Err(_) => {
                        warn!("[ingestor] Skipping non-UTF-8 binary message");
                        None
                    }
                },
                Frame::Message(Message::Ping(data)) => {
                    if self.send_frame(&mut ws, Message::Pong(data), "Failed to answer ping").await? {
                        None
                    } else {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                Frame::Message(_) => None,
                Frame::Closed => Some(SessionEnd::Closed),
                Frame::Shutdown => Some(SessionEnd::Shutdown),
            };

            match end {
                None => {}
                Some(SessionEnd::Shutdown) => return Ok(self.close(ws).await),
                Some(SessionEnd::Closed) => return Ok(SessionEnd::Closed),
            }
        }
    }

    /// Drive `fut` in `recv_timeout` slices, giving up once shutdown is set.
    /// None means shutdown won the race.
    async fn until_shutdown<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            if self.shutdown.is_set() {
                return None;
            }
            if let Ok(out) = tokio::time::timeout(self.feed.recv_timeout, &mut fut).await {
                return Some(out);
            }
        }
    }

    /// Send one frame. Returns false when shutdown interrupted a stalled send.
    async fn send_frame(&self, ws: &mut WsStream, msg: Message, what: &'static str) -> Result<bool> {
        match self.until_shutdown(ws.send(msg)).await {
            Some(sent) => sent.context(what).map(|()| true),
            None => Ok(false),
        }
    }

    /// Wait for the next frame, re-checking the shutdown flag every `recv_timeout`
    async fn next_frame(&self, ws: &mut WsStream) -> Result<Frame> {
        loop {
            if self.shutdown.is_set() {
                return Ok(Frame::Shutdown);
            }
            match tokio::time::timeout(self.feed.recv_timeout, ws.next()).await {
                Err(_) => continue,
                Ok(None) => return Ok(Frame::Closed),
                Ok(Some(Ok(Message::Close(frame)))) => {
                    debug!("[ingestor] Close frame received: {:?}", frame);
                    return Ok(Frame::Closed);
                }
                Ok(Some(Ok(msg))) => return Ok(Frame::Message(msg)),
                Ok(Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))) => {
                    return Ok(Frame::Closed);
                }
                Ok(Some(Err(e))) => return Err(anyhow!(e).context("WebSocket receive failed")),
            }
        }
    }

    /// Parse one data message and enqueue its sender.
    /// Malformed messages are logged and skipped.
    async fn handle_payload(&self, text: &str) -> Result<Option<SessionEnd>> {
        let sender = match extract_sender(text) {
            Ok(sender) => sender,
            Err(e) => {
                warn!("[ingestor] Error parsing a WebSocket message: {}", e);
                return Ok(None);
            }
        };

        let received = self.stats.bump();
        if received % PROGRESS_LOG_EVERY == 0 {
            info!("[ingestor] Currently at {} received transactions", received);
        }

        if self.enqueue(sender).await? {
            Ok(None)
        } else {
            Ok(Some(SessionEnd::Shutdown))
        }
    }

    /// Hand the address to the consumer, retrying on timeout.
    /// Returns false when the item was dropped because shutdown started.
    async fn enqueue(&self, address: String) -> Result<bool> {
        let mut item = address;
        loop {
            match self.queue.put(item, self.feed.queue_timeout).await {
                Ok(()) => return Ok(true),
                Err(PutError::Timeout(back)) => {
                    if self.shutdown.is_set() {
                        debug!("[ingestor] Dropping {} at shutdown", back);
                        return Ok(false);
                    }
                    item = back;
                }
                Err(PutError::Closed(_)) => anyhow::bail!("Handoff queue closed by consumer"),
            }
        }
    }

    /// Best-effort close handshake, bounded by `recv_timeout`
    async fn close(&self, mut ws: WsStream) -> SessionEnd {
        if tokio::time::timeout(self.feed.recv_timeout, ws.close(None)).await.is_err() {
            debug!("[ingestor] Close handshake timed out");
        }
        SessionEnd::Shutdown
    }
}

/// Run the ingestor on a dedicated thread with its own single-threaded runtime
pub fn spawn(
    feed: FeedConfig,
    queue: HandoffSender<String>,
    shutdown: ShutdownFlag,
) -> Result<(JoinHandle<()>, IngestorStats)> {
    let mut ingestor = StreamIngestor::new(feed, queue, shutdown.clone());
    let stats = ingestor.stats();

    let handle = std::thread::Builder::new()
        .name("ingestor".into())
        .spawn(move || {
            let _guard = shutdown.panic_guard();
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("[ingestor] Failed to create tokio runtime: {}", e);
                    shutdown.trigger();
                    return;
                }
            };
            rt.block_on(ingestor.run());
        })
        .context("Failed to spawn ingestor thread")?;

    Ok((handle, stats))
}
