// =============================================================================
// Connection — one physical duplex stream with keep-alive and auto-reconnect
// =============================================================================
//
// Each connection is driven by a supervisor task that owns the socket for its
// whole life:
//
//   dial ─▶ session (reader in the supervisor, writer/pinger spawned)
//        ─▶ failure ─▶ backoff ─▶ dial ─▶ session ...
//
// Inbound frames, errors, and reconnect outcomes are published in arrival
// order on a single typed event queue owned by the caller. Outbound frames go
// through an unbounded channel to the writer so no lock is ever held across a
// network write.
//
// `close()` is terminal: the cancellation token is fired and no further
// reconnect is attempted.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runtime_config::{millis, secs, StreamConfig};
use crate::stream::backoff::backoff_delay;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
    /// `0` disables automatic reconnection.
    pub max_reconnect_attempts: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl ConnectionConfig {
    pub fn from_stream(cfg: &StreamConfig) -> Self {
        Self {
            ping_interval: secs(cfg.ping_interval_secs),
            handshake_timeout: secs(cfg.handshake_timeout_secs),
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base: millis(cfg.reconnect_base_ms),
            reconnect_max: millis(cfg.reconnect_max_ms),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_stream(&StreamConfig::default())
    }
}

/// Everything a connection reports to its owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Message { conn_id: u64, text: String },
    Error { conn_id: u64, error: String },
    Reconnected { conn_id: u64, attempt: u32 },
    ReconnectFailed { conn_id: u64, attempt: u32, error: String },
    /// Auto-reconnect gave up; the connection stays down.
    ReconnectExhausted { conn_id: u64, attempts: u32 },
}

impl ConnectionEvent {
    pub fn conn_id(&self) -> u64 {
        match self {
            Self::Message { conn_id, .. }
            | Self::Error { conn_id, .. }
            | Self::Reconnected { conn_id, .. }
            | Self::ReconnectFailed { conn_id, .. }
            | Self::ReconnectExhausted { conn_id, .. } => *conn_id,
        }
    }
}

pub struct Connection {
    id: u64,
    url: String,
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    healthy: AtomicBool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    cancel: CancellationToken,
    reconnect_attempts: AtomicU32,
    streams: RwLock<HashSet<String>>,
    last_used: RwLock<Instant>,
    last_message: RwLock<Option<Instant>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        id: u64,
        url: impl Into<String>,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            url: url.into(),
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            healthy: AtomicBool::new(false),
            events,
            outbound: Mutex::new(None),
            cancel: parent.child_token(),
            reconnect_attempts: AtomicU32::new(0),
            streams: RwLock::new(HashSet::new()),
            last_used: RwLock::new(Instant::now()),
            last_message: RwLock::new(None),
            supervisor: Mutex::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Public contract
    // -------------------------------------------------------------------------

    /// Dial the endpoint and start the read and keep-alive loops.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            bail!("connection {} is closed", self.id);
        }
        if self.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let ws = match self.dial().await {
            Ok(ws) => ws,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let rx = self
            .install(ws)
            .with_context(|| format!("connection {} closed during connect", self.id))?;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.supervise(rx).await });
        *self.supervisor.lock() = Some(handle);

        info!(conn_id = self.id, url = %self.url, "stream connection established");
        Ok(())
    }

    /// Queue a text frame for sending.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        if !self.is_connected() {
            bail!("connection {} is not connected", self.id);
        }
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("connection {} has no active session", self.id))?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| anyhow!("connection {} writer has stopped", self.id))?;
        *self.last_used.write() = Instant::now();
        Ok(())
    }

    /// Close permanently. Idempotent.
    pub fn close(&self) -> Result<()> {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, ConnectionState::Closed)
        };
        if previous == ConnectionState::Closed {
            return Ok(());
        }
        self.healthy.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        *self.outbound.lock() = None;
        info!(conn_id = self.id, "stream connection closed");
        Ok(())
    }

    /// Close and wait (bounded) for the supervisor task to exit.
    pub async fn shutdown(&self, wait: Duration) {
        let _ = self.close();
        let handle = self.supervisor.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(wait, &mut handle).await.is_err() {
                warn!(conn_id = self.id, "connection task did not exit in time — aborting");
                handle.abort();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == ConnectionState::Connected && self.healthy.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.state.read() == ConnectionState::Closed
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.read()
    }

    pub fn last_message(&self) -> Option<Instant> {
        *self.last_message.read()
    }

    // ── Stream bookkeeping (a cache of the owner's desired set) ──────────

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    pub fn has_stream(&self, stream: &str) -> bool {
        self.streams.read().contains(stream)
    }

    pub fn streams(&self) -> Vec<String> {
        self.streams.read().iter().cloned().collect()
    }

    pub fn add_streams(&self, streams: &[String]) {
        let mut set = self.streams.write();
        set.extend(streams.iter().cloned());
        *self.last_used.write() = Instant::now();
    }

    pub fn remove_stream(&self, stream: &str) -> bool {
        self.streams.write().remove(stream)
    }

    pub fn take_streams(&self) -> Vec<String> {
        self.streams.write().drain().collect()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            debug!(conn_id = self.id, "event receiver dropped");
        }
    }

    async fn dial(&self) -> Result<WsStream> {
        let (ws, _response) =
            tokio::time::timeout(self.config.handshake_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| anyhow!("handshake timed out after {:?}", self.config.handshake_timeout))?
                .with_context(|| format!("failed to dial {}", self.url))?;
        Ok(ws)
    }

    /// Wire a freshly dialled socket in as the active session.
    fn install(&self, ws: WsStream) -> Option<SessionParts> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Closed {
                return None;
            }
            *self.outbound.lock() = Some(tx);
            self.healthy.store(true, Ordering::SeqCst);
            *state = ConnectionState::Connected;
        }
        Some(SessionParts { ws, outbound: rx })
    }

    async fn supervise(self: Arc<Self>, first: SessionParts) {
        let mut parts = first;
        loop {
            let failure = self.run_session(parts).await;
            *self.outbound.lock() = None;

            let reason = match failure {
                Some(reason) if !self.is_closed() => reason,
                _ => break,
            };

            self.healthy.store(false, Ordering::SeqCst);
            self.set_state(ConnectionState::Disconnected);
            warn!(conn_id = self.id, reason = %reason, "stream connection lost");
            self.emit(ConnectionEvent::Error {
                conn_id: self.id,
                error: reason,
            });

            if self.config.max_reconnect_attempts == 0 {
                break;
            }
            match self.reconnect().await {
                Some(next) => parts = next,
                None => break,
            }
        }
        debug!(conn_id = self.id, "connection supervisor exited");
    }

    /// Run one socket session. Returns the failure reason, or `None` when
    /// the session ended because of cancellation.
    async fn run_session(&self, parts: SessionParts) -> Option<String> {
        let (sink, mut stream) = parts.ws.split();
        let session = self.cancel.child_token();
        let writer = tokio::spawn(write_loop(
            sink,
            parts.outbound,
            self.config.ping_interval,
            session.clone(),
        ));

        let read_failure = loop {
            tokio::select! {
                _ = session.cancelled() => break None,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.deliver(text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.deliver(text),
                        Err(_) => debug!(conn_id = self.id, "non-UTF-8 binary frame dropped"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break Some(format!("closed by peer: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(format!("read error: {e}")),
                    None => break Some("stream ended".to_string()),
                },
            }
        };
        session.cancel();

        let write_failure = match writer.await {
            Ok(outcome) => outcome,
            Err(e) => Some(format!("writer task failed: {e}")),
        };

        if self.cancel.is_cancelled() {
            return None;
        }
        read_failure.or(write_failure)
    }

    fn deliver(&self, text: String) {
        *self.last_message.write() = Some(Instant::now());
        self.emit(ConnectionEvent::Message {
            conn_id: self.id,
            text,
        });
    }

    async fn reconnect(&self) -> Option<SessionParts> {
        loop {
            if self.cancel.is_cancelled() || self.is_closed() {
                return None;
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_reconnect_attempts {
                error!(
                    conn_id = self.id,
                    attempts = self.config.max_reconnect_attempts,
                    "reconnect attempts exhausted — giving up"
                );
                self.set_state(ConnectionState::Disconnected);
                self.emit(ConnectionEvent::ReconnectExhausted {
                    conn_id: self.id,
                    attempts: self.config.max_reconnect_attempts,
                });
                return None;
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff_delay(self.config.reconnect_base, self.config.reconnect_max, attempt);
            info!(conn_id = self.id, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.dial().await {
                Ok(ws) => {
                    let parts = self.install(ws)?;
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    info!(conn_id = self.id, attempt, "stream connection re-established");
                    self.emit(ConnectionEvent::Reconnected {
                        conn_id: self.id,
                        attempt,
                    });
                    return Some(parts);
                }
                Err(e) => {
                    warn!(conn_id = self.id, attempt, error = %e, "reconnect attempt failed");
                    self.emit(ConnectionEvent::ReconnectFailed {
                        conn_id: self.id,
                        attempt,
                        error: format!("{e:#}"),
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("state", &self.state())
            .field("healthy", &self.is_healthy())
            .field("streams", &self.stream_count())
            .finish()
    }
}

struct SessionParts {
    ws: WsStream,
    outbound: mpsc::UnboundedReceiver<Message>,
}

/// Writer half: forwards queued frames and sends pings. Any write failure
/// cancels the session so the reader stops too.
async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    ping_every: Duration,
    session: CancellationToken,
) -> Option<String> {
    let start = tokio::time::Instant::now() + ping_every;
    let mut ping = tokio::time::interval_at(start, ping_every);

    let failure = loop {
        tokio::select! {
            _ = session.cancelled() => break None,
            msg = outbound.recv() => match msg {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        break Some(format!("send failed: {e}"));
                    }
                }
                None => break None,
            },
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break Some(format!("ping failed: {e}"));
                }
            }
        }
    };

    session.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
    failure
}

// =============================================================================
// Tests
// =============================================================================
