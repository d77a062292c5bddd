// =============================================================================
// Private Session Stream — the per-account user-data stream
// =============================================================================
//
// One connection scoped to a listen key. Three tasks run while the stream is
// up:
//
//   - supervisor: owns the connection, decodes payloads into typed events and
//     performs every reconnect (each one with a freshly created listen key).
//   - keepalive: refreshes the listen key well inside its 60-minute validity.
//   - health: flags the stream when it has been silent for too long *and* the
//     keepalive is failing or overdue. A fresh keepalive alone keeps an idle
//     account healthy.
//
// Only the supervisor replaces the connection; the health task asks for a
// reconnect through a channel.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runtime_config::{millis, secs, SessionConfig};
use crate::stream::backoff::{backoff_delay, with_jitter};
use crate::stream::connection::{Connection, ConnectionConfig, ConnectionEvent};
use crate::stream::events::{decode_user_data, UserDataEvent};
use crate::stream::StreamAlert;

const MIN_KEY_LEN: usize = 8;
const RECONNECT_JITTER: f64 = 0.05;
const KEY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_WAIT: Duration = Duration::from_secs(10);

/// Listen-key lifecycle on the exchange side.
#[async_trait]
pub trait SessionKeyProvider: Send + Sync {
    async fn create_listen_key(&self) -> Result<String>;
    async fn keepalive_listen_key(&self, key: &str) -> Result<()>;
    async fn close_listen_key(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Connecting,
    Connected,
    Stopping,
}

#[derive(Debug, Clone)]
struct SessionKey {
    token: String,
    created_at: Instant,
    last_keepalive: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: SessionState,
    pub messages: u64,
    pub reconnects: u64,
    pub dropped_events: u64,
    pub last_message_secs_ago: Option<u64>,
    pub last_keepalive_secs_ago: Option<u64>,
    pub key_age_secs: Option<u64>,
    pub uptime_secs: u64,
}

struct RunHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PrivateSessionStream {
    base_url: String,
    config: SessionConfig,
    provider: Arc<dyn SessionKeyProvider>,
    alerts: mpsc::UnboundedSender<StreamAlert>,
    parent: CancellationToken,
    state: Mutex<SessionState>,
    run: Mutex<Option<RunHandle>>,
    key: RwLock<Option<SessionKey>>,
    started_at: RwLock<Option<Instant>>,
    connected_at: RwLock<Option<Instant>>,
    last_message: RwLock<Option<Instant>>,
    keepalive_failed: AtomicBool,
    messages: AtomicU64,
    reconnects: AtomicU64,
    dropped_events: AtomicU64,
    next_conn_id: AtomicU64,
}

impl PrivateSessionStream {
    pub fn new(
        base_url: impl Into<String>,
        config: SessionConfig,
        provider: Arc<dyn SessionKeyProvider>,
        alerts: mpsc::UnboundedSender<StreamAlert>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            base_url: base_url.into(),
            config,
            provider,
            alerts,
            parent: parent.clone(),
            state: Mutex::new(SessionState::Stopped),
            run: Mutex::new(None),
            key: RwLock::new(None),
            started_at: RwLock::new(None),
            connected_at: RwLock::new(None),
            last_message: RwLock::new(None),
            keepalive_failed: AtomicBool::new(false),
            messages: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(1),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Create a listen key, connect, and start the background tasks. Decoded
    /// events are pushed to `handler`; a full queue drops the event.
    pub async fn start(self: &Arc<Self>, handler: mpsc::Sender<UserDataEvent>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Stopped {
                bail!("account stream is already {:?}", *state);
            }
            *state = SessionState::Connecting;
        }

        // Leftovers from a session that exhausted its reconnect budget.
        let stale = self.run.lock().take();
        if let Some(stale) = stale {
            stale.cancel.cancel();
            for task in stale.tasks {
                task.abort();
            }
        }

        let cancel = self.parent.child_token();
        let (conn, events) = match self.establish(&cancel).await {
            Ok(pair) => pair,
            Err(e) => {
                *self.state.lock() = SessionState::Stopped;
                return Err(e.context("failed to open account stream"));
            }
        };

        if !self.transition(SessionState::Connecting, SessionState::Connected) {
            // stop() won the race and found no key to close.
            cancel.cancel();
            conn.shutdown(Duration::from_secs(1)).await;
            self.close_key().await;
            bail!("account stream stopped during start");
        }
        *self.started_at.write() = Some(Instant::now());

        let (health_tx, health_rx) = mpsc::channel(1);
        let supervisor = {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { this.supervise(conn, events, health_rx, handler, cancel).await })
        };
        let keepalive = {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { this.keepalive_loop(cancel).await })
        };
        let health = {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { this.health_loop(health_tx, cancel).await })
        };

        *self.run.lock() = Some(RunHandle {
            cancel,
            tasks: vec![supervisor, keepalive, health],
        });
        info!("account stream started");
        Ok(())
    }

    /// Stop the stream and close the listen key. Idempotent and safe under
    /// concurrent calls.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Stopping => return Ok(()),
                SessionState::Stopped if self.run.lock().is_none() => return Ok(()),
                _ => *state = SessionState::Stopping,
            }
        }

        let run = self.run.lock().take();
        if let Some(run) = run {
            run.cancel.cancel();
            let joined =
                tokio::time::timeout(STOP_WAIT, futures_util::future::join_all(run.tasks)).await;
            if joined.is_err() {
                warn!("account stream tasks did not exit within {:?}", STOP_WAIT);
            }
        }

        self.close_key().await;
        *self.state.lock() = SessionState::Stopped;
        info!("account stream stopped");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn stats(&self) -> SessionStats {
        let now = Instant::now();
        let ago = |t: Option<Instant>| t.map(|t| now.saturating_duration_since(t).as_secs());
        let key = self.key.read().clone();
        SessionStats {
            state: self.state(),
            messages: self.messages.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            last_message_secs_ago: ago(*self.last_message.read()),
            last_keepalive_secs_ago: ago(key.as_ref().map(|k| k.last_keepalive)),
            key_age_secs: ago(key.as_ref().map(|k| k.created_at)),
            uptime_secs: ago(*self.started_at.read()).unwrap_or(0),
        }
    }

    // -------------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------------

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Obtain a fresh listen key and dial a connection scoped to it. The
    /// previous key, if any, is closed once the new connection is up.
    async fn establish(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let token = tokio::time::timeout(KEY_REQUEST_TIMEOUT, self.provider.create_listen_key())
            .await
            .map_err(|_| anyhow!("listen key request timed out"))??;
        validate_key(&token)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), token);
        // Reconnects are driven here, each with a fresh key.
        let conn_config = ConnectionConfig {
            max_reconnect_attempts: 0,
            ..ConnectionConfig::default()
        };
        let conn = Connection::new(id, url, conn_config, tx, cancel);
        if let Err(e) = conn.connect().await {
            self.close_token(&token).await;
            return Err(e.context("account stream dial failed"));
        }

        let now = Instant::now();
        let previous = self.key.write().replace(SessionKey {
            token,
            created_at: now,
            last_keepalive: now,
        });
        *self.connected_at.write() = Some(now);
        *self.last_message.write() = None;
        self.keepalive_failed.store(false, Ordering::SeqCst);
        if let Some(previous) = previous {
            self.close_token(&previous.token).await;
        }
        Ok((conn, rx))
    }

    async fn supervise(
        self: Arc<Self>,
        mut conn: Arc<Connection>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut health: mpsc::Receiver<String>,
        handler: mpsc::Sender<UserDataEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let reason = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(ConnectionEvent::Message { text, .. }) => {
                        match self.on_payload(&text, &handler) {
                            Some(reason) => reason,
                            None => continue,
                        }
                    }
                    Some(ConnectionEvent::Error { error, .. }) => format!("connection lost: {error}"),
                    Some(_) => continue,
                    None => "connection event queue closed".to_string(),
                },
                Some(reason) = health.recv() => reason,
            };

            warn!(reason = %reason, "account stream unhealthy — reconnecting");
            conn.shutdown(Duration::from_secs(1)).await;

            match self.reconnect(&cancel).await {
                Some((next_conn, next_events)) => {
                    conn = next_conn;
                    events = next_events;
                    // Verdicts about the old connection are stale now.
                    while health.try_recv().is_ok() {}
                }
                None => break,
            }
        }
        conn.shutdown(Duration::from_secs(1)).await;
        debug!("account stream supervisor exited");
    }

    /// Returns a reconnect reason when the payload demands one.
    fn on_payload(&self, text: &str, handler: &mpsc::Sender<UserDataEvent>) -> Option<String> {
        *self.last_message.write() = Some(Instant::now());
        self.messages.fetch_add(1, Ordering::Relaxed);

        let event = match decode_user_data(text) {
            Ok(Some(event)) => event,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "dropped malformed account stream payload");
                return None;
            }
        };

        if let UserDataEvent::ListenKeyExpired { event_time } = event {
            return Some(format!("listen key expired at {event_time}"));
        }

        if handler.try_send(event).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            warn!("account event queue full or closed — event dropped");
        }
        None
    }

    async fn reconnect(
        &self,
        cancel: &CancellationToken,
    ) -> Option<(Arc<Connection>, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        if !self.transition(SessionState::Connected, SessionState::Connecting) {
            return None;
        }
        let base = millis(self.config.reconnect_base_ms);
        let max = millis(self.config.reconnect_max_ms);
        let mut last_error = String::from("none");

        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = with_jitter(backoff_delay(base, max, attempt), RECONNECT_JITTER, base);
            info!(attempt, delay_ms = delay.as_millis() as u64, "account stream reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish(cancel).await {
                Ok(pair) => {
                    if !self.transition(SessionState::Connecting, SessionState::Connected) {
                        pair.0.shutdown(Duration::from_secs(1)).await;
                        return None;
                    }
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(attempt, "account stream reconnected");
                    return Some(pair);
                }
                Err(e) => {
                    last_error = format!("{e:#}");
                    warn!(attempt, error = %last_error, "account stream reconnect failed");
                }
            }
        }

        let attempts = self.config.max_reconnect_attempts;
        error!(attempts, error = %last_error, "account stream reconnect budget exhausted");
        let _ = self.alerts.send(StreamAlert::SessionExhausted {
            attempts,
            error: last_error,
        });
        self.close_key().await;
        self.transition(SessionState::Connecting, SessionState::Stopped);
        // Takes the keepalive and health tasks down with the supervisor.
        cancel.cancel();
        None
    }

    async fn close_key(&self) {
        let key = self.key.write().take();
        if let Some(key) = key {
            self.close_token(&key.token).await;
        }
    }

    async fn close_token(&self, token: &str) {
        match tokio::time::timeout(KEY_REQUEST_TIMEOUT, self.provider.close_listen_key(token)).await {
            Ok(Ok(())) => debug!("listen key closed"),
            Ok(Err(e)) => warn!(error = %e, "failed to close listen key"),
            Err(_) => warn!("closing listen key timed out"),
        }
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    async fn keepalive_loop(self: Arc<Self>, cancel: CancellationToken) {
        let every = secs(self.config.keepalive_secs.max(1));
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let token = self.key.read().as_ref().map(|k| k.token.clone());
            let Some(token) = token else { continue };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(KEY_REQUEST_TIMEOUT, self.provider.keepalive_listen_key(&token)) => r,
            };
            match outcome {
                Ok(Ok(())) => {
                    if let Some(key) = self.key.write().as_mut() {
                        if key.token == token {
                            key.last_keepalive = Instant::now();
                        }
                    }
                    self.keepalive_failed.store(false, Ordering::SeqCst);
                    debug!("listen key keepalive succeeded");
                }
                Ok(Err(e)) => {
                    self.keepalive_failed.store(true, Ordering::SeqCst);
                    warn!(error = %e, "listen key keepalive failed");
                }
                Err(_) => {
                    self.keepalive_failed.store(true, Ordering::SeqCst);
                    warn!("listen key keepalive timed out");
                }
            }
        }
        debug!("account stream keepalive loop exited");
    }

    async fn health_loop(self: Arc<Self>, verdicts: mpsc::Sender<String>, cancel: CancellationToken) {
        let every = secs(self.config.health_check_secs.max(1));
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if self.state() != SessionState::Connected {
                continue;
            }
            let connected_at = *self.connected_at.read();
            let Some(connected_at) = connected_at else { continue };
            let probe = HealthProbe {
                now: Instant::now(),
                connected_at,
                last_message: *self.last_message.read(),
                last_keepalive: self.key.read().as_ref().map(|k| k.last_keepalive),
                keepalive_failed: self.keepalive_failed.load(Ordering::SeqCst),
            };
            let limits = HealthLimits {
                message_timeout: secs(self.config.message_timeout_secs),
                keepalive_interval: secs(self.config.keepalive_secs),
            };
            if let Some(reason) = assess_health(&probe, &limits) {
                let _ = self.alerts.send(StreamAlert::SessionUnhealthy {
                    reason: reason.clone(),
                });
                let _ = verdicts.try_send(reason);
            }
        }
        debug!("account stream health loop exited");
    }
}

impl std::fmt::Debug for PrivateSessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateSessionStream")
            .field("base_url", &self.base_url)
            .field("state", &self.state())
            .field("listen_key", &"<redacted>")
            .finish()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.len() < MIN_KEY_LEN {
        bail!("listen key too short ({} chars)", key.len());
    }
    Ok(())
}

struct HealthProbe {
    now: Instant,
    connected_at: Instant,
    last_message: Option<Instant>,
    last_keepalive: Option<Instant>,
    keepalive_failed: bool,
}

struct HealthLimits {
    message_timeout: Duration,
    keepalive_interval: Duration,
}

/// `Some(reason)` when the stream should be torn down: silent beyond the
/// message timeout and the keepalive is failing or older than two intervals.
fn assess_health(probe: &HealthProbe, limits: &HealthLimits) -> Option<String> {
    let since = probe.last_message.unwrap_or(probe.connected_at);
    let silence = probe.now.saturating_duration_since(since);
    if silence <= limits.message_timeout {
        return None;
    }

    let keepalive_fresh = !probe.keepalive_failed
        && probe
            .last_keepalive
            .map(|t| probe.now.saturating_duration_since(t) <= limits.keepalive_interval * 2)
            .unwrap_or(false);
    if keepalive_fresh {
        return None;
    }

    Some(format!(
        "no payload for {}s and keepalive {}",
        silence.as_secs(),
        if probe.keepalive_failed { "failing" } else { "overdue" }
    ))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    #[derive(Default)]
    struct FakeKeys {
        created: AtomicU64,
        closed: AtomicU64,
        short: bool,
        /// Key requests after the first that fail before one succeeds again.
        refusals: AtomicU64,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl SessionKeyProvider for FakeKeys {
        async fn create_listen_key(&self) -> Result<String> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            let refused = n > 0
                && self
                    .refusals
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
            if refused {
                bail!("listen key endpoint unavailable");
            }
            if self.short {
                return Ok("abc".into());
            }
            Ok(format!("listenkey-{n:04}"))
        }

        async fn keepalive_listen_key(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn close_listen_key(&self, _key: &str) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const ACCOUNT_UPDATE: &str = r#"{"e":"ACCOUNT_UPDATE","E":1,"T":1,"a":{"m":"ORDER","B":[{"a":"USDT","wb":"100.5","cw":"90","bc":"0"}],"P":[]}}"#;
    const KEY_EXPIRED: &str = r#"{"e":"listenKeyExpired","E":1736996475556}"#;

    /// Socket `n` receives `scripts[n]` (or nothing) and is then held open.
    async fn scripted_server(scripts: Vec<Vec<&'static str>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut n = 0;
            loop {
                let Ok((tcp, _)) = listener.accept().await else { return };
                let script = scripts.get(n).cloned().unwrap_or_default();
                n += 1;
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else { return };
                    for frame in script {
                        if ws.send(Message::Text(frame.to_string())).await.is_err() {
                            return;
                        }
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        format!("ws://{addr}/ws")
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            reconnect_base_ms: 5,
            reconnect_max_ms: 20,
            max_reconnect_attempts: 3,
            ..SessionConfig::default()
        }
    }

    fn new_stream(url: String, keys: Arc<FakeKeys>) -> Arc<PrivateSessionStream> {
        let (alerts, _rx) = mpsc::unbounded_channel();
        PrivateSessionStream::new(url, fast_config(), keys, alerts, &CancellationToken::new())
    }

    async fn next_event(rx: &mut mpsc::Receiver<UserDataEvent>) -> UserDataEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for account event")
            .expect("account event channel closed")
    }

    #[tokio::test]
    async fn delivers_typed_events_and_stops_idempotently() {
        let url = scripted_server(vec![vec![ACCOUNT_UPDATE]]).await;
        let keys = Arc::new(FakeKeys::default());
        let stream = new_stream(url, keys.clone());
        let (tx, mut rx) = mpsc::channel(8);

        stream.start(tx.clone()).await.unwrap();
        assert_eq!(stream.state(), SessionState::Connected);
        assert!(stream.start(tx).await.is_err());

        match next_event(&mut rx).await {
            UserDataEvent::Account(update) => {
                assert_eq!(update.data.balances[0].asset, "USDT");
                assert_eq!(update.data.balances[0].wallet_balance, 100.5);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let (a, b) = tokio::join!(stream.stop(), stream.stop());
        a.unwrap();
        b.unwrap();
        stream.stop().await.unwrap();
        assert_eq!(stream.state(), SessionState::Stopped);
        assert_eq!(keys.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_key_forces_reconnect_with_fresh_key() {
        let url = scripted_server(vec![vec![KEY_EXPIRED], vec![ACCOUNT_UPDATE]]).await;
        let keys = Arc::new(FakeKeys::default());
        let stream = new_stream(url, keys.clone());
        let (tx, mut rx) = mpsc::channel(8);
        stream.start(tx).await.unwrap();

        assert!(matches!(next_event(&mut rx).await, UserDataEvent::Account(_)));
        assert_eq!(keys.created.load(Ordering::SeqCst), 2);
        assert_eq!(stream.stats().reconnects, 1);
        // The expired key was released when its replacement came up.
        assert_eq!(keys.closed.load(Ordering::SeqCst), 1);
        stream.stop().await.unwrap();
        assert_eq!(keys.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_reconnects_alert_and_allow_restart() {
        let url = scripted_server(vec![vec![KEY_EXPIRED], vec![ACCOUNT_UPDATE]]).await;
        let keys = Arc::new(FakeKeys {
            refusals: AtomicU64::new(3),
            ..FakeKeys::default()
        });
        let (alerts, mut alert_rx) = mpsc::unbounded_channel();
        let stream =
            PrivateSessionStream::new(url, fast_config(), keys.clone(), alerts, &CancellationToken::new());
        let (tx, _rx) = mpsc::channel(8);
        stream.start(tx).await.unwrap();

        let alert = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match alert_rx.recv().await {
                    Some(alert @ StreamAlert::SessionExhausted { .. }) => return alert,
                    Some(_) => continue,
                    None => panic!("alert channel closed"),
                }
            }
        })
        .await
        .expect("no exhaustion alert");
        match alert {
            StreamAlert::SessionExhausted { attempts, error } => {
                assert_eq!(attempts, 3);
                assert!(error.contains("unavailable"));
            }
            other => panic!("unexpected alert {other:?}"),
        }

        for _ in 0..200 {
            if stream.state() == SessionState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stream.state(), SessionState::Stopped);
        assert_eq!(keys.closed.load(Ordering::SeqCst), 1);

        let (tx, mut rx) = mpsc::channel(8);
        stream.start(tx).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, UserDataEvent::Account(_)));
        stream.stop().await.unwrap();
        assert_eq!(keys.created.load(Ordering::SeqCst), 5);
        assert_eq!(keys.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_during_start_closes_the_new_key() {
        let url = scripted_server(vec![]).await;
        let keys = Arc::new(FakeKeys {
            delay: Some(Duration::from_millis(200)),
            ..FakeKeys::default()
        });
        let stream = new_stream(url, keys.clone());
        let (tx, _rx) = mpsc::channel(8);

        let starting = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.start(tx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.stop().await.unwrap();

        assert!(starting.await.unwrap().is_err());
        assert_eq!(stream.state(), SessionState::Stopped);
        assert_eq!(keys.created.load(Ordering::SeqCst), 1);
        assert_eq!(keys.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_listen_key_is_rejected() {
        let url = scripted_server(vec![]).await;
        let keys = Arc::new(FakeKeys {
            short: true,
            ..FakeKeys::default()
        });
        let stream = new_stream(url, keys);
        let (tx, _rx) = mpsc::channel(8);
        assert!(stream.start(tx).await.is_err());
        assert_eq!(stream.state(), SessionState::Stopped);
    }

    #[test]
    fn fresh_keepalive_keeps_idle_stream_healthy() {
        let start = Instant::now();
        let limits = HealthLimits {
            message_timeout: Duration::from_secs(3900),
            keepalive_interval: Duration::from_secs(1800),
        };
        let at = |s: u64| start + Duration::from_secs(s);

        // Recent data.
        let probe = HealthProbe {
            now: at(100),
            connected_at: start,
            last_message: Some(at(90)),
            last_keepalive: Some(start),
            keepalive_failed: false,
        };
        assert!(assess_health(&probe, &limits).is_none());

        // Long silence, keepalive fresh.
        let probe = HealthProbe {
            now: at(5000),
            connected_at: start,
            last_message: None,
            last_keepalive: Some(at(3600)),
            keepalive_failed: false,
        };
        assert!(assess_health(&probe, &limits).is_none());

        // Long silence, keepalive failing.
        let probe = HealthProbe {
            keepalive_failed: true,
            ..probe
        };
        assert!(assess_health(&probe, &limits).unwrap().contains("failing"));

        // Long silence, keepalive overdue.
        let probe = HealthProbe {
            now: at(9000),
            connected_at: start,
            last_message: Some(at(10)),
            last_keepalive: Some(at(1800)),
            keepalive_failed: false,
        };
        assert!(assess_health(&probe, &limits).unwrap().contains("overdue"));
    }
}
