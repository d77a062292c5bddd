// =============================================================================
// Stream Pool — many logical subscriptions multiplexed over a few connections
// =============================================================================
//
// The pool owns the *desired set*: the authoritative list of stream names the
// operator wants. Connections only cache which of those they carry. Two tasks
// run per pool:
//
//   - maintenance: flushes queued SUBSCRIBE/UNSUBSCRIBE requests in small
//     paced batches and runs the periodic health check. It is the only task
//     that opens connections.
//   - dispatcher: drains the shared connection event queue, decodes payloads,
//     and hands them to the registered `MarketEventHandler`.
//
// After a health check every desired stream is either attached to a live
// connection or queued for the next flush.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runtime_config::{millis, secs, StreamConfig};
use crate::stream::backoff::MessagePacer;
use crate::stream::connection::{Connection, ConnectionConfig, ConnectionEvent};
use crate::stream::events::{decode_market, MarketPayload};
use crate::stream::StreamAlert;
use crate::types::{MarkPriceUpdate, Ticker};

/// Batches at or below this size are processed inline.
const INLINE_BATCH_LIMIT: usize = 10;
const STOP_WAIT: Duration = Duration::from_secs(10);

/// Consumer of decoded public market events.
#[async_trait]
pub trait MarketEventHandler: Send + Sync {
    async fn on_mark_price(&self, update: MarkPriceUpdate) -> Result<()>;
    async fn on_book_ticker(&self, ticker: Ticker) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionOp {
    fn method(&self) -> &'static str {
        match self {
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
        }
    }
}

/// FIFO of pending requests with per-(op, stream) de-duplication.
#[derive(Debug, Default)]
struct PendingQueue {
    order: VecDeque<(SubscriptionOp, String)>,
    keys: HashSet<(SubscriptionOp, String)>,
}

impl PendingQueue {
    fn push(&mut self, op: SubscriptionOp, stream: String) {
        if self.keys.insert((op, stream.clone())) {
            self.order.push_back((op, stream));
        }
    }

    fn cancel(&mut self, op: SubscriptionOp, stream: &str) {
        if self.keys.remove(&(op, stream.to_string())) {
            self.order.retain(|(o, s)| !(*o == op && s == stream));
        }
    }

    fn contains(&self, op: SubscriptionOp, stream: &str) -> bool {
        self.keys.contains(&(op, stream.to_string()))
    }

    /// Pop up to `max` leading requests that share the first request's op.
    fn take_batch(&mut self, max: usize) -> Option<(SubscriptionOp, Vec<String>)> {
        let op = self.order.front()?.0;
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.order.front() {
                Some((o, _)) if *o == op => {
                    if let Some((_, stream)) = self.order.pop_front() {
                        self.keys.remove(&(op, stream.clone()));
                        batch.push(stream);
                    }
                }
                _ => break,
            }
        }
        Some((op, batch))
    }

    /// Put a batch back at the head of the queue, preserving its order.
    fn requeue_front(&mut self, op: SubscriptionOp, streams: Vec<String>) {
        for stream in streams.into_iter().rev() {
            if self.keys.insert((op, stream.clone())) {
                self.order.push_front((op, stream));
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub connections: usize,
    pub healthy_connections: usize,
    pub desired_streams: usize,
    pub attached_streams: usize,
    pub pending_requests: usize,
    pub messages: u64,
    pub protocol_errors: u64,
    pub parse_errors: u64,
}

pub struct StreamPool {
    config: StreamConfig,
    conn_config: ConnectionConfig,
    handler: Arc<dyn MarketEventHandler>,
    alerts: mpsc::UnboundedSender<StreamAlert>,
    connections: RwLock<Vec<Arc<Connection>>>,
    desired: RwLock<HashSet<String>>,
    pending: Mutex<PendingQueue>,
    pending_notify: Notify,
    pacer: MessagePacer,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    flushing: AtomicBool,
    pool_degraded: AtomicBool,
    next_conn_id: AtomicU64,
    next_request_id: AtomicU64,
    messages: AtomicU64,
    protocol_errors: AtomicU64,
    parse_errors: AtomicU64,
}

impl StreamPool {
    pub fn new(
        config: StreamConfig,
        handler: Arc<dyn MarketEventHandler>,
        alerts: mpsc::UnboundedSender<StreamAlert>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            conn_config: ConnectionConfig::from_stream(&config),
            pacer: MessagePacer::new(millis(config.message_interval_ms)),
            config,
            handler,
            alerts,
            connections: RwLock::new(Vec::new()),
            desired: RwLock::new(HashSet::new()),
            pending: Mutex::new(PendingQueue::default()),
            pending_notify: Notify::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: parent.child_token(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            pool_degraded: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
            messages: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let events_rx = self.events_rx.lock().take();
        let Some(events_rx) = events_rx else {
            bail!("stream pool cannot be restarted");
        };

        // One warm connection up front; failure here is not fatal because
        // the maintenance task keeps trying.
        if let Err(e) = self.open_connection().await {
            warn!(error = %e, "initial stream connection failed — will retry on next flush");
        }

        let dispatcher = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.dispatch_loop(events_rx).await })
        };
        let maintenance = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.maintenance_loop().await })
        };
        self.tasks.lock().extend([dispatcher, maintenance]);

        info!(
            url = %self.config.url,
            max_connections = self.config.max_connections,
            streams_per_connection = self.config.streams_per_connection,
            "stream pool started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let joined = tokio::time::timeout(STOP_WAIT, futures_util::future::join_all(tasks)).await;
        if joined.is_err() {
            warn!("stream pool tasks did not exit within {:?}", STOP_WAIT);
        }

        let conns: Vec<Arc<Connection>> = self.connections.write().drain(..).collect();
        futures_util::future::join_all(conns.iter().map(|c| c.shutdown(Duration::from_secs(1)))).await;
        info!("stream pool stopped");
    }

    // -------------------------------------------------------------------------
    // Subscription surface
    // -------------------------------------------------------------------------

    pub fn subscribe(&self, stream: &str) -> Result<()> {
        let stream = stream.trim();
        if stream.is_empty() {
            bail!("stream name must not be empty");
        }
        if self.cancel.is_cancelled() {
            bail!("stream pool is stopped");
        }

        self.desired.write().insert(stream.to_string());
        // `connections` is never read while `pending` is held.
        let attached = self.is_attached(stream);
        {
            let mut pending = self.pending.lock();
            pending.cancel(SubscriptionOp::Unsubscribe, stream);
            if !attached {
                pending.push(SubscriptionOp::Subscribe, stream.to_string());
            }
        }
        self.pending_notify.notify_one();
        Ok(())
    }

    pub fn unsubscribe(&self, stream: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("stream pool is stopped");
        }
        let removed = self.desired.write().remove(stream);
        let attached = self.is_attached(stream);
        {
            let mut pending = self.pending.lock();
            pending.cancel(SubscriptionOp::Subscribe, stream);
            if attached {
                pending.push(SubscriptionOp::Unsubscribe, stream.to_string());
            }
        }
        if removed {
            self.pending_notify.notify_one();
        }
        Ok(())
    }

    pub fn desired_streams(&self) -> Vec<String> {
        let mut v: Vec<String> = self.desired.read().iter().cloned().collect();
        v.sort();
        v
    }

    /// True when some live connection currently carries `stream`.
    pub fn is_attached(&self, stream: &str) -> bool {
        self.connections
            .read()
            .iter()
            .any(|c| c.is_connected() && c.has_stream(stream))
    }

    pub fn stats(&self) -> PoolStats {
        let (connections, healthy_connections, attached_streams) = {
            let conns = self.connections.read();
            (
                conns.len(),
                conns.iter().filter(|c| c.is_connected()).count(),
                conns.iter().map(|c| c.stream_count()).sum(),
            )
        };
        PoolStats {
            connections,
            healthy_connections,
            desired_streams: self.desired.read().len(),
            attached_streams,
            pending_requests: self.pending.lock().len(),
            messages: self.messages.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance: batching and health
    // -------------------------------------------------------------------------

    async fn maintenance_loop(self: Arc<Self>) {
        let mut batch_tick = tokio::time::interval(millis(self.config.batch_interval_ms.max(1)));
        let health_every = secs(self.config.health_check_secs.max(1));
        let mut health_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + health_every, health_every);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = batch_tick.tick() => self.flush_pending().await,
                _ = self.pending_notify.notified() => self.flush_pending().await,
                _ = health_tick.tick() => self.check_health().await,
            }
        }
        debug!("stream pool maintenance loop exited");
    }

    /// Send queued requests until the queue is empty or a batch fails.
    async fn flush_pending(&self) {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = FlagGuard(&self.flushing);

        while !self.cancel.is_cancelled() {
            let batch = self.pending.lock().take_batch(self.config.batch_size.max(1));
            let Some((op, streams)) = batch else { break };
            let ok = match op {
                SubscriptionOp::Subscribe => self.send_subscribe_batch(streams).await,
                SubscriptionOp::Unsubscribe => {
                    self.send_unsubscribe_batch(streams).await;
                    true
                }
            };
            if !ok {
                break;
            }
        }
    }

    async fn send_subscribe_batch(&self, streams: Vec<String>) -> bool {
        // Drop anything removed from the desired set or attached meanwhile.
        let streams: Vec<String> = {
            let desired = self.desired.read();
            streams
                .into_iter()
                .filter(|s| desired.contains(s))
                .collect()
        };
        let streams: Vec<String> = streams.into_iter().filter(|s| !self.is_attached(s)).collect();
        if streams.is_empty() {
            return true;
        }

        let conn = match self.select_best_connection().await {
            Ok(c) => c,
            Err(e) => {
                if !self.pool_degraded.swap(true, Ordering::SeqCst) {
                    error!(error = %e, pending = streams.len(), "no stream connection available");
                    let _ = self.alerts.send(StreamAlert::PoolUnavailable {
                        error: format!("{e:#}"),
                    });
                }
                self.pending.lock().requeue_front(SubscriptionOp::Subscribe, streams);
                return false;
            }
        };
        self.pool_degraded.store(false, Ordering::SeqCst);

        let room = self
            .config
            .streams_per_connection
            .saturating_sub(conn.stream_count());
        let mut streams = streams;
        let overflow = if streams.len() > room {
            streams.split_off(room)
        } else {
            Vec::new()
        };
        if !overflow.is_empty() {
            self.pending.lock().requeue_front(SubscriptionOp::Subscribe, overflow);
        }

        if let Err(e) = self.send_request(&conn, SubscriptionOp::Subscribe, &streams).await {
            warn!(conn_id = conn.id(), count = streams.len(), error = %e, "subscribe batch failed — re-queued");
            self.pending.lock().requeue_front(SubscriptionOp::Subscribe, streams);
            return false;
        }
        conn.add_streams(&streams);
        debug!(conn_id = conn.id(), count = streams.len(), "subscribe batch sent");

        // An unsubscribe that ran while this batch was in flight saw the
        // stream neither queued nor attached, so it is undone here.
        let withdrawn: Vec<String> = {
            let desired = self.desired.read();
            streams.into_iter().filter(|s| !desired.contains(s)).collect()
        };
        if !withdrawn.is_empty() {
            debug!(conn_id = conn.id(), count = withdrawn.len(), "streams withdrawn mid-batch");
            let mut pending = self.pending.lock();
            for s in withdrawn {
                pending.push(SubscriptionOp::Unsubscribe, s);
            }
        }
        true
    }

    async fn send_unsubscribe_batch(&self, streams: Vec<String>) {
        let conns = self.connections.read().clone();
        for conn in conns {
            let owned: Vec<String> = streams.iter().filter(|s| conn.has_stream(s)).cloned().collect();
            if owned.is_empty() {
                continue;
            }
            if conn.is_connected() {
                if let Err(e) = self.send_request(&conn, SubscriptionOp::Unsubscribe, &owned).await {
                    debug!(conn_id = conn.id(), error = %e, "unsubscribe send failed");
                }
            }
            for s in &owned {
                conn.remove_stream(s);
            }
        }
    }

    async fn send_request(
        &self,
        conn: &Connection,
        op: SubscriptionOp,
        streams: &[String],
    ) -> Result<()> {
        self.pacer.acquire().await;
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({ "method": op.method(), "params": streams, "id": id });
        conn.send(frame.to_string())
    }

    /// Least-loaded live connection, opening a new one pre-emptively when
    /// every live connection is at or above half capacity.
    async fn select_best_connection(&self) -> Result<Arc<Connection>> {
        let capacity = self.config.streams_per_connection.max(1);
        let half = (capacity / 2).max(1);

        let (best, open) = {
            let conns = self.connections.read();
            let best = conns
                .iter()
                .filter(|c| c.is_connected())
                .min_by_key(|c| c.stream_count())
                .cloned();
            (best, conns.len())
        };

        if let Some(c) = &best {
            if c.stream_count() < half {
                return Ok(Arc::clone(c));
            }
        }

        if open < self.config.max_connections {
            match self.open_connection().await {
                Ok(c) => return Ok(c),
                Err(e) if best.is_none() => return Err(e),
                Err(e) => warn!(error = %e, "could not open extra connection — using existing one"),
            }
        }

        match best {
            Some(c) if c.stream_count() < capacity => Ok(c),
            _ => bail!(
                "no connection with spare capacity ({open}/{} open)",
                self.config.max_connections
            ),
        }
    }

    async fn open_connection(&self) -> Result<Arc<Connection>> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(
            id,
            self.config.url.clone(),
            self.conn_config.clone(),
            self.events_tx.clone(),
            &self.cancel,
        );
        conn.connect().await?;
        self.connections.write().push(Arc::clone(&conn));
        info!(conn_id = id, total = self.connections.read().len(), "stream pool connection added");
        Ok(conn)
    }

    /// Remove dead connections and restore every desired stream that is no
    /// longer carried by a live connection.
    pub async fn check_health(&self) {
        let dead: Vec<Arc<Connection>> = {
            let mut conns = self.connections.write();
            let (dead, alive): (Vec<_>, Vec<_>) =
                conns.drain(..).partition(|c| !c.is_connected());
            *conns = alive;
            dead
        };

        let mut lost = HashSet::new();
        for conn in &dead {
            lost.extend(conn.take_streams());
            let _ = conn.close();
        }
        if !dead.is_empty() {
            warn!(removed = dead.len(), lost_streams = lost.len(), "removed unhealthy stream connections");
        }

        let attached: HashSet<String> = self
            .connections
            .read()
            .iter()
            .flat_map(|c| c.streams())
            .collect();
        let (restore, surplus) = {
            let desired = self.desired.read();
            let mut pending = self.pending.lock();
            let missing = missing_streams(&desired, &attached, |s| {
                pending.contains(SubscriptionOp::Subscribe, s)
            });
            for s in &missing {
                pending.push(SubscriptionOp::Subscribe, s.clone());
            }
            let surplus = surplus_streams(&desired, &attached, |s| {
                pending.contains(SubscriptionOp::Unsubscribe, s)
            });
            for s in &surplus {
                pending.push(SubscriptionOp::Unsubscribe, s.clone());
            }
            (missing, surplus)
        };

        if !restore.is_empty() {
            info!(count = restore.len(), "restoring desired streams");
        }
        if !surplus.is_empty() {
            info!(count = surplus.len(), "dropping streams no longer desired");
        }
        self.flush_pending().await;
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    async fn dispatch_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            self.on_connection_event(event).await;
        }
        debug!("stream pool dispatcher exited");
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { text, .. } => {
                self.messages.fetch_add(1, Ordering::Relaxed);
                self.handle_payload(&text).await;
            }
            ConnectionEvent::Error { conn_id, error } => {
                debug!(conn_id, error = %error, "stream connection reported an error");
            }
            ConnectionEvent::Reconnected { conn_id, attempt } => {
                // A fresh socket carries no subscriptions.
                let conn = self
                    .connections
                    .read()
                    .iter()
                    .find(|c| c.id() == conn_id)
                    .cloned();
                if let Some(conn) = conn {
                    let previous = conn.take_streams();
                    let desired = self.desired.read().clone();
                    let mut pending = self.pending.lock();
                    let mut count = 0;
                    for s in previous.into_iter().filter(|s| desired.contains(s)) {
                        pending.push(SubscriptionOp::Subscribe, s);
                        count += 1;
                    }
                    drop(pending);
                    info!(conn_id, attempt, resubscribing = count, "stream connection reconnected");
                    self.pending_notify.notify_one();
                }
            }
            ConnectionEvent::ReconnectFailed { conn_id, attempt, error } => {
                debug!(conn_id, attempt, error = %error, "stream reconnect attempt failed");
            }
            ConnectionEvent::ReconnectExhausted { conn_id, attempts } => {
                error!(conn_id, attempts, "stream connection exhausted its reconnect budget");
                let _ = self
                    .alerts
                    .send(StreamAlert::ConnectionExhausted { conn_id, attempts });
            }
        }
    }

    /// Decode one payload and hand it to the handler. Bad payloads are
    /// counted and dropped.
    pub(crate) async fn handle_payload(&self, text: &str) {
        match decode_market(text) {
            Ok(MarketPayload::MarkPrices { updates, rejected }) => {
                if rejected > 0 {
                    self.parse_errors.fetch_add(rejected as u64, Ordering::Relaxed);
                    debug!(rejected, "dropped malformed mark-price items");
                }
                self.fan_out(updates).await;
            }
            Ok(MarketPayload::BookTicker(ticker)) => {
                let symbol = ticker.symbol.clone();
                if let Err(e) = self.handler.on_book_ticker(ticker).await {
                    warn!(symbol = %symbol, error = %e, "book ticker handler failed");
                }
            }
            Ok(MarketPayload::Ack { id }) => debug!(?id, "subscription request acknowledged"),
            Ok(MarketPayload::ProtocolError(err)) => {
                self.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "stream protocol error");
            }
            Ok(MarketPayload::Ignored(kind)) => debug!(kind = %kind, "ignored stream event"),
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "dropped malformed stream payload");
            }
        }
    }

    async fn fan_out(&self, updates: Vec<MarkPriceUpdate>) {
        let workers = worker_count(updates.len(), self.config.process_concurrency);
        if workers <= 1 {
            for update in updates {
                self.deliver_mark_price(update).await;
            }
            return;
        }
        futures_util::stream::iter(updates)
            .for_each_concurrent(workers, |update| self.deliver_mark_price(update))
            .await;
    }

    async fn deliver_mark_price(&self, update: MarkPriceUpdate) {
        let symbol = update.symbol.clone();
        if let Err(e) = self.handler.on_mark_price(update).await {
            warn!(symbol = %symbol, error = %e, "mark price handler failed");
        }
    }
}

impl std::fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPool")
            .field("url", &self.config.url)
            .field("stats", &self.stats())
            .finish()
    }
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Worker count for a batch of `n` items: inline for small batches,
/// otherwise `min(configured, n/10 + 1)`.
pub(crate) fn worker_count(n: usize, configured: usize) -> usize {
    if n <= INLINE_BATCH_LIMIT {
        1
    } else {
        (n / 10 + 1).min(configured.max(1))
    }
}

/// Desired streams that are neither attached nor already queued, sorted.
fn missing_streams(
    desired: &HashSet<String>,
    attached: &HashSet<String>,
    is_queued: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut missing: Vec<String> = desired
        .iter()
        .filter(|s| !attached.contains(*s) && !is_queued(s))
        .cloned()
        .collect();
    missing.sort();
    missing
}

/// Attached streams that left the desired set and have no queued
/// unsubscribe, sorted.
fn surplus_streams(
    desired: &HashSet<String>,
    attached: &HashSet<String>,
    is_queued: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut surplus: Vec<String> = attached
        .iter()
        .filter(|s| !desired.contains(*s) && !is_queued(s))
        .cloned()
        .collect();
    surplus.sort();
    surplus
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    #[derive(Default)]
    struct Recorder {
        marks: Mutex<Vec<String>>,
        tickers: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MarketEventHandler for Recorder {
        async fn on_mark_price(&self, update: MarkPriceUpdate) -> Result<()> {
            if update.symbol == "FAILUSDT" {
                bail!("handler rejected");
            }
            self.marks.lock().push(update.symbol);
            Ok(())
        }

        async fn on_book_ticker(&self, ticker: Ticker) -> Result<()> {
            self.tickers.lock().push(ticker.symbol);
            Ok(())
        }
    }

    fn test_config(url: String) -> StreamConfig {
        StreamConfig {
            url,
            max_connections: 3,
            streams_per_connection: 4,
            max_reconnect_attempts: 0,
            batch_size: 3,
            batch_interval_ms: 10,
            health_check_secs: 3600,
            message_interval_ms: 1,
            ..StreamConfig::default()
        }
    }

    /// Loopback exchange: acknowledges every request. Cancelling the
    /// returned token hangs up every socket accepted before the cancel; later
    /// sockets get a fresh token.
    async fn exchange_server() -> (String, Arc<Mutex<CancellationToken>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let generation = Arc::new(Mutex::new(CancellationToken::new()));
        let current = generation.clone();
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else { return };
                let kill = {
                    let mut token = current.lock();
                    if token.is_cancelled() {
                        *token = CancellationToken::new();
                    }
                    token.clone()
                };
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else { return };
                    loop {
                        tokio::select! {
                            _ = kill.cancelled() => return,
                            msg = ws.next() => match msg {
                                Some(Ok(Message::Text(t))) => {
                                    let req: serde_json::Value = serde_json::from_str(&t).unwrap();
                                    let ack = json!({"result": null, "id": req["id"]});
                                    if ws.send(Message::Text(ack.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                                Some(Ok(_)) => {}
                                _ => return,
                            },
                        }
                    }
                });
            }
        });
        (format!("ws://{addr}"), generation)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    fn new_pool(url: String) -> (Arc<StreamPool>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let (alerts, _rx) = mpsc::unbounded_channel();
        let pool = StreamPool::new(test_config(url), recorder.clone(), alerts, &CancellationToken::new());
        (pool, recorder)
    }

    #[test]
    fn worker_count_scales_with_batch_size() {
        assert_eq!(worker_count(0, 20), 1);
        assert_eq!(worker_count(10, 20), 1);
        assert_eq!(worker_count(11, 20), 2);
        assert_eq!(worker_count(95, 20), 10);
        assert_eq!(worker_count(500, 20), 20);
        assert_eq!(worker_count(500, 0), 1);
    }

    #[test]
    fn pending_queue_dedups_and_batches_by_op() {
        let mut q = PendingQueue::default();
        q.push(SubscriptionOp::Subscribe, "a".into());
        q.push(SubscriptionOp::Subscribe, "a".into());
        q.push(SubscriptionOp::Subscribe, "b".into());
        q.push(SubscriptionOp::Unsubscribe, "c".into());
        q.push(SubscriptionOp::Subscribe, "d".into());
        assert_eq!(q.len(), 4);

        let (op, batch) = q.take_batch(10).unwrap();
        assert_eq!(op, SubscriptionOp::Subscribe);
        assert_eq!(batch, vec!["a", "b"]);

        let (op, batch) = q.take_batch(10).unwrap();
        assert_eq!(op, SubscriptionOp::Unsubscribe);
        assert_eq!(batch, vec!["c"]);

        q.requeue_front(SubscriptionOp::Subscribe, vec!["x".into(), "y".into()]);
        let (_, batch) = q.take_batch(10).unwrap();
        assert_eq!(batch, vec!["x", "y", "d"]);
        assert!(q.take_batch(10).is_none());
    }

    #[test]
    fn removed_streams_are_not_restored() {
        let desired: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let attached: HashSet<String> = ["a", "gone"].iter().map(|s| s.to_string()).collect();
        let missing = missing_streams(&desired, &attached, |s| s == "c");
        assert_eq!(missing, vec!["b"]);

        let attached: HashSet<String> = ["a", "gone", "queued"].iter().map(|s| s.to_string()).collect();
        let surplus = surplus_streams(&desired, &attached, |s| s == "queued");
        assert_eq!(surplus, vec!["gone"]);
    }

    #[test]
    fn stats_and_subscription_changes_do_not_deadlock() {
        use std::sync::atomic::AtomicUsize;

        let (pool, _) = new_pool("ws://127.0.0.1:1".into());
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let spawn = |work: Box<dyn Fn(&StreamPool) + Send>| {
            let pool = pool.clone();
            let stop = stop.clone();
            let progress = progress.clone();
            let done = done_tx.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    work(&pool);
                    progress.fetch_add(1, Ordering::Relaxed);
                }
                let _ = done.send(());
            });
        };
        spawn(Box::new(|p: &StreamPool| {
            let _ = p.stats();
        }));
        spawn(Box::new(|p: &StreamPool| {
            p.subscribe("ethusdt@bookTicker").unwrap();
            p.unsubscribe("ethusdt@bookTicker").unwrap();
        }));
        spawn(Box::new(|p: &StreamPool| drop(p.connections.write())));
        drop(done_tx);

        let mut last = 0;
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(50));
            let now = progress.load(Ordering::Relaxed);
            assert!(now > last, "pool locks stopped making progress");
            last = now;
        }
        stop.store(true, Ordering::Relaxed);
        for _ in 0..3 {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("worker thread wedged on pool locks");
        }
    }

    #[tokio::test]
    async fn malformed_payloads_are_counted_not_fatal() {
        let (pool, recorder) = new_pool("ws://127.0.0.1:1".into());

        let mut items: Vec<serde_json::Value> = (0..24)
            .map(|i| json!({"e":"markPriceUpdate","E":1,"s":format!("S{i}USDT"),"p":"1.5","i":"1.4","r":"0.0001","T":2}))
            .collect();
        items.push(json!({"e":"markPriceUpdate","s":"BROKEN"}));
        items.push(json!({"e":"markPriceUpdate","E":1,"s":"FAILUSDT","p":"1","i":"1","r":"0","T":2}));
        pool.handle_payload(&serde_json::Value::Array(items).to_string()).await;
        pool.handle_payload("{not json").await;
        pool.handle_payload(r#"{"error":{"code":2,"msg":"Invalid request"},"id":7}"#).await;
        pool.handle_payload(
            r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","s":"BTCUSDT","b":"1","B":"2","a":"3","A":"4","T":5}}"#,
        )
        .await;

        assert_eq!(recorder.marks.lock().len(), 24);
        assert_eq!(recorder.tickers.lock().as_slice(), ["BTCUSDT"]);
        let stats = pool.stats();
        assert_eq!(stats.parse_errors, 2);
        assert_eq!(stats.protocol_errors, 1);
    }

    #[tokio::test]
    async fn subscriptions_spread_and_survive_connection_loss() {
        let (url, generation) = exchange_server().await;
        let (pool, _) = new_pool(url);
        pool.start().await.unwrap();

        let streams: Vec<String> = (0..6).map(|i| format!("s{i}usdt@bookTicker")).collect();
        for s in &streams {
            pool.subscribe(s).unwrap();
        }
        wait_until(|| streams.iter().all(|s| pool.is_attached(s))).await;
        // Capacity 4 with pre-emptive opening at half load.
        assert!(pool.stats().connections >= 2);

        // Removed while everything is up: must stay removed after recovery.
        pool.unsubscribe(&streams[0]).unwrap();
        wait_until(|| !pool.is_attached(&streams[0])).await;

        generation.lock().cancel();
        wait_until(|| pool.stats().healthy_connections == 0).await;

        pool.check_health().await;
        wait_until(|| streams[1..].iter().all(|s| pool.is_attached(s))).await;
        assert!(!pool.is_attached(&streams[0]));
        assert_eq!(pool.desired_streams().len(), 5);

        pool.stop().await;
        assert!(pool.subscribe("late@bookTicker").is_err());
    }

    #[tokio::test]
    async fn unsubscribe_during_inflight_batch_takes_effect() {
        let (url, _generation) = exchange_server().await;
        let recorder = Arc::new(Recorder::default());
        let (alerts, _rx) = mpsc::unbounded_channel();
        let config = StreamConfig {
            message_interval_ms: 600,
            ..test_config(url)
        };
        let pool = StreamPool::new(config, recorder, alerts, &CancellationToken::new());
        pool.start().await.unwrap();

        pool.subscribe("a@bookTicker").unwrap();
        wait_until(|| pool.is_attached("a@bookTicker")).await;
        pool.subscribe("b@bookTicker").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        // The batch carrying b is parked on the pacer at this point.
        pool.unsubscribe("b@bookTicker").unwrap();

        tokio::time::sleep(Duration::from_millis(2000)).await;
        wait_until(|| pool.is_attached("a@bookTicker") && !pool.is_attached("b@bookTicker")).await;
        assert_eq!(pool.desired_streams(), vec!["a@bookTicker"]);

        pool.check_health().await;
        assert!(!pool.is_attached("b@bookTicker"));
        pool.stop().await;
    }
}
