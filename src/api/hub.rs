// =============================================================================
// Broadcaster — topic fan-out to dashboard subscribers
// =============================================================================
//
// Every client owns a bounded outbound queue. Producers never wait on a
// client: a full queue means the client is too slow, and it is dropped
// (its receiver then ends and the socket task closes the connection).
//
// Envelope: {type, dataType, data, timestamp, clientId}
//   type      message | subscribe | unsubscribe | ping | pong | error
//   dataType  prices | estimates | system
//
// Subscribing pushes the topic's current snapshot once, then increments.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{KeyValueStore, MarketDataCache};
use crate::types::{now_ms, PriceSample, WatchCondition};

const SYSTEM: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Prices,
    Estimates,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prices => "prices",
            Self::Estimates => "estimates",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "prices" => Some(Self::Prices),
            "estimates" => Some(Self::Estimates),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "dataType")]
    pub data_type: String,
    pub data: Value,
    pub timestamp: i64,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

impl Envelope {
    fn new(kind: &'static str, data_type: &str, data: Value, client_id: &str) -> Self {
        Self {
            kind,
            data_type: data_type.to_string(),
            data,
            timestamp: now_ms(),
            client_id: client_id.to_string(),
        }
    }
}

/// Inbound control message.
#[derive(Debug, Deserialize)]
struct Inbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "dataType", default)]
    data_type: String,
}

struct Client {
    tx: mpsc::Sender<String>,
    topics: HashSet<DataType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connected_clients: usize,
    pub price_subscribers: usize,
    pub estimate_subscribers: usize,
    pub messages_sent: u64,
    pub clients_dropped: u64,
}

pub struct Broadcaster {
    clients: RwLock<HashMap<String, Client>>,
    buffer: usize,
    prices: Arc<MarketDataCache>,
    store: Arc<dyn KeyValueStore>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new(buffer: usize, prices: Arc<MarketDataCache>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            prices,
            store,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Add a client and queue its welcome message.
    pub fn register(&self) -> (String, mpsc::Receiver<String>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.buffer);
        self.clients.write().insert(
            id.clone(),
            Client {
                tx,
                topics: HashSet::new(),
            },
        );
        info!(client_id = %id, "subscriber connected");
        self.send_to(
            &id,
            Envelope::new("message", SYSTEM, json!({"status": "connected", "clientId": id}), &id),
        );
        (id, rx)
    }

    pub fn unregister(&self, id: &str) {
        if self.clients.write().remove(id).is_some() {
            info!(client_id = %id, "subscriber disconnected");
        }
    }

    /// Process one inbound text frame from client `id`.
    pub async fn handle_inbound(&self, id: &str, text: &str) {
        let msg: Inbound = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(client_id = %id, error = %e, "unparseable subscriber message");
                self.send_error(id, "INVALID_MESSAGE", "invalid message format", &e.to_string());
                return;
            }
        };

        match msg.kind.as_str() {
            "subscribe" | "unsubscribe" => {
                let subscribe = msg.kind == "subscribe";
                let Some(topic) = DataType::parse(&msg.data_type) else {
                    let details = if msg.data_type.is_empty() {
                        "dataType must not be empty".to_string()
                    } else {
                        format!("unsupported dataType: {}", msg.data_type)
                    };
                    self.send_error(id, "INVALID_DATATYPE", "subscription failed", &details);
                    return;
                };

                let known = {
                    let mut clients = self.clients.write();
                    match clients.get_mut(id) {
                        Some(c) if subscribe => {
                            c.topics.insert(topic);
                            true
                        }
                        Some(c) => {
                            c.topics.remove(&topic);
                            true
                        }
                        None => false,
                    }
                };
                if !known {
                    return;
                }

                let action = if subscribe { "subscribed" } else { "unsubscribed" };
                debug!(client_id = %id, topic = topic.as_str(), action, "subscription changed");
                self.send_to(
                    id,
                    Envelope::new(
                        "message",
                        SYSTEM,
                        json!({"action": action, "dataType": topic.as_str()}),
                        id,
                    ),
                );

                if subscribe {
                    match self.snapshot(topic).await {
                        Ok(data) => self.send_to(id, Envelope::new("message", topic.as_str(), data, id)),
                        Err(e) => warn!(topic = topic.as_str(), error = %e, "snapshot unavailable"),
                    }
                }
            }
            "ping" => {
                self.send_to(id, Envelope::new("pong", SYSTEM, json!({"message": "pong"}), id));
            }
            other => {
                self.send_error(
                    id,
                    "UNKNOWN_MESSAGE_TYPE",
                    "unknown message type",
                    &format!("unsupported message type: {other}"),
                );
            }
        }
    }

    /// Push `data` to every subscriber of `topic`.
    pub fn broadcast(&self, topic: DataType, data: Value) {
        let payload = match serde_json::to_string(&Envelope::new("message", topic.as_str(), data, "")) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise broadcast");
                return;
            }
        };

        let mut slow = Vec::new();
        let mut delivered = 0u64;
        {
            let clients = self.clients.read();
            for (id, client) in clients.iter().filter(|(_, c)| c.topics.contains(&topic)) {
                match client.tx.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => slow.push(id.clone()),
                }
            }
        }
        self.sent.fetch_add(delivered, Ordering::Relaxed);
        self.drop_clients(&slow);
    }

    pub fn push_prices(&self, samples: &[PriceSample]) {
        if samples.is_empty() {
            return;
        }
        self.broadcast(DataType::Prices, prices_payload(samples));
    }

    /// Reload conditions from the store and push them to estimate
    /// subscribers.
    pub async fn push_estimates(&self) -> Result<()> {
        if self.subscriber_count(DataType::Estimates) == 0 {
            return Ok(());
        }
        let data = self.snapshot(DataType::Estimates).await?;
        self.broadcast(DataType::Estimates, data);
        Ok(())
    }

    pub async fn snapshot(&self, topic: DataType) -> Result<Value> {
        Ok(match topic {
            DataType::Prices => prices_payload(&self.prices.snapshot()),
            DataType::Estimates => estimates_payload(&self.store.list_estimates().await?),
        })
    }

    /// Every `interval`, push the price samples updated since the last push.
    pub fn spawn_price_pusher(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let updated = hub.prices.take_updated();
                        if hub.subscriber_count(DataType::Prices) > 0 {
                            hub.push_prices(&updated);
                        }
                    }
                }
            }
            debug!("price pusher stopped");
        })
    }

    pub fn subscriber_count(&self, topic: DataType) -> usize {
        self.clients
            .read()
            .values()
            .filter(|c| c.topics.contains(&topic))
            .count()
    }

    pub fn stats(&self) -> HubStats {
        let clients = self.clients.read();
        let count = |t: DataType| clients.values().filter(|c| c.topics.contains(&t)).count();
        HubStats {
            connected_clients: clients.len(),
            price_subscribers: count(DataType::Prices),
            estimate_subscribers: count(DataType::Estimates),
            messages_sent: self.sent.load(Ordering::Relaxed),
            clients_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn send_error(&self, id: &str, code: &str, message: &str, details: &str) {
        self.send_to(
            id,
            Envelope::new(
                "error",
                SYSTEM,
                json!({"error": message, "code": code, "details": details}),
                id,
            ),
        );
    }

    fn send_to(&self, id: &str, envelope: Envelope) {
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise message");
                return;
            }
        };
        let full = {
            let clients = self.clients.read();
            match clients.get(id) {
                Some(c) => c.tx.try_send(payload).is_err(),
                None => false,
            }
        };
        if full {
            self.drop_clients(&[id.to_string()]);
        } else {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn drop_clients(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut clients = self.clients.write();
        for id in ids {
            if clients.remove(id).is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(client_id = %id, "subscriber buffer full, disconnecting");
            }
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("clients", &self.clients.read().len())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Payloads
// -----------------------------------------------------------------------------

fn prices_payload(samples: &[PriceSample]) -> Value {
    let map: serde_json::Map<String, Value> = samples
        .iter()
        .map(|s| {
            (
                s.symbol.clone(),
                json!({
                    "symbol": s.symbol,
                    "markPrice": s.mark_price,
                    "indexPrice": s.index_price,
                    "fundingRate": s.funding_rate,
                    "fundingTime": s.funding_time,
                    "bidPrice": s.bid_price.unwrap_or(s.mark_price),
                    "askPrice": s.ask_price.unwrap_or(s.mark_price),
                    "updateTime": s.timestamp,
                }),
            )
        })
        .collect();
    Value::Object(map)
}

fn estimates_payload(conditions: &[WatchCondition]) -> Value {
    let mut by_symbol: BTreeMap<&str, Vec<&WatchCondition>> = BTreeMap::new();
    for c in conditions {
        by_symbol.entry(c.symbol.as_str()).or_default().push(c);
    }
    for list in by_symbol.values_mut() {
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    }
    json!({
        "symbolEstimates": by_symbol,
        "lastUpdate": now_ms(),
    })
}

// =============================================================================
// Tests
// =============================================================================
