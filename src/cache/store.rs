// =============================================================================
// External key-value cache — Redis-backed, with an in-memory twin
// =============================================================================
//
// Key layout:
//   mark_price:<SYMBOL>       hash  symbol, mark_price, index_price,
//                                    funding_rate, funding_time, timestamp,
//                                    bid_price?, ask_price?
//   price_estimate:<id>       JSON  WatchCondition
//   coin_selection:<SYMBOL>   JSON  {symbol, status: active|inactive, ...}
//   cache:<name>              string with TTL (read-path helpers)
//
// Status claims use a server-side script so two overlapping ticks can never
// both move the same condition out of `listening`.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{EstimateStatus, PriceSample, WatchCondition};

const KEY_MARK_PRICE: &str = "mark_price";
const KEY_ESTIMATE: &str = "price_estimate";
const KEY_SELECTION: &str = "coin_selection";
const KEY_CACHE: &str = "cache";
const SCAN_COUNT: usize = 500;

const SELECTION_ACTIVE: &str = "active";
const SELECTION_INACTIVE: &str = "inactive";

/// Swap `"status":"<from>"` for `"status":"<to>"` in the stored JSON if and
/// only if the current status is `<from>`, stamping `updated_at` (ARGV[3])
/// and, when ARGV[4] is non-empty, `error_message` in the same write. Both
/// values arrive as JSON literals. Returns the new document or nil.
const CLAIM_SCRIPT: &str = r#"
local function splice(doc, field, value)
  local _, e = string.find(doc, '"' .. field .. '":', 1, true)
  if not e then return doc end
  local i = e + 1
  local stop
  if string.sub(doc, i, i + 3) == 'null' then
    stop = i + 3
  elseif string.sub(doc, i, i) == '"' then
    local j = i + 1
    while true do
      local c = string.sub(doc, j, j)
      if c == '' then return doc end
      if c == '\' then
        j = j + 2
      elseif c == '"' then
        break
      else
        j = j + 1
      end
    end
    stop = j
  else
    return doc
  end
  return string.sub(doc, 1, i - 1) .. value .. string.sub(doc, stop + 1)
end

local raw = redis.call('GET', KEYS[1])
if not raw then return false end
local needle = '"status":"' .. ARGV[1] .. '"'
local s, e = string.find(raw, needle, 1, true)
if not s then return false end
local updated = string.sub(raw, 1, s - 1) .. '"status":"' .. ARGV[2] .. '"' .. string.sub(raw, e + 1)
updated = splice(updated, 'updated_at', ARGV[3])
if ARGV[4] ~= '' then
  updated = splice(updated, 'error_message', ARGV[4])
end
redis.call('SET', KEYS[1], updated)
return updated
"#;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<Option<PriceSample>>;
    async fn set_price(&self, sample: &PriceSample) -> Result<()>;

    async fn get_estimate(&self, id: &str) -> Result<Option<WatchCondition>>;
    async fn set_estimate(&self, condition: &WatchCondition) -> Result<()>;
    async fn list_estimates(&self) -> Result<Vec<WatchCondition>>;

    /// Conditions whose status is `listening`.
    async fn list_active_estimates(&self) -> Result<Vec<WatchCondition>> {
        Ok(self
            .list_estimates()
            .await?
            .into_iter()
            .filter(|c| c.status == EstimateStatus::Listening)
            .collect())
    }

    /// Atomically move condition `id` from `from` to `to`, refreshing
    /// `updated_at` and recording `error` when given. Returns the updated
    /// condition, or `None` if it was not in `from`.
    async fn compare_and_set_status(
        &self,
        id: &str,
        from: EstimateStatus,
        to: EstimateStatus,
        error: Option<&str>,
    ) -> Result<Option<WatchCondition>>;

    async fn set_selected(&self, symbol: &str, selected: bool) -> Result<()>;
    async fn selected_instruments(&self) -> Result<Vec<String>>;

    async fn get_cached(&self, key: &str) -> Result<Option<String>>;
    async fn set_cached(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CoinSelection {
    symbol: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn ensure_transition(from: EstimateStatus, to: EstimateStatus) -> Result<()> {
    if !from.can_transition_to(to) {
        bail!("illegal status transition {from} -> {to}");
    }
    Ok(())
}

fn price_key(symbol: &str) -> String {
    format!("{KEY_MARK_PRICE}:{symbol}")
}

fn estimate_key(id: &str) -> String {
    format!("{KEY_ESTIMATE}:{id}")
}

fn selection_key(symbol: &str) -> String {
    format!("{KEY_SELECTION}:{symbol}")
}

fn cache_key(name: &str) -> String {
    format!("{KEY_CACHE}:{name}")
}

// =============================================================================
// Redis
// =============================================================================

pub struct RedisStore {
    conn: ConnectionManager,
    claim: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to Redis")?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING failed")?;
        info!(reply = %pong, "Redis connection established");
        Ok(Self {
            conn,
            claim: redis::Script::new(CLAIM_SCRIPT),
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("SCAN {pattern} failed"))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .context("MGET failed")?;
        Ok(values)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("GET {key} failed"))?;
        raw.map(|r| serde_json::from_str(&r).with_context(|| format!("corrupt value at {key}")))
            .transpose()
    }

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(body)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET {key} failed"))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get_price(&self, symbol: &str) -> Result<Option<PriceSample>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(price_key(symbol))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("HGETALL mark price {symbol} failed"))?;
        Ok(sample_from_fields(&fields))
    }

    async fn set_price(&self, sample: &PriceSample) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(price_key(&sample.symbol))
            .arg(sample_to_fields(sample))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("HSET mark price {} failed", sample.symbol))?;
        Ok(())
    }

    async fn get_estimate(&self, id: &str) -> Result<Option<WatchCondition>> {
        self.get_json(&estimate_key(id)).await
    }

    async fn set_estimate(&self, condition: &WatchCondition) -> Result<()> {
        self.set_json(&estimate_key(&condition.id), condition).await
    }

    async fn list_estimates(&self) -> Result<Vec<WatchCondition>> {
        let keys = self.scan_keys(&format!("{KEY_ESTIMATE}:*")).await?;
        let values = self.get_many(&keys).await?;
        let mut out = Vec::with_capacity(values.len());
        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<WatchCondition>(&raw) {
                Ok(c) => out.push(c),
                Err(e) => warn!(key = %key, error = %e, "skipping corrupt estimate"),
            }
        }
        Ok(out)
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        from: EstimateStatus,
        to: EstimateStatus,
        error: Option<&str>,
    ) -> Result<Option<WatchCondition>> {
        ensure_transition(from, to)?;
        let updated_at = serde_json::to_string(&Utc::now())?;
        let error = match error {
            Some(msg) => serde_json::to_string(msg)?,
            None => String::new(),
        };
        let mut conn = self.conn.clone();
        let updated: Option<String> = self
            .claim
            .key(estimate_key(id))
            .arg(from.as_str())
            .arg(to.as_str())
            .arg(updated_at)
            .arg(error)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("status claim for {id} failed"))?;
        updated
            .map(|raw| serde_json::from_str(&raw).context("corrupt estimate after claim"))
            .transpose()
    }

    async fn set_selected(&self, symbol: &str, selected: bool) -> Result<()> {
        let key = selection_key(symbol);
        let now = Utc::now();
        let existing: Option<CoinSelection> = self.get_json(&key).await?;
        let selection = CoinSelection {
            symbol: symbol.to_string(),
            status: if selected { SELECTION_ACTIVE } else { SELECTION_INACTIVE }.to_string(),
            created_at: existing.map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.set_json(&key, &selection).await
    }

    async fn selected_instruments(&self) -> Result<Vec<String>> {
        let keys = self.scan_keys(&format!("{KEY_SELECTION}:*")).await?;
        let values = self.get_many(&keys).await?;
        let mut out: Vec<String> = values
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str::<CoinSelection>(&raw).ok())
            .filter(|s| s.status == SELECTION_ACTIVE)
            .map(|s| s.symbol)
            .collect();
        out.sort();
        Ok(out)
    }

    async fn get_cached(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(cache_key(key))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("GET cache {key} failed"))?;
        Ok(value)
    }

    async fn set_cached(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(cache_key(key))
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET cache {key} failed"))?;
        debug!(key, ttl_secs = ttl.as_secs(), "cache entry written");
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

fn sample_to_fields(sample: &PriceSample) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("symbol", sample.symbol.clone()),
        ("mark_price", sample.mark_price.to_string()),
        ("index_price", sample.index_price.to_string()),
        ("funding_rate", sample.funding_rate.to_string()),
        ("funding_time", sample.funding_time.to_string()),
        ("timestamp", sample.timestamp.to_string()),
    ];
    if let Some(bid) = sample.bid_price {
        fields.push(("bid_price", bid.to_string()));
    }
    if let Some(ask) = sample.ask_price {
        fields.push(("ask_price", ask.to_string()));
    }
    fields
}

fn sample_from_fields(fields: &HashMap<String, String>) -> Option<PriceSample> {
    let symbol = fields.get("symbol")?.clone();
    let f = |k: &str| fields.get(k).and_then(|v| v.parse::<f64>().ok());
    let i = |k: &str| fields.get(k).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    Some(PriceSample {
        symbol,
        mark_price: f("mark_price")?,
        index_price: f("index_price").unwrap_or(0.0),
        funding_rate: f("funding_rate").unwrap_or(0.0),
        funding_time: i("funding_time"),
        bid_price: f("bid_price"),
        ask_price: f("ask_price"),
        timestamp: i("timestamp"),
    })
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local store used when no Redis URL is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    prices: RwLock<HashMap<String, PriceSample>>,
    estimates: RwLock<HashMap<String, WatchCondition>>,
    selections: RwLock<HashMap<String, bool>>,
    cached: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_price(&self, symbol: &str) -> Result<Option<PriceSample>> {
        Ok(self.prices.read().get(symbol).cloned())
    }

    async fn set_price(&self, sample: &PriceSample) -> Result<()> {
        self.prices
            .write()
            .insert(sample.symbol.clone(), sample.clone());
        Ok(())
    }

    async fn get_estimate(&self, id: &str) -> Result<Option<WatchCondition>> {
        Ok(self.estimates.read().get(id).cloned())
    }

    async fn set_estimate(&self, condition: &WatchCondition) -> Result<()> {
        self.estimates
            .write()
            .insert(condition.id.clone(), condition.clone());
        Ok(())
    }

    async fn list_estimates(&self) -> Result<Vec<WatchCondition>> {
        Ok(self.estimates.read().values().cloned().collect())
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        from: EstimateStatus,
        to: EstimateStatus,
        error: Option<&str>,
    ) -> Result<Option<WatchCondition>> {
        ensure_transition(from, to)?;
        let mut estimates = self.estimates.write();
        match estimates.get_mut(id) {
            Some(c) if c.status == from => {
                c.status = to;
                c.updated_at = Utc::now();
                if let Some(msg) = error {
                    c.error_message = Some(msg.to_string());
                }
                Ok(Some(c.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_selected(&self, symbol: &str, selected: bool) -> Result<()> {
        self.selections.write().insert(symbol.to_string(), selected);
        Ok(())
    }

    async fn selected_instruments(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = self
            .selections
            .read()
            .iter()
            .filter(|(_, on)| **on)
            .map(|(s, _)| s.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    async fn get_cached(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .cached
            .read()
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(v, _)| v.clone()))
    }

    async fn set_cached(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.cached
            .write()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("prices", &self.prices.read().len())
            .field("estimates", &self.estimates.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{ActionType, OrderType, Side, TriggerType};

    pub(crate) fn condition(id: &str, symbol: &str, side: Side, action: ActionType, target: f64) -> WatchCondition {
        let now = Utc::now();
        WatchCondition {
            id: id.to_string(),
            symbol: symbol.to_string(),
            side,
            action_type: action,
            trigger_type: TriggerType::Condition,
            target_price: target,
            percentage: 50.0,
            leverage: 5,
            order_type: OrderType::Market,
            margin_mode: None,
            status: EstimateStatus::Listening,
            enabled: true,
            tag: String::new(),
            stake_amount: 0.0,
            triggered_price: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn price_round_trip_keeps_identity() {
        let store = MemoryStore::new();
        let sample = PriceSample::new("BTCUSDT", 43_250.5, 1_700_000_000_123);
        store.set_price(&sample).await.unwrap();
        let got = store.get_price("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(got.symbol, sample.symbol);
        assert_eq!(got.mark_price, sample.mark_price);
        assert_eq!(got.timestamp, sample.timestamp);
        assert!(store.get_price("ETHUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let store = MemoryStore::new();
        store
            .set_estimate(&condition("e1", "BTCUSDT", Side::Long, ActionType::Open, 100.0))
            .await
            .unwrap();

        let first = store
            .compare_and_set_status("e1", EstimateStatus::Listening, EstimateStatus::Dispatching, None)
            .await
            .unwrap();
        assert_eq!(first.unwrap().status, EstimateStatus::Dispatching);

        let second = store
            .compare_and_set_status("e1", EstimateStatus::Listening, EstimateStatus::Dispatching, None)
            .await
            .unwrap();
        assert!(second.is_none());
        assert!(store.list_active_estimates().await.unwrap().is_empty());
        assert!(store
            .compare_and_set_status("missing", EstimateStatus::Listening, EstimateStatus::Failed, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn failing_claim_records_error_in_one_write() {
        let store = MemoryStore::new();
        let c = condition("e3", "ETHUSDT", Side::Short, ActionType::Open, 2_000.0);
        let created = c.updated_at;
        store.set_estimate(&c).await.unwrap();

        let failed = store
            .compare_and_set_status("e3", EstimateStatus::Listening, EstimateStatus::Failed, Some("funding too low"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, EstimateStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("funding too low"));
        assert!(failed.updated_at >= created);

        let stored = store.get_estimate("e3").await.unwrap().unwrap();
        assert_eq!(stored.status, EstimateStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("funding too low"));
    }

    #[tokio::test]
    async fn illegal_transition_is_refused() {
        let store = MemoryStore::new();
        let mut c = condition("e2", "BTCUSDT", Side::Long, ActionType::Open, 100.0);
        c.status = EstimateStatus::Triggered;
        store.set_estimate(&c).await.unwrap();

        assert!(store
            .compare_and_set_status("e2", EstimateStatus::Triggered, EstimateStatus::Listening, None)
            .await
            .is_err());
        assert!(store
            .compare_and_set_status("e2", EstimateStatus::Listening, EstimateStatus::Triggered, None)
            .await
            .is_err());
        assert_eq!(store.get_estimate("e2").await.unwrap().unwrap().status, EstimateStatus::Triggered);
    }

    #[tokio::test]
    async fn selections_and_ttl_cache() {
        let store = MemoryStore::new();
        store.set_selected("ETHUSDT", true).await.unwrap();
        store.set_selected("BTCUSDT", true).await.unwrap();
        store.set_selected("ETHUSDT", false).await.unwrap();
        assert_eq!(store.selected_instruments().await.unwrap(), vec!["BTCUSDT"]);

        store.set_cached("k", "v", Duration::from_secs(60)).await.unwrap();
        store.set_cached("gone", "v", Duration::ZERO).await.unwrap();
        assert_eq!(store.get_cached("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.get_cached("gone").await.unwrap().is_none());
    }

    #[test]
    fn hash_fields_round_trip() {
        let mut sample = PriceSample::new("SOLUSDT", 101.25, 42);
        sample.funding_rate = -0.0003;
        sample.bid_price = Some(101.2);
        let fields: HashMap<String, String> = sample_to_fields(&sample)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(sample_from_fields(&fields), Some(sample));
        assert_eq!(sample_from_fields(&HashMap::new()), None);
    }

    #[test]
    fn claim_needle_matches_serialized_status() {
        let json = serde_json::to_string(&condition("e1", "BTCUSDT", Side::Short, ActionType::TakeProfit, 1.0)).unwrap();
        assert!(json.contains(r#""status":"listening""#));
        assert!(json.contains(r#""error_message":null"#));
        assert!(json.contains(r#""updated_at":""#));
    }
}
