// =============================================================================
// Shared types used across the markwatch service
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ── Decimal-string decoding ──────────────────────────────────────────────────

/// Decode an exchange decimal that may arrive either as a JSON string
/// (`"0.0001"`) or as a number. Empty strings decode to `0.0`.
pub fn de_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(f64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) if s.is_empty() => Ok(0.0),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Parse an `f64` out of a JSON value holding either a string or a number.
pub fn value_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// Price data
// =============================================================================

/// Last-known market state for one instrument. Later writes replace earlier
/// ones; no history is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub symbol: String,
    pub mark_price: f64,
    #[serde(default)]
    pub index_price: f64,
    #[serde(default)]
    pub funding_rate: f64,
    /// Next funding time (ms).
    #[serde(default)]
    pub funding_time: i64,
    #[serde(default)]
    pub bid_price: Option<f64>,
    #[serde(default)]
    pub ask_price: Option<f64>,
    /// Event time of the sample (ms).
    pub timestamp: i64,
}

impl PriceSample {
    pub fn new(symbol: impl Into<String>, mark_price: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            mark_price,
            index_price: 0.0,
            funding_rate: 0.0,
            funding_time: 0,
            bid_price: None,
            ask_price: None,
            timestamp,
        }
    }
}

/// Mark-price update as published on `!markPrice@arr` and `premiumIndex`.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkPriceUpdate {
    #[serde(alias = "s")]
    pub symbol: String,
    #[serde(alias = "p", rename = "markPrice", deserialize_with = "de_str_f64")]
    pub mark_price: f64,
    #[serde(alias = "i", rename = "indexPrice", default, deserialize_with = "de_str_f64")]
    pub index_price: f64,
    #[serde(alias = "r", rename = "lastFundingRate", default, deserialize_with = "de_str_f64")]
    pub funding_rate: f64,
    #[serde(alias = "T", rename = "nextFundingTime", default)]
    pub funding_time: i64,
    #[serde(alias = "E", rename = "time", default)]
    pub event_time: i64,
}

impl MarkPriceUpdate {
    pub fn into_sample(self) -> PriceSample {
        let timestamp = if self.event_time > 0 { self.event_time } else { now_ms() };
        PriceSample {
            index_price: self.index_price,
            funding_rate: self.funding_rate,
            funding_time: self.funding_time,
            ..PriceSample::new(self.symbol, self.mark_price, timestamp)
        }
    }
}

/// Best bid/ask for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    #[serde(alias = "s")]
    pub symbol: String,
    #[serde(alias = "b", rename = "bidPrice", deserialize_with = "de_str_f64")]
    pub bid_price: f64,
    #[serde(alias = "B", rename = "bidQty", default, deserialize_with = "de_str_f64")]
    pub bid_qty: f64,
    #[serde(alias = "a", rename = "askPrice", deserialize_with = "de_str_f64")]
    pub ask_price: f64,
    #[serde(alias = "A", rename = "askQty", default, deserialize_with = "de_str_f64")]
    pub ask_qty: f64,
    #[serde(alias = "T", default)]
    pub time: i64,
}

/// A tradable futures instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub status: String,
    pub contract_type: String,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

/// Filter applied by `fetch_markets`.
#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    pub quote_asset: Option<String>,
    pub trading_only: bool,
}

impl MarketFilter {
    pub fn matches(&self, market: &Market) -> bool {
        if self.trading_only && market.status != "TRADING" {
            return false;
        }
        match &self.quote_asset {
            Some(q) => market.quote_asset.eq_ignore_ascii_case(q),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub wallet_balance: f64,
    #[serde(default)]
    pub cross_wallet_balance: f64,
    #[serde(default)]
    pub available_balance: f64,
}

// =============================================================================
// Watch conditions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a condition fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Open,
    #[serde(alias = "add")]
    Addition,
    TakeProfit,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Addition => write!(f, "addition"),
            Self::TakeProfit => write!(f, "take_profit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Immediate,
    Condition,
}

impl Default for TriggerType {
    fn default() -> Self {
        Self::Condition
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

impl Default for OrderType {
    fn default() -> Self {
        Self::Market
    }
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
        }
    }
}

/// Lifecycle of a watch condition. `Listening → Dispatching → {Triggered |
/// Failed}`; `Listening → Failed` is allowed for guard rejections. Terminal
/// states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateStatus {
    Listening,
    Dispatching,
    Triggered,
    Failed,
}

impl Default for EstimateStatus {
    fn default() -> Self {
        Self::Listening
    }
}

impl EstimateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listening => "listening",
            Self::Dispatching => "dispatching",
            Self::Triggered => "triggered",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Triggered | Self::Failed)
    }

    pub fn can_transition_to(&self, next: EstimateStatus) -> bool {
        use EstimateStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Listening, Dispatching)
                | (Listening, Failed)
                | (Dispatching, Triggered)
                | (Dispatching, Failed)
        )
    }
}

impl std::fmt::Display for EstimateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

fn default_leverage() -> u32 {
    1
}

/// A persisted rule ("estimate") that produces an order when its price
/// condition is met.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchCondition {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub action_type: ActionType,
    #[serde(default)]
    pub trigger_type: TriggerType,
    pub target_price: f64,
    /// Size percentage (0-100) used by add and take-profit.
    #[serde(default)]
    pub percentage: f64,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub margin_mode: Option<String>,
    #[serde(default)]
    pub status: EstimateStatus,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tag: String,
    /// Stake (quote currency) for open; `0` lets the backend decide.
    #[serde(default)]
    pub stake_amount: f64,
    #[serde(default)]
    pub triggered_price: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WatchCondition {
    pub fn is_active(&self) -> bool {
        self.enabled && self.status == EstimateStatus::Listening
    }
}

// =============================================================================
// Tests
// =============================================================================
