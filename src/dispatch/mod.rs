// =============================================================================
// Order dispatch — execution backend contract and shared trade types
// =============================================================================

pub mod dispatcher;
pub mod freqtrade;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use dispatcher::OrderDispatcher;
pub use freqtrade::FreqtradeClient;

/// External order-execution backend.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Submit one order intent.
    async fn submit(&self, intent: &OrderIntent) -> Result<()>;
    /// Trades currently known to the backend (open and recently closed).
    async fn trades(&self) -> Result<Vec<TradePosition>>;
    async fn trade_count(&self) -> Result<TradeCount>;
    /// Pairs the backend is allowed to trade, in backend notation.
    async fn whitelist(&self) -> Result<Vec<String>>;
}

/// What the dispatcher asks the backend to do. Built at dispatch time and
/// never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderIntent {
    Open {
        pair: String,
        side: String,
        order_type: String,
        stake_amount: Option<f64>,
        leverage: u32,
        price: Option<f64>,
        entry_tag: String,
    },
    /// Increase an existing position.
    Adjust {
        pair: String,
        side: String,
        stake_amount: f64,
        price: f64,
        entry_tag: String,
    },
    Close {
        trade_id: i64,
        order_type: String,
        /// `"all"` or a decimal quantity.
        amount: String,
    },
}

impl OrderIntent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Adjust { .. } => "adjust",
            Self::Close { .. } => "close",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeOrder {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub ft_order_side: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub filled: f64,
    #[serde(default)]
    pub cost: Option<f64>,
}

/// One trade as reported by the backend's status endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradePosition {
    pub trade_id: i64,
    pub pair: String,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub open_rate: f64,
    #[serde(default)]
    pub stake_amount: f64,
    #[serde(default)]
    pub trade_direction: String,
    #[serde(default)]
    pub is_short: bool,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub current_profit_abs: f64,
    #[serde(default)]
    pub orders: Vec<TradeOrder>,
}

impl TradePosition {
    pub fn is_long(&self) -> bool {
        self.trade_direction == "long" || !self.is_short
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeCount {
    #[serde(default)]
    pub current: u32,
    #[serde(default)]
    pub max: u32,
    #[serde(default)]
    pub total_stake: f64,
}

// -----------------------------------------------------------------------------
// Pair notation
// -----------------------------------------------------------------------------

const SETTLE_QUOTES: [&str; 4] = ["USDT", "USDC", "BTC", "ETH"];

/// `BTCUSDT` → `BTC/USDT:USDT`. Unknown quotes are assumed to settle in USDT.
pub fn to_backend_pair(symbol: &str) -> String {
    for quote in SETTLE_QUOTES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}/{quote}:{quote}");
            }
        }
    }
    format!("{symbol}/USDT:USDT")
}

/// `BTC/USDT:USDT` (or spot `BTC/USDT`) → `BTCUSDT`.
pub fn from_backend_pair(pair: &str) -> String {
    let market = pair.split(':').next().unwrap_or(pair);
    market.replace('/', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_notation_converts_both_ways() {
        assert_eq!(to_backend_pair("BTCUSDT"), "BTC/USDT:USDT");
        assert_eq!(to_backend_pair("ETHUSDC"), "ETH/USDC:USDC");
        assert_eq!(to_backend_pair("ETHBTC"), "ETH/BTC:BTC");
        assert_eq!(to_backend_pair("FOO"), "FOO/USDT:USDT");
        assert_eq!(from_backend_pair("DOGE/USDT:USDT"), "DOGEUSDT");
        assert_eq!(from_backend_pair("DOGE/USDT"), "DOGEUSDT");
    }

    #[test]
    fn direction_prefers_explicit_long() {
        let t = TradePosition {
            trade_direction: "long".into(),
            is_short: true,
            ..Default::default()
        };
        assert!(t.is_long());
        let s = TradePosition {
            trade_direction: "short".into(),
            is_short: true,
            ..Default::default()
        };
        assert!(!s.is_long());
    }
}
