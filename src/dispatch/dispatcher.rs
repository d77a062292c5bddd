// =============================================================================
// Order Dispatcher — turns a satisfied watch condition into one backend call
// =============================================================================
//
//   open         → force entry with the condition's stake, leverage, side
//   addition     → force entry sized from the matching position's first order
//   take_profit  → force exit of the matching position, full or partial
//
// Addition and take-profit need an open trade on the same pair and in the
// same direction; without one the dispatch fails.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::dispatch::{to_backend_pair, ExecutionBackend, OrderIntent, TradePosition};
use crate::types::{ActionType, OrderType, Side, WatchCondition};

/// Margin convention of the backend: stake = cost × pct / leverage × 10.
const ADD_STAKE_FACTOR: f64 = 10.0;

pub struct OrderDispatcher {
    backend: Arc<dyn ExecutionBackend>,
}

impl OrderDispatcher {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Build the intent for `condition` at `current_price` and submit it.
    pub async fn dispatch(&self, condition: &WatchCondition, current_price: f64) -> Result<OrderIntent> {
        let intent = self.build_intent(condition, current_price).await?;
        info!(
            id = %condition.id,
            symbol = %condition.symbol,
            side = %condition.side,
            action = %condition.action_type,
            intent = intent.label(),
            current_price,
            target_price = condition.target_price,
            "dispatching order"
        );
        self.backend.submit(&intent).await?;
        Ok(intent)
    }

    pub async fn build_intent(&self, condition: &WatchCondition, current_price: f64) -> Result<OrderIntent> {
        let pair = to_backend_pair(&condition.symbol);
        match condition.action_type {
            ActionType::Open => self.open_intent(condition, pair, current_price).await,
            ActionType::Addition => {
                let trades = self.backend.trades().await.context("failed to load open trades")?;
                let trade = find_open_trade(&trades, &pair, condition.side).with_context(|| {
                    format!("no open {} position on {} to add to", condition.side, condition.symbol)
                })?;
                add_intent(condition, trade, pair, current_price)
            }
            ActionType::TakeProfit => {
                let trades = self.backend.trades().await.context("failed to load open trades")?;
                let trade = find_open_trade(&trades, &pair, condition.side).with_context(|| {
                    format!("no open {} position on {} to take profit on", condition.side, condition.symbol)
                })?;
                Ok(take_profit_intent(condition, trade))
            }
        }
    }

    async fn open_intent(&self, condition: &WatchCondition, pair: String, current_price: f64) -> Result<OrderIntent> {
        let trades = self.backend.trades().await.context("failed to load open trades")?;
        if trades.iter().any(|t| t.is_open && t.pair == pair) {
            bail!("a trade on {pair} is already open");
        }
        let count = self.backend.trade_count().await.context("failed to load trade count")?;
        let open = trades.iter().filter(|t| t.is_open).count() as u32;
        if count.max > 0 && open.max(count.current) >= count.max {
            bail!("maximum open trades reached ({}/{})", open.max(count.current), count.max);
        }

        let limit = condition.order_type == OrderType::Limit;
        Ok(OrderIntent::Open {
            pair,
            side: condition.side.as_str().to_string(),
            order_type: condition.order_type.as_str().to_string(),
            stake_amount: (condition.stake_amount > 0.0).then_some(condition.stake_amount),
            leverage: condition.leverage,
            price: limit.then_some(current_price),
            entry_tag: entry_tag(condition, "open"),
        })
    }
}

fn entry_tag(condition: &WatchCondition, prefix: &str) -> String {
    if condition.tag.is_empty() {
        format!("{prefix}_{}", condition.side)
    } else {
        condition.tag.clone()
    }
}

fn find_open_trade<'a>(trades: &'a [TradePosition], pair: &str, side: Side) -> Option<&'a TradePosition> {
    let want_long = side == Side::Long;
    trades
        .iter()
        .find(|t| t.is_open && t.pair == pair && t.is_long() == want_long)
}

fn add_intent(
    condition: &WatchCondition,
    trade: &TradePosition,
    pair: String,
    current_price: f64,
) -> Result<OrderIntent> {
    let original_cost = trade
        .orders
        .first()
        .and_then(|o| o.cost)
        .unwrap_or(0.0);
    if original_cost <= 0.0 {
        bail!("cannot determine original cost of trade {}", trade.trade_id);
    }
    let leverage = trade
        .leverage
        .filter(|l| *l > 0.0)
        .unwrap_or_else(|| condition.leverage.max(1) as f64);
    let stake = original_cost * (condition.percentage / 100.0) / leverage * ADD_STAKE_FACTOR;
    if stake <= 0.0 {
        bail!("computed add stake is not positive ({stake})");
    }

    Ok(OrderIntent::Adjust {
        pair,
        side: condition.side.as_str().to_string(),
        stake_amount: stake,
        price: current_price,
        entry_tag: entry_tag(condition, "add"),
    })
}

fn take_profit_intent(condition: &WatchCondition, trade: &TradePosition) -> OrderIntent {
    let amount = if condition.percentage > 0.0 && condition.percentage < 100.0 {
        format!("{:.8}", trade.amount * condition.percentage / 100.0)
    } else {
        "all".to_string()
    };
    OrderIntent::Close {
        trade_id: trade.trade_id,
        order_type: condition.order_type.as_str().to_string(),
        amount,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::store::tests::condition;
    use crate::dispatch::{TradeCount, TradeOrder};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Backend double that records submissions.
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub trades: Mutex<Vec<TradePosition>>,
        pub max_open: u32,
        pub submitted: Mutex<Vec<OrderIntent>>,
        pub fail_submit: Option<String>,
    }

    #[async_trait]
    impl ExecutionBackend for RecordingBackend {
        async fn submit(&self, intent: &OrderIntent) -> Result<()> {
            if let Some(msg) = &self.fail_submit {
                bail!("{msg}");
            }
            self.submitted.lock().push(intent.clone());
            Ok(())
        }

        async fn trades(&self) -> Result<Vec<TradePosition>> {
            Ok(self.trades.lock().clone())
        }

        async fn trade_count(&self) -> Result<TradeCount> {
            let current = self.trades.lock().iter().filter(|t| t.is_open).count() as u32;
            Ok(TradeCount {
                current,
                max: self.max_open,
                total_stake: 0.0,
            })
        }

        async fn whitelist(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn open_trade(id: i64, pair: &str, long: bool, amount: f64, cost: f64) -> TradePosition {
        TradePosition {
            trade_id: id,
            pair: pair.into(),
            is_open: true,
            amount,
            trade_direction: if long { "long" } else { "short" }.into(),
            is_short: !long,
            leverage: Some(5.0),
            orders: vec![TradeOrder {
                cost: Some(cost),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_without_position_fails() {
        let backend = Arc::new(RecordingBackend::default());
        let dispatcher = OrderDispatcher::new(backend.clone());
        let c = condition("e1", "BTCUSDT", Side::Long, ActionType::Addition, 100.0);

        let err = dispatcher.dispatch(&c, 99.0).await.unwrap_err();
        assert!(format!("{err:#}").contains("no open long position"));
        assert!(backend.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn add_sizes_from_original_cost() {
        let backend = Arc::new(RecordingBackend::default());
        backend
            .trades
            .lock()
            .push(open_trade(3, "BTC/USDT:USDT", true, 0.1, 1_000.0));
        let dispatcher = OrderDispatcher::new(backend.clone());
        let c = condition("e1", "BTCUSDT", Side::Long, ActionType::Addition, 100.0);

        let intent = dispatcher.dispatch(&c, 99.0).await.unwrap();
        // 1000 * 50% / 5 * 10
        assert_eq!(
            intent,
            OrderIntent::Adjust {
                pair: "BTC/USDT:USDT".into(),
                side: "long".into(),
                stake_amount: 1_000.0,
                price: 99.0,
                entry_tag: "add_long".into(),
            }
        );
    }

    #[tokio::test]
    async fn add_ignores_opposite_direction() {
        let backend = Arc::new(RecordingBackend::default());
        backend
            .trades
            .lock()
            .push(open_trade(3, "BTC/USDT:USDT", false, 0.1, 1_000.0));
        let dispatcher = OrderDispatcher::new(backend);
        let c = condition("e1", "BTCUSDT", Side::Long, ActionType::Addition, 100.0);
        assert!(dispatcher.build_intent(&c, 99.0).await.is_err());
    }

    #[tokio::test]
    async fn take_profit_partial_and_full() {
        let backend = Arc::new(RecordingBackend::default());
        backend
            .trades
            .lock()
            .push(open_trade(9, "ETH/USDT:USDT", false, 2.0, 500.0));
        let dispatcher = OrderDispatcher::new(backend);

        let mut c = condition("e1", "ETHUSDT", Side::Short, ActionType::TakeProfit, 100.0);
        c.percentage = 25.0;
        match dispatcher.build_intent(&c, 95.0).await.unwrap() {
            OrderIntent::Close { trade_id, amount, .. } => {
                assert_eq!(trade_id, 9);
                assert_eq!(amount, "0.50000000");
            }
            other => panic!("unexpected intent {other:?}"),
        }

        c.percentage = 100.0;
        match dispatcher.build_intent(&c, 95.0).await.unwrap() {
            OrderIntent::Close { amount, .. } => assert_eq!(amount, "all"),
            other => panic!("unexpected intent {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_refused_when_pair_busy_or_full() {
        let backend = Arc::new(RecordingBackend {
            max_open: 1,
            ..Default::default()
        });
        backend
            .trades
            .lock()
            .push(open_trade(1, "SOL/USDT:USDT", true, 1.0, 10.0));
        let dispatcher = OrderDispatcher::new(backend);

        let busy = condition("e1", "SOLUSDT", Side::Long, ActionType::Open, 1.0);
        assert!(dispatcher.build_intent(&busy, 1.0).await.is_err());

        let full = condition("e2", "BTCUSDT", Side::Long, ActionType::Open, 1.0);
        let err = dispatcher.build_intent(&full, 1.0).await.unwrap_err();
        assert!(err.to_string().contains("maximum open trades"));
    }

    #[tokio::test]
    async fn open_limit_carries_price_and_stake() {
        let backend = Arc::new(RecordingBackend::default());
        let dispatcher = OrderDispatcher::new(backend);
        let mut c = condition("e1", "BTCUSDT", Side::Short, ActionType::Open, 100.0);
        c.order_type = OrderType::Limit;
        c.stake_amount = 25.0;
        c.tag = "breakout".into();

        assert_eq!(
            dispatcher.build_intent(&c, 101.0).await.unwrap(),
            OrderIntent::Open {
                pair: "BTC/USDT:USDT".into(),
                side: "short".into(),
                order_type: "limit".into(),
                stake_amount: Some(25.0),
                leverage: 5,
                price: Some(101.0),
                entry_tag: "breakout".into(),
            }
        );
    }
}
