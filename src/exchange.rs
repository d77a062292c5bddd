// =============================================================================
// Exchange data source — the REST side of the market-data contract
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Kline, Market, MarketFilter, PriceSample, Ticker};

/// Public market data over REST. Streaming lives in `crate::stream`.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_markets(&self, filter: &MarketFilter) -> Result<Vec<Market>>;

    /// Best bid/ask keyed by symbol. An empty `symbols` slice means all.
    async fn fetch_tickers(&self, symbols: &[String]) -> Result<HashMap<String, Ticker>>;

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        since: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Kline>>;

    /// Mark price, index price, and funding for `symbols` (all when empty).
    async fn fetch_mark_prices(&self, symbols: &[String]) -> Result<Vec<PriceSample>>;
}
