// =============================================================================
// Binance USD-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. The API key travels
// as the X-MBX-APIKEY header, never in the query string. Signed requests carry
// a recvWindow of 5 000 ms to tolerate minor clock drift.
//
// Every call goes through the shared `RestClient`, so transient failures are
// retried there and every request has a deadline.
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::{WeightSnapshot, WeightTracker};
use crate::exchange::MarketDataSource;
use crate::rest::{RestClient, RestError};
use crate::stream::session::SessionKeyProvider;
use crate::types::{
    now_ms, value_f64, BalanceInfo, Kline, Market, MarketFilter, MarkPriceUpdate, PriceSample,
    Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

pub const DEFAULT_REST_URL: &str = "https://fapi.binance.com";

pub struct FuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    rest: RestClient,
    weights: WeightTracker,
}

impl FuturesClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        rest: RestClient,
    ) -> Self {
        let base_url: String = base_url.into();
        debug!(base_url = %base_url, "FuturesClient initialised");
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            rest,
            weights: WeightTracker::new(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty()
    }

    pub fn weights(&self) -> WeightSnapshot {
        self.weights.snapshot()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| anyhow!("invalid signing key: {e}"))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Append timestamp, recvWindow, and signature to `params`.
    fn signed_query(&self, params: &str) -> Result<String> {
        let ts = now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn call(&self, method: Method, path: &str, query: &str, keyed: bool) -> Result<Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let mut builder = self.rest.http().request(method.clone(), &url);
        if keyed {
            builder = builder.header("X-MBX-APIKEY", &self.api_key);
        }

        match self.rest.send(builder).await {
            Ok(resp) => {
                self.weights.update_from_headers(&resp.headers);
                Ok(resp.body)
            }
            Err(e) => {
                if matches!(e, RestError::RateLimited { .. }) {
                    self.weights.record_rate_limited();
                }
                Err(anyhow::Error::new(e).context(format!("Binance {method} {path} failed")))
            }
        }
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Value> {
        self.call(Method::GET, path, query, false).await
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/balance (signed).
    #[instrument(skip(self), name = "binance::fetch_balances")]
    pub async fn fetch_balances(&self) -> Result<Vec<BalanceInfo>> {
        if !self.has_credentials() {
            anyhow::bail!("balance query needs API credentials");
        }
        let qs = self.signed_query("")?;
        let body = self.call(Method::GET, "/fapi/v2/balance", &qs, true).await?;
        let balances = parse_balances(&body)?;
        debug!(count = balances.len(), "balances retrieved");
        Ok(balances)
    }
}

#[async_trait]
impl MarketDataSource for FuturesClient {
    /// GET /fapi/v1/exchangeInfo.
    #[instrument(skip(self, filter), name = "binance::fetch_markets")]
    async fn fetch_markets(&self, filter: &MarketFilter) -> Result<Vec<Market>> {
        let body = self.public_get("/fapi/v1/exchangeInfo", "").await?;
        let markets = parse_markets(&body, filter)?;
        debug!(count = markets.len(), "markets retrieved");
        Ok(markets)
    }

    /// GET /fapi/v1/ticker/bookTicker.
    #[instrument(skip(self, symbols), name = "binance::fetch_tickers")]
    async fn fetch_tickers(&self, symbols: &[String]) -> Result<HashMap<String, Ticker>> {
        let query = match symbols {
            [one] => format!("symbol={one}"),
            _ => String::new(),
        };
        let body = self.public_get("/fapi/v1/ticker/bookTicker", &query).await?;
        let items = match body {
            Value::Array(items) => items,
            single @ Value::Object(_) => vec![single],
            other => anyhow::bail!("unexpected bookTicker payload: {other}"),
        };

        let wanted: HashSet<&str> = symbols.iter().map(String::as_str).collect();
        let mut out = HashMap::new();
        for item in items {
            match serde_json::from_value::<Ticker>(item) {
                Ok(t) if wanted.is_empty() || wanted.contains(t.symbol.as_str()) => {
                    out.insert(t.symbol.clone(), t);
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "skipping malformed bookTicker entry"),
            }
        }
        Ok(out)
    }

    /// GET /fapi/v1/klines.
    #[instrument(skip(self), name = "binance::fetch_klines")]
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        since: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Kline>> {
        let mut query = format!("symbol={symbol}&interval={interval}&limit={limit}");
        if let Some(start) = since {
            query.push_str(&format!("&startTime={start}"));
        }
        let body = self.public_get("/fapi/v1/klines", &query).await?;
        let klines = parse_klines(&body)?;
        debug!(symbol, interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    /// GET /fapi/v1/premiumIndex.
    #[instrument(skip(self, symbols), name = "binance::fetch_mark_prices")]
    async fn fetch_mark_prices(&self, symbols: &[String]) -> Result<Vec<PriceSample>> {
        let query = match symbols {
            [one] => format!("symbol={one}"),
            _ => String::new(),
        };
        let body = self.public_get("/fapi/v1/premiumIndex", &query).await?;
        let items = match body {
            Value::Array(items) => items,
            single @ Value::Object(_) => vec![single],
            other => anyhow::bail!("unexpected premiumIndex payload: {other}"),
        };

        let wanted: HashSet<&str> = symbols.iter().map(String::as_str).collect();
        let samples = items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<MarkPriceUpdate>(item).ok())
            .filter(|u| wanted.is_empty() || wanted.contains(u.symbol.as_str()))
            .map(MarkPriceUpdate::into_sample)
            .collect();
        Ok(samples)
    }
}

#[async_trait]
impl SessionKeyProvider for FuturesClient {
    /// POST /fapi/v1/listenKey.
    #[instrument(skip(self), name = "binance::create_listen_key")]
    async fn create_listen_key(&self) -> Result<String> {
        let body = self.call(Method::POST, "/fapi/v1/listenKey", "", true).await?;
        body["listenKey"]
            .as_str()
            .map(str::to_string)
            .context("listenKey missing from response")
    }

    /// PUT /fapi/v1/listenKey — extends validity by 60 minutes.
    #[instrument(skip_all, name = "binance::keepalive_listen_key")]
    async fn keepalive_listen_key(&self, key: &str) -> Result<()> {
        self.call(Method::PUT, "/fapi/v1/listenKey", &format!("listenKey={key}"), true)
            .await
            .map(|_| ())
    }

    /// DELETE /fapi/v1/listenKey.
    #[instrument(skip_all, name = "binance::close_listen_key")]
    async fn close_listen_key(&self, key: &str) -> Result<()> {
        self.call(Method::DELETE, "/fapi/v1/listenKey", &format!("listenKey={key}"), true)
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Response parsing
// =============================================================================

fn parse_markets(body: &Value, filter: &MarketFilter) -> Result<Vec<Market>> {
    let symbols = body["symbols"]
        .as_array()
        .context("exchangeInfo response missing 'symbols' array")?;

    let markets = symbols
        .iter()
        .filter_map(|s| {
            Some(Market {
                symbol: s["symbol"].as_str()?.to_string(),
                base_asset: s["baseAsset"].as_str().unwrap_or_default().to_string(),
                quote_asset: s["quoteAsset"].as_str().unwrap_or_default().to_string(),
                status: s["status"].as_str().unwrap_or_default().to_string(),
                contract_type: s["contractType"].as_str().unwrap_or_default().to_string(),
                price_precision: s["pricePrecision"].as_u64().unwrap_or(0) as u32,
                quantity_precision: s["quantityPrecision"].as_u64().unwrap_or(0) as u32,
            })
        })
        .filter(|m| filter.matches(m))
        .collect();
    Ok(markets)
}

/// Kline rows arrive as arrays:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ...
fn parse_klines(body: &Value) -> Result<Vec<Kline>> {
    let rows = body.as_array().context("klines response is not an array")?;
    let mut klines = Vec::with_capacity(rows.len());
    for row in rows {
        let arr = row.as_array().context("kline entry is not an array")?;
        if arr.len() < 7 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }
        let num = |i: usize| {
            value_f64(&arr[i]).with_context(|| format!("kline field {i} is not numeric: {}", arr[i]))
        };
        klines.push(Kline {
            open_time: arr[0].as_i64().unwrap_or(0),
            open: num(1)?,
            high: num(2)?,
            low: num(3)?,
            close: num(4)?,
            volume: num(5)?,
            close_time: arr[6].as_i64().unwrap_or(0),
        });
    }
    Ok(klines)
}

fn parse_balances(body: &Value) -> Result<Vec<BalanceInfo>> {
    let rows = body.as_array().context("balance response is not an array")?;
    Ok(rows
        .iter()
        .filter_map(|b| {
            Some(BalanceInfo {
                asset: b["asset"].as_str()?.to_string(),
                wallet_balance: value_f64(&b["balance"]).unwrap_or(0.0),
                cross_wallet_balance: value_f64(&b["crossWalletBalance"]).unwrap_or(0.0),
                available_balance: value_f64(&b["availableBalance"]).unwrap_or(0.0),
            })
        })
        .collect())
}

// =============================================================================
// Tests
// =============================================================================
