// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires the admin bearer token via the `AuthBearer` extractor.
//
// CORS is permissive; the service sits behind the operator's own proxy.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::exchange::MarketDataSource;
use crate::types::{
    ActionType, EstimateStatus, Kline, MarketFilter, OrderType, Side, TriggerType, WatchCondition,
};

const DEFAULT_KLINE_INTERVAL: &str = "1h";
const DEFAULT_KLINE_LIMIT: u32 = 100;
const MAX_KLINE_LIMIT: u32 = 1500;
const VALID_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/prices", get(prices))
        .route("/api/v1/estimates", get(list_estimates).post(create_estimate))
        .route("/api/v1/account", get(account))
        .route("/api/v1/markets", get(markets))
        .route("/api/v1/klines/:symbol", get(klines))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn internal_error(context: &str, e: anyhow::Error) -> Response {
    warn!(error = %format!("{e:#}"), "{context}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {e:#}"))
}

// =============================================================================
// Health & stats
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

async fn stats(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "uptime_secs": state.uptime_secs(),
        "pool": state.pool.stats(),
        "session": state.session.as_ref().map(|s| s.stats()),
        "feed": state.feed.stats(),
        "hub": state.hub.stats(),
        "engine": state.engine.stats(),
        "rate_limit": state.exchange.weights(),
        "recent_errors": state.recent_errors(),
    }))
}

// =============================================================================
// Prices
// =============================================================================

async fn prices(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cache.snapshot())
}

// =============================================================================
// Estimates
// =============================================================================

#[derive(Deserialize)]
struct EstimateQuery {
    status: Option<EstimateStatus>,
    symbol: Option<String>,
}

async fn list_estimates(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<EstimateQuery>,
) -> Response {
    match state.store.list_estimates().await {
        Ok(mut list) => {
            if let Some(status) = query.status {
                list.retain(|c| c.status == status);
            }
            if let Some(symbol) = query.symbol {
                let symbol = symbol.to_uppercase();
                list.retain(|c| c.symbol == symbol);
            }
            list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Json(list).into_response()
        }
        Err(e) => internal_error("failed to list estimates", e),
    }
}

/// Request body for `POST /api/v1/estimates`.
#[derive(Debug, Deserialize)]
pub struct NewEstimate {
    pub symbol: String,
    pub side: Side,
    pub action_type: ActionType,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub target_price: f64,
    #[serde(default)]
    pub percentage: f64,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub margin_mode: Option<String>,
    #[serde(default)]
    pub stake_amount: f64,
    #[serde(default)]
    pub tag: String,
}

impl NewEstimate {
    /// Validate and build a listening condition with a fresh id.
    pub fn into_condition(self) -> Result<WatchCondition, String> {
        let symbol = self.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err("symbol must not be empty".into());
        }
        if self.trigger_type == TriggerType::Condition && !(self.target_price > 0.0) {
            return Err("target_price must be positive".into());
        }
        let sized = matches!(self.action_type, ActionType::Addition | ActionType::TakeProfit);
        if sized && !(self.percentage > 0.0 && self.percentage <= 100.0) {
            return Err("percentage must be in (0, 100]".into());
        }
        let leverage = self.leverage.unwrap_or(1);
        if !(1..=125).contains(&leverage) {
            return Err("leverage must be between 1 and 125".into());
        }
        if self.stake_amount < 0.0 {
            return Err("stake_amount must not be negative".into());
        }
        if let Some(mode) = &self.margin_mode {
            if mode != "cross" && mode != "isolated" {
                return Err("margin_mode must be cross or isolated".into());
            }
        }

        let now = Utc::now();
        Ok(WatchCondition {
            id: Uuid::new_v4().to_string(),
            symbol,
            side: self.side,
            action_type: self.action_type,
            trigger_type: self.trigger_type,
            target_price: self.target_price,
            percentage: self.percentage,
            leverage,
            order_type: self.order_type,
            margin_mode: self.margin_mode,
            status: EstimateStatus::Listening,
            enabled: true,
            tag: self.tag,
            stake_amount: self.stake_amount,
            triggered_price: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }
}

async fn create_estimate(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewEstimate>,
) -> Response {
    let condition = match req.into_condition() {
        Ok(c) => c,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };
    if let Err(e) = state.store.set_estimate(&condition).await {
        return internal_error("failed to save estimate", e);
    }
    info!(
        id = %condition.id,
        symbol = %condition.symbol,
        side = %condition.side,
        action = %condition.action_type,
        target = condition.target_price,
        "estimate created"
    );
    match state.feed.refresh_watched().await {
        Ok(watched) => state.feed.sync_book_tickers(&state.pool, &watched),
        Err(e) => warn!(error = %format!("{e:#}"), "watched set refresh after create failed"),
    }
    if let Err(e) = state.hub.push_estimates().await {
        warn!(error = %format!("{e:#}"), "estimate push after create failed");
    }
    (StatusCode::CREATED, Json(condition)).into_response()
}

// =============================================================================
// Account & markets
// =============================================================================

async fn account(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "has_credentials": state.exchange.has_credentials(),
        "account_stream": state.session.as_ref().map(|s| s.stats().state),
        "balances": state.balances(),
    }))
}

#[derive(Deserialize)]
struct MarketQuery {
    quote: Option<String>,
}

async fn markets(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<MarketQuery>,
) -> Response {
    let filter = MarketFilter {
        quote_asset: query.quote,
        trading_only: true,
    };
    match state.exchange.fetch_markets(&filter).await {
        Ok(markets) => Json(markets).into_response(),
        Err(e) => internal_error("failed to fetch markets", e),
    }
}

// =============================================================================
// Klines (read-through cache)
// =============================================================================

#[derive(Deserialize)]
struct KlineQuery {
    interval: Option<String>,
    limit: Option<u32>,
}

async fn klines(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<KlineQuery>,
) -> Response {
    let symbol = symbol.to_uppercase();
    let interval = query.interval.unwrap_or_else(|| DEFAULT_KLINE_INTERVAL.to_string());
    if !VALID_INTERVALS.contains(&interval.as_str()) {
        return error_response(StatusCode::BAD_REQUEST, format!("unsupported interval: {interval}"));
    }
    let limit = query.limit.unwrap_or(DEFAULT_KLINE_LIMIT).clamp(1, MAX_KLINE_LIMIT);
    let key = kline_cache_key(&symbol, &interval, limit);

    match state.store.get_cached(&key).await {
        Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
            Ok(cached) => return Json(cached).into_response(),
            Err(e) => warn!(key = %key, error = %e, "discarding corrupt kline cache entry"),
        },
        Ok(None) => {}
        Err(e) => warn!(key = %key, error = %format!("{e:#}"), "kline cache read failed"),
    }

    let fetched: Vec<Kline> = match state.exchange.fetch_klines(&symbol, &interval, None, limit).await {
        Ok(k) => k,
        Err(e) => return internal_error("failed to fetch klines", e),
    };
    let ttl = Duration::from_secs(state.config.feed.kline_cache_secs.max(1));
    match serde_json::to_string(&fetched) {
        Ok(raw) => {
            if let Err(e) = state.store.set_cached(&key, &raw, ttl).await {
                warn!(key = %key, error = %format!("{e:#}"), "kline cache write failed");
            }
        }
        Err(e) => warn!(error = %e, "kline serialization failed"),
    }
    Json(fetched).into_response()
}

fn kline_cache_key(symbol: &str, interval: &str, limit: u32) -> String {
    format!("klines:{symbol}:{interval}:{limit}")
}
