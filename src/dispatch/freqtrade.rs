// =============================================================================
// Freqtrade REST backend — bearer-token session plus force-entry/exit calls
// =============================================================================
//
// Session: `token/login` with basic auth yields an access and a refresh
// token. The refresher task trades the refresh token for a new access token
// on a fixed interval (well inside the access token's lifetime). A 401 on any
// call triggers one re-login and a single replay.
//
// Reads go through the retrying client. Order submission uses a client with
// retries disabled: a timed-out entry may still have been accepted, and
// replaying it could open a second position.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{ExecutionBackend, OrderIntent, TradeCount, TradePosition};
use crate::rest::{RestClient, RestError, RetryPolicy};

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Default)]
struct Tokens {
    access: String,
    refresh: String,
}

#[derive(Debug, Serialize)]
struct ForceEntryPayload<'a> {
    pair: &'a str,
    side: &'a str,
    ordertype: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stakeamount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    leverage: Option<u32>,
    entry_tag: &'a str,
}

#[derive(Debug, Serialize)]
struct ForceExitPayload<'a> {
    tradeid: String,
    ordertype: &'a str,
    amount: &'a str,
}

#[derive(Debug, Deserialize)]
struct WhitelistResponse {
    #[serde(default)]
    whitelist: Vec<String>,
}

pub struct FreqtradeClient {
    base_url: String,
    username: String,
    password: String,
    rest: RestClient,
    orders: RestClient,
    tokens: RwLock<Tokens>,
}

impl FreqtradeClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        policy: RetryPolicy,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let no_retry = RetryPolicy {
            max_retries: 0,
            ..policy.clone()
        };
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            rest: RestClient::new(policy, timeout, cancel)?,
            orders: RestClient::new(no_retry, timeout, cancel)?,
            tokens: RwLock::new(Tokens::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    pub fn is_logged_in(&self) -> bool {
        !self.tokens.read().access.is_empty()
    }

    /// POST token/login with basic auth.
    #[instrument(skip(self), name = "freqtrade::login")]
    pub async fn login(&self) -> Result<()> {
        let builder = self
            .rest
            .http()
            .post(self.url("token/login"))
            .basic_auth(&self.username, Some(&self.password));
        let resp = self
            .rest
            .send(builder)
            .await
            .map_err(|e| anyhow::Error::new(e).context("freqtrade login failed"))?;
        let login: LoginResponse =
            serde_json::from_value(resp.body).context("malformed freqtrade login response")?;

        let mut tokens = self.tokens.write();
        tokens.access = login.access_token;
        tokens.refresh = login.refresh_token.unwrap_or_default();
        info!(base_url = %self.base_url, "freqtrade session established");
        Ok(())
    }

    /// POST token/refresh with the refresh token. Falls back to a full login
    /// when no refresh token is held or the refresh is rejected.
    #[instrument(skip(self), name = "freqtrade::refresh")]
    pub async fn refresh(&self) -> Result<()> {
        let refresh = self.tokens.read().refresh.clone();
        if refresh.is_empty() {
            return self.login().await;
        }

        let builder = self
            .rest
            .http()
            .post(self.url("token/refresh"))
            .bearer_auth(&refresh);
        match self.rest.send(builder).await {
            Ok(resp) => {
                let login: LoginResponse = serde_json::from_value(resp.body)
                    .context("malformed freqtrade refresh response")?;
                self.tokens.write().access = login.access_token;
                debug!("freqtrade access token refreshed");
                Ok(())
            }
            Err(RestError::Auth { status, .. }) => {
                warn!(status, "refresh token rejected, logging in again");
                self.login().await
            }
            Err(e) => Err(anyhow::Error::new(e).context("freqtrade token refresh failed")),
        }
    }

    /// Refresh the access token every `interval` until `cancel` fires.
    pub fn spawn_token_refresher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.refresh().await {
                            warn!(error = %format!("{e:#}"), "freqtrade token refresh failed");
                        }
                    }
                }
            }
            debug!("freqtrade token refresher stopped");
        })
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>, order: bool) -> Result<Value> {
        let client = if order { &self.orders } else { &self.rest };
        let mut relogged = false;
        loop {
            let token = self.tokens.read().access.clone();
            let mut builder = client.http().request(method.clone(), self.url(path));
            if !token.is_empty() {
                builder = builder.bearer_auth(&token);
            }
            if let Some(b) = &body {
                builder = builder.json(b);
            }

            match client.send(builder).await {
                Ok(resp) => return Ok(resp.body),
                Err(RestError::Auth { status: 401, .. }) if !relogged => {
                    relogged = true;
                    warn!(path, "freqtrade rejected access token, logging in again");
                    self.login().await?;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!("freqtrade {method} {path} failed")))
                }
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for FreqtradeClient {
    #[instrument(skip(self), name = "freqtrade::submit", fields(kind = intent.label()))]
    async fn submit(&self, intent: &OrderIntent) -> Result<()> {
        let (path, body) = match intent {
            OrderIntent::Open {
                pair,
                side,
                order_type,
                stake_amount,
                leverage,
                price,
                entry_tag,
            } => (
                "forcebuy",
                serde_json::to_value(ForceEntryPayload {
                    pair,
                    side,
                    ordertype: order_type,
                    price: *price,
                    stakeamount: *stake_amount,
                    leverage: (*leverage > 0).then_some(*leverage),
                    entry_tag,
                })?,
            ),
            OrderIntent::Adjust {
                pair,
                side,
                stake_amount,
                price,
                entry_tag,
            } => (
                "forcebuy",
                serde_json::to_value(ForceEntryPayload {
                    pair,
                    side,
                    ordertype: "limit",
                    price: Some(*price),
                    stakeamount: Some(*stake_amount),
                    leverage: None,
                    entry_tag,
                })?,
            ),
            OrderIntent::Close {
                trade_id,
                order_type,
                amount,
            } => (
                "forcesell",
                serde_json::to_value(ForceExitPayload {
                    tradeid: trade_id.to_string(),
                    ordertype: order_type,
                    amount,
                })?,
            ),
        };

        let reply = self.call(Method::POST, path, Some(body), true).await?;
        info!(path, reply = %reply, "freqtrade accepted order");
        Ok(())
    }

    async fn trades(&self) -> Result<Vec<TradePosition>> {
        let body = self.call(Method::GET, "status", None, false).await?;
        serde_json::from_value(body).context("malformed freqtrade status response")
    }

    async fn trade_count(&self) -> Result<TradeCount> {
        let body = self.call(Method::GET, "count", None, false).await?;
        serde_json::from_value(body).context("malformed freqtrade count response")
    }

    async fn whitelist(&self) -> Result<Vec<String>> {
        let body = self.call(Method::GET, "whitelist", None, false).await?;
        let parsed: WhitelistResponse =
            serde_json::from_value(body).context("malformed freqtrade whitelist response")?;
        if parsed.whitelist.is_empty() {
            debug!("freqtrade whitelist is empty");
        }
        Ok(parsed.whitelist)
    }
}

impl std::fmt::Debug for FreqtradeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreqtradeClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}

/// Fail fast when the backend is obviously misconfigured.
pub fn validate_backend_config(base_url: &str, username: &str) -> Result<()> {
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        bail!("freqtrade base URL must be http(s): {base_url}");
    }
    if username.is_empty() {
        bail!("freqtrade username is not set");
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Fake {
        logins: AtomicU32,
        /// Access token the server currently accepts.
        valid: Mutex<String>,
        orders: Mutex<Vec<Value>>,
    }

    fn bearer(headers: &HeaderMap) -> String {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default()
            .to_string()
    }

    async fn login(State(fake): State<Arc<Fake>>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
        if !headers.contains_key("authorization") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "no auth"})));
        }
        let n = fake.logins.fetch_add(1, Ordering::SeqCst);
        let token = format!("access-{n}");
        *fake.valid.lock() = token.clone();
        (
            StatusCode::OK,
            Json(json!({"access_token": token, "refresh_token": "refresh-1"})),
        )
    }

    async fn status(State(fake): State<Arc<Fake>>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
        if bearer(&headers) != *fake.valid.lock() {
            return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "expired"})));
        }
        (
            StatusCode::OK,
            Json(json!([{
                "trade_id": 7, "pair": "BTC/USDT:USDT", "is_open": true, "amount": 0.5,
                "trade_direction": "long", "is_short": false, "leverage": 5.0,
                "orders": [{"order_id": "a", "ft_order_side": "buy", "cost": 1000.0}]
            }])),
        )
    }

    async fn forcebuy(State(fake): State<Arc<Fake>>, Json(body): Json<Value>) -> Json<Value> {
        fake.orders.lock().push(body);
        Json(json!({"status": "ok"}))
    }

    async fn whitelist() -> Json<Value> {
        Json(json!({"whitelist": ["BTC/USDT:USDT", "ETH/USDT:USDT"], "length": 2}))
    }

    async fn serve(fake: Arc<Fake>) -> String {
        let app = Router::new()
            .route("/api/v1/token/login", post(login))
            .route("/api/v1/status", get(status))
            .route("/api/v1/forcebuy", post(forcebuy))
            .route("/api/v1/whitelist", get(whitelist))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: &str) -> FreqtradeClient {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        FreqtradeClient::new(base, "bot", "pw", policy, Duration::from_secs(5), &CancellationToken::new())
            .unwrap()
    }

    #[tokio::test]
    async fn login_then_read_trades() {
        let fake = Arc::new(Fake::default());
        let base = serve(fake.clone()).await;
        let c = client(&base);
        c.login().await.unwrap();
        assert!(c.is_logged_in());

        let trades = c.trades().await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].trade_id, 7);
        assert_eq!(trades[0].orders[0].cost, Some(1000.0));
        assert!(trades[0].is_long());
    }

    #[tokio::test]
    async fn expired_token_relogs_once() {
        let fake = Arc::new(Fake::default());
        let base = serve(fake.clone()).await;
        let c = client(&base);
        c.login().await.unwrap();
        *fake.valid.lock() = "rotated-elsewhere".into();

        c.trades().await.unwrap();
        assert_eq!(fake.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_intent_maps_to_forcebuy_payload() {
        let fake = Arc::new(Fake::default());
        let base = serve(fake.clone()).await;
        let c = client(&base);
        c.login().await.unwrap();

        c.submit(&OrderIntent::Open {
            pair: "ETH/USDT:USDT".into(),
            side: "short".into(),
            order_type: "market".into(),
            stake_amount: None,
            leverage: 3,
            price: None,
            entry_tag: "open_short".into(),
        })
        .await
        .unwrap();

        let orders = fake.orders.lock();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0]["pair"], "ETH/USDT:USDT");
        assert_eq!(orders[0]["side"], "short");
        assert_eq!(orders[0]["leverage"], 3);
        assert!(orders[0].get("stakeamount").is_none());
        assert!(orders[0].get("price").is_none());
    }

    #[tokio::test]
    async fn whitelist_is_returned_in_backend_notation() {
        let fake = Arc::new(Fake::default());
        let base = serve(fake).await;
        let c = client(&base);
        assert_eq!(c.whitelist().await.unwrap(), vec!["BTC/USDT:USDT", "ETH/USDT:USDT"]);
    }

    #[test]
    fn config_validation() {
        assert!(validate_backend_config("http://localhost:8080", "bot").is_ok());
        assert!(validate_backend_config("localhost:8080", "bot").is_err());
        assert!(validate_backend_config("http://x", "").is_err());
    }
}
