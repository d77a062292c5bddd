// =============================================================================
// markwatch — Main Entry Point
// =============================================================================
//
// Startup order: config → store → notifier → REST clients → backend login →
// stream pool + feed → account stream → trigger engine → HTTP server.
// Ctrl+C cancels the root token, stops the transports, waits up to 10s for
// background tasks, and saves the runtime config.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod cache;
mod dispatch;
mod exchange;
mod feed;
mod notify;
mod rest;
mod runtime_config;
mod stream;
mod trigger;
mod types;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::hub::Broadcaster;
use crate::app_state::AppState;
use crate::binance::FuturesClient;
use crate::cache::{KeyValueStore, MarketDataCache, MemoryStore, RedisStore};
use crate::dispatch::{ExecutionBackend, FreqtradeClient, OrderDispatcher};
use crate::feed::MarketFeed;
use crate::notify::{Notifier, TelegramTarget};
use crate::rest::{RestClient, RetryPolicy};
use crate::runtime_config::{millis, secs, RuntimeConfig, Secrets};
use crate::stream::events::ALL_MARK_PRICE_STREAM;
use crate::stream::pool::StreamPool;
use crate::stream::session::PrivateSessionStream;
use crate::trigger::TriggerEngine;

const CONFIG_PATH: &str = "markwatch_config.json";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("markwatch starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env();
    let secrets = Secrets::from_env();
    info!(symbols = ?config.symbols, secrets = ?secrets, "configuration loaded");

    let root = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ── 2. Key-value store ───────────────────────────────────────────────
    let store: Arc<dyn KeyValueStore> = match &secrets.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await.context("redis connection failed")?),
        None => {
            warn!("MARKWATCH_REDIS_URL not set; using in-process store (state is lost on restart)");
            Arc::new(MemoryStore::new())
        }
    };

    // ── 3. Notifier ──────────────────────────────────────────────────────
    let telegram = match (&secrets.telegram_token, &secrets.telegram_chat_id) {
        (Some(token), Some(chat_id)) => Some(TelegramTarget {
            token: token.clone(),
            chat_id: chat_id.clone(),
        }),
        _ => None,
    };
    let (notifier, notify_task) = Notifier::start(telegram, HTTP_TIMEOUT, root.child_token())?;
    tasks.push(notify_task);

    // ── 4. REST clients ──────────────────────────────────────────────────
    let policy = RetryPolicy::from_config(&config.retry);
    let rest = RestClient::new(policy.clone(), HTTP_TIMEOUT, &root)?;
    let exchange = Arc::new(FuturesClient::new(
        secrets.binance_api_key.clone(),
        secrets.binance_api_secret.clone(),
        config.feed.rest_url.clone(),
        rest,
    ));

    // ── 5. Execution backend ─────────────────────────────────────────────
    dispatch::freqtrade::validate_backend_config(&secrets.freqtrade_url, &secrets.freqtrade_username)?;
    let freqtrade = Arc::new(FreqtradeClient::new(
        secrets.freqtrade_url.clone(),
        secrets.freqtrade_username.clone(),
        secrets.freqtrade_password.clone(),
        policy,
        HTTP_TIMEOUT,
        &root,
    )?);
    if let Err(e) = freqtrade.login().await {
        error!(error = %format!("{e:#}"), "freqtrade login failed; will retry on refresh");
        notifier.send(format!("⚠️ freqtrade login failed: {e:#}"));
    }
    tasks.push(freqtrade.spawn_token_refresher(secs(config.trigger.token_refresh_secs), root.child_token()));
    let backend: Arc<dyn ExecutionBackend> = freqtrade;

    // ── 6. Market data: cache, feed, stream pool ─────────────────────────
    let cache = Arc::new(MarketDataCache::with_book_ttl(secs(config.feed.book_ttl_secs)));
    let feed = Arc::new(MarketFeed::new(
        config.feed.clone(),
        config.symbols.clone(),
        cache.clone(),
        store.clone(),
        exchange.clone(),
        Some(backend.clone()),
    ));
    if let Err(e) = feed.sync_whitelist().await {
        warn!(error = %format!("{e:#}"), "initial whitelist sync failed");
    }
    let watched = feed.refresh_watched().await.unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "initial watched set unavailable");
        Vec::new()
    });

    let (alert_tx, alert_rx) = mpsc::unbounded_channel();
    let pool = StreamPool::new(config.stream.clone(), feed.clone(), alert_tx.clone(), &root);
    pool.start().await?;
    pool.subscribe(ALL_MARK_PRICE_STREAM)?;
    feed.sync_book_tickers(&pool, &watched);
    tasks.extend(feed.spawn(Some(pool.clone()), &root));

    // ── 7. Account stream ────────────────────────────────────────────────
    let session = if config.session.enabled && secrets.has_exchange_credentials() {
        Some(PrivateSessionStream::new(
            config.stream.url.clone(),
            config.session.clone(),
            exchange.clone(),
            alert_tx.clone(),
            &root,
        ))
    } else {
        info!("account stream disabled (no exchange credentials or disabled in config)");
        None
    };
    drop(alert_tx);

    // ── 8. Broadcaster & trigger engine ──────────────────────────────────
    let hub = Arc::new(Broadcaster::new(config.subscriber_buffer, cache.clone(), store.clone()));
    tasks.push(hub.spawn_price_pusher(millis(config.feed.price_push_ms), root.child_token()));

    let engine = Arc::new(TriggerEngine::new(
        store.clone(),
        cache.clone(),
        Arc::new(OrderDispatcher::new(backend.clone())),
        hub.clone(),
        notifier.clone(),
        config.trigger.clone(),
    ));
    match engine.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => warn!(recovered = n, "conditions interrupted mid-dispatch marked failed"),
        Err(e) => warn!(error = %format!("{e:#}"), "interrupted-dispatch recovery failed"),
    }
    tasks.push(engine.spawn(root.child_token()));

    // ── 9. Shared state ──────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState {
        config,
        admin_token: secrets.admin_token.clone(),
        cache,
        store,
        pool: pool.clone(),
        session: session.clone(),
        feed,
        engine,
        hub,
        exchange: exchange.clone(),
        backend,
        balances: RwLock::new(BTreeMap::new()),
        recent_errors: RwLock::new(VecDeque::new()),
        start_time: Instant::now(),
    });
    if state.admin_token.is_empty() {
        warn!("MARKWATCH_ADMIN_TOKEN is not set; protected endpoints will refuse every request");
    }

    {
        let state = state.clone();
        tasks.push(notifier.forward_alerts(alert_rx, root.child_token(), move |alert| {
            state.push_error(alert.describe());
        }));
    }

    if exchange.has_credentials() {
        match exchange.fetch_balances().await {
            Ok(balances) => state.set_balances(balances),
            Err(e) => warn!(error = %format!("{e:#}"), "initial balance fetch failed"),
        }
    }

    if let Some(session) = &session {
        let (event_tx, mut event_rx) = mpsc::channel(state.config.session.event_queue.max(1));
        match session.start(event_tx).await {
            Ok(()) => {
                let state = state.clone();
                let cancel = root.child_token();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            event = event_rx.recv() => match event {
                                Some(event) => state.apply_user_event(event),
                                None => break,
                            },
                        }
                    }
                }));
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "account stream failed to start");
                state.push_error(format!("account stream failed to start: {e:#}"));
            }
        }
    }

    // ── 10. HTTP server ──────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");
    let app = api::rest::router(state.clone());
    let server_cancel = root.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server failed");
        }
    });
    tasks.push(server);

    notifier.send("✅ markwatch started".to_string());

    // ── 11. Shutdown ─────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    root.cancel();

    if let Some(session) = &session {
        if let Err(e) = session.stop().await {
            warn!(error = %format!("{e:#}"), "account stream stop failed");
        }
    }
    pool.stop().await;

    let drain = futures_util::future::join_all(tasks);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "background tasks did not finish in time");
    }

    if let Err(e) = state.config.save(CONFIG_PATH) {
        error!(error = %format!("{e:#}"), "failed to save runtime config");
    }
    info!("markwatch stopped");
    Ok(())
}
