// =============================================================================
// Market Feed — ingestion policy between the transport and the price cache
// =============================================================================
//
// Responsibilities:
//   - handle decoded stream events (mark prices, book tickers)
//   - keep the watched set current: configured symbols ∪ selected
//     instruments ∪ instruments referenced by listening conditions
//   - keep one `<symbol>@bookTicker` subscription per watched instrument
//   - REST polling fallback for the watched set
//   - mirror the execution backend's whitelist into the selection flags
//
// Samples for unwatched instruments are dropped when `drop_unwatched` is on;
// otherwise they are cached but never written through to the store.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{KeyValueStore, MarketDataCache};
use crate::dispatch::{from_backend_pair, ExecutionBackend};
use crate::exchange::MarketDataSource;
use crate::runtime_config::{secs, FeedConfig};
use crate::stream::events::book_ticker_stream;
use crate::stream::pool::{MarketEventHandler, StreamPool};
use crate::types::{MarkPriceUpdate, PriceSample, Ticker};

const BOOK_TICKER_SUFFIX: &str = "@bookTicker";

#[derive(Debug, Clone, Serialize)]
pub struct FeedStats {
    pub watched: usize,
    pub cached: usize,
    pub ingested: u64,
    pub dropped_unwatched: u64,
    pub store_writes: u64,
    pub store_errors: u64,
}

pub struct MarketFeed {
    cfg: FeedConfig,
    static_symbols: Vec<String>,
    cache: Arc<MarketDataCache>,
    store: Arc<dyn KeyValueStore>,
    source: Arc<dyn MarketDataSource>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    ingested: AtomicU64,
    dropped: AtomicU64,
    writes: AtomicU64,
    write_errors: AtomicU64,
}

impl MarketFeed {
    pub fn new(
        cfg: FeedConfig,
        static_symbols: Vec<String>,
        cache: Arc<MarketDataCache>,
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn MarketDataSource>,
        backend: Option<Arc<dyn ExecutionBackend>>,
    ) -> Self {
        Self {
            cfg,
            static_symbols,
            cache,
            store,
            source,
            backend,
            ingested: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    /// Apply the ingestion policy to one sample. Returns whether it was
    /// cached.
    pub async fn ingest(&self, sample: PriceSample) -> bool {
        let watched = self.cache.is_watched(&sample.symbol);
        if !watched && self.cfg.drop_unwatched {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let stored = self.cache.put(sample);
        self.ingested.fetch_add(1, Ordering::Relaxed);
        if watched {
            self.write_through(&stored).await;
        }
        true
    }

    async fn write_through(&self, sample: &PriceSample) {
        match self.store.set_price(sample).await {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = %sample.symbol, error = %format!("{e:#}"), "price write-through failed");
            }
        }
    }

    /// Recompute the watched set from the store. Returns the new set.
    pub async fn refresh_watched(&self) -> Result<Vec<String>> {
        let mut watched: BTreeSet<String> = self.static_symbols.iter().cloned().collect();
        watched.extend(
            self.store
                .selected_instruments()
                .await
                .context("failed to load selected instruments")?,
        );
        watched.extend(
            self.store
                .list_active_estimates()
                .await
                .context("failed to load listening conditions")?
                .into_iter()
                .map(|c| c.symbol),
        );

        let watched: Vec<String> = watched.into_iter().collect();
        let before = self.cache.watched();
        if before != watched {
            info!(count = watched.len(), "watched instruments changed");
        }
        self.cache.set_watched_set(watched.iter().cloned());
        Ok(watched)
    }

    /// Bring the pool's book-ticker subscriptions in line with `watched`.
    pub fn sync_book_tickers(&self, pool: &StreamPool, watched: &[String]) {
        if !self.cfg.subscribe_book_tickers {
            return;
        }
        let current: Vec<String> = pool
            .desired_streams()
            .into_iter()
            .filter(|s| s.ends_with(BOOK_TICKER_SUFFIX))
            .collect();
        let (add, remove) = book_ticker_diff(&current, watched);
        for stream in &add {
            if let Err(e) = pool.subscribe(stream) {
                warn!(stream = %stream, error = %e, "book ticker subscribe failed");
            }
        }
        for stream in &remove {
            if let Err(e) = pool.unsubscribe(stream) {
                warn!(stream = %stream, error = %e, "book ticker unsubscribe failed");
            }
        }
        if !add.is_empty() || !remove.is_empty() {
            debug!(added = add.len(), removed = remove.len(), "book ticker subscriptions updated");
        }
    }

    /// Fetch mark prices and book tickers over REST for the watched set.
    /// Returns the number of samples stored.
    pub async fn poll_once(&self) -> Result<usize> {
        let watched = self.cache.watched();
        if watched.is_empty() {
            return Ok(0);
        }
        let marks = self
            .source
            .fetch_mark_prices(&watched)
            .await
            .context("mark price poll failed")?;
        let books: HashMap<String, Ticker> = match self.source.fetch_tickers(&watched).await {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %format!("{e:#}"), "book ticker poll failed, using mark price");
                HashMap::new()
            }
        };

        let mut stored = 0;
        for mut sample in marks {
            if sample.mark_price <= 0.0 {
                debug!(symbol = %sample.symbol, "skipping non-positive polled mark price");
                continue;
            }
            let book = books.get(&sample.symbol);
            sample.bid_price = Some(book.map(|t| t.bid_price).filter(|p| *p > 0.0).unwrap_or(sample.mark_price));
            sample.ask_price = Some(book.map(|t| t.ask_price).filter(|p| *p > 0.0).unwrap_or(sample.mark_price));
            if self.ingest(sample).await {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Mirror the backend whitelist (plus pairs with open trades) into the
    /// selection flags. Returns the number of flags changed.
    pub async fn sync_whitelist(&self) -> Result<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let mut wanted: BTreeSet<String> = backend
            .whitelist()
            .await?
            .iter()
            .map(|p| from_backend_pair(p))
            .filter(|s| !s.is_empty())
            .collect();
        if wanted.is_empty() {
            debug!("backend whitelist empty, selection left unchanged");
            return Ok(0);
        }
        match backend.trades().await {
            Ok(trades) => wanted.extend(
                trades
                    .iter()
                    .filter(|t| t.is_open)
                    .map(|t| from_backend_pair(&t.pair)),
            ),
            Err(e) => debug!(error = %format!("{e:#}"), "open trades unavailable for selection sync"),
        }

        let current: BTreeSet<String> = self.store.selected_instruments().await?.into_iter().collect();
        let mut changed = 0;
        for symbol in current.difference(&wanted) {
            self.store.set_selected(symbol, false).await?;
            changed += 1;
        }
        for symbol in wanted.difference(&current) {
            self.store.set_selected(symbol, true).await?;
            changed += 1;
        }
        if changed > 0 {
            info!(changed, selected = wanted.len(), "selection synced from backend whitelist");
        }
        Ok(changed)
    }

    /// Spawn the watched-set refresher, REST poller, and whitelist sync.
    pub fn spawn(self: &Arc<Self>, pool: Option<Arc<StreamPool>>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let feed = Arc::clone(self);
        let token = cancel.child_token();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(secs(feed.cfg.watch_refresh_secs.max(1)));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match feed.refresh_watched().await {
                        Ok(watched) => {
                            if let Some(pool) = &pool {
                                feed.sync_book_tickers(pool, &watched);
                            }
                        }
                        Err(e) => warn!(error = %format!("{e:#}"), "watched set refresh failed"),
                    },
                }
            }
        }));

        if self.cfg.poll_secs > 0 {
            let feed = Arc::clone(self);
            let token = cancel.child_token();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(secs(feed.cfg.poll_secs));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => match feed.poll_once().await {
                            Ok(n) => debug!(stored = n, "REST price poll complete"),
                            Err(e) => warn!(error = %format!("{e:#}"), "REST price poll failed"),
                        },
                    }
                }
            }));
        }

        if self.backend.is_some() && self.cfg.whitelist_sync_secs > 0 {
            let feed = Arc::clone(self);
            let token = cancel.child_token();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(secs(feed.cfg.whitelist_sync_secs));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = feed.sync_whitelist().await {
                                warn!(error = %format!("{e:#}"), "whitelist sync failed");
                            }
                        }
                    }
                }
            }));
        }

        handles
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            watched: self.cache.watched().len(),
            cached: self.cache.len(),
            ingested: self.ingested.load(Ordering::Relaxed),
            dropped_unwatched: self.dropped.load(Ordering::Relaxed),
            store_writes: self.writes.load(Ordering::Relaxed),
            store_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl MarketEventHandler for MarketFeed {
    async fn on_mark_price(&self, update: MarkPriceUpdate) -> Result<()> {
        self.ingest(update.into_sample()).await;
        Ok(())
    }

    async fn on_book_ticker(&self, ticker: Ticker) -> Result<()> {
        if !self.cache.is_watched(&ticker.symbol) {
            return Ok(());
        }
        if let Some(merged) = self.cache.merge_book(&ticker) {
            self.write_through(&merged).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MarketFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketFeed")
            .field("static_symbols", &self.static_symbols)
            .field("drop_unwatched", &self.cfg.drop_unwatched)
            .finish()
    }
}

/// Streams to subscribe and unsubscribe so that exactly the watched
/// instruments carry a book-ticker stream.
pub fn book_ticker_diff(current: &[String], watched: &[String]) -> (Vec<String>, Vec<String>) {
    let want: BTreeSet<String> = watched.iter().map(|s| book_ticker_stream(s)).collect();
    let have: BTreeSet<String> = current.iter().cloned().collect();
    (
        want.difference(&have).cloned().collect(),
        have.difference(&want).cloned().collect(),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::tests::condition;
    use crate::cache::MemoryStore;
    use crate::dispatch::dispatcher::tests::{open_trade, RecordingBackend};
    use crate::types::{ActionType, Kline, Market, MarketFilter, Side};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeSource {
        marks: Mutex<Vec<PriceSample>>,
        books: Mutex<HashMap<String, Ticker>>,
    }

    #[async_trait]
    impl MarketDataSource for FakeSource {
        async fn fetch_markets(&self, _filter: &MarketFilter) -> Result<Vec<Market>> {
            Ok(Vec::new())
        }

        async fn fetch_tickers(&self, _symbols: &[String]) -> Result<HashMap<String, Ticker>> {
            Ok(self.books.lock().clone())
        }

        async fn fetch_klines(&self, _: &str, _: &str, _: Option<i64>, _: u32) -> Result<Vec<Kline>> {
            Ok(Vec::new())
        }

        async fn fetch_mark_prices(&self, _symbols: &[String]) -> Result<Vec<PriceSample>> {
            Ok(self.marks.lock().clone())
        }
    }

    fn feed(
        drop_unwatched: bool,
        source: Arc<FakeSource>,
        backend: Option<Arc<dyn ExecutionBackend>>,
    ) -> (MarketFeed, Arc<MarketDataCache>, Arc<MemoryStore>) {
        let cache = Arc::new(MarketDataCache::new());
        let store = Arc::new(MemoryStore::new());
        let cfg = FeedConfig {
            drop_unwatched,
            ..FeedConfig::default()
        };
        let feed = MarketFeed::new(
            cfg,
            vec!["BTCUSDT".into()],
            cache.clone(),
            store.clone(),
            source,
            backend,
        );
        (feed, cache, store)
    }

    #[tokio::test]
    async fn watched_set_is_union_of_sources() {
        let (feed, cache, store) = feed(true, Arc::new(FakeSource::default()), None);
        store.set_selected("ETHUSDT", true).await.unwrap();
        store
            .set_estimate(&condition("e", "SOLUSDT", Side::Long, ActionType::Open, 1.0))
            .await
            .unwrap();

        let watched = feed.refresh_watched().await.unwrap();
        assert_eq!(watched, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        assert!(cache.is_watched("SOLUSDT"));
    }

    #[tokio::test]
    async fn unwatched_samples_are_dropped_and_watched_written_through() {
        let (feed, cache, store) = feed(true, Arc::new(FakeSource::default()), None);
        feed.refresh_watched().await.unwrap();

        assert!(!feed.ingest(PriceSample::new("DOGEUSDT", 0.1, 1)).await);
        assert!(feed.ingest(PriceSample::new("BTCUSDT", 50_000.0, 1)).await);
        assert!(cache.get("DOGEUSDT").is_none());
        assert_eq!(store.get_price("BTCUSDT").await.unwrap().unwrap().mark_price, 50_000.0);
        assert_eq!(feed.stats().dropped_unwatched, 1);
    }

    #[tokio::test]
    async fn keep_policy_caches_but_does_not_write_unwatched() {
        let (feed, cache, store) = feed(false, Arc::new(FakeSource::default()), None);
        feed.refresh_watched().await.unwrap();
        assert!(feed.ingest(PriceSample::new("DOGEUSDT", 0.1, 1)).await);
        assert!(cache.get("DOGEUSDT").is_some());
        assert!(store.get_price("DOGEUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_falls_back_to_mark_for_book_and_skips_bad_prices() {
        let source = Arc::new(FakeSource::default());
        source.marks.lock().push(PriceSample::new("BTCUSDT", 100.0, 1));
        source.marks.lock().push(PriceSample::new("ETHUSDT", 0.0, 1));
        let (feed, cache, store) = feed(true, source, None);
        store.set_selected("ETHUSDT", true).await.unwrap();
        feed.refresh_watched().await.unwrap();

        assert_eq!(feed.poll_once().await.unwrap(), 1);
        let btc = cache.get("BTCUSDT").unwrap();
        assert_eq!(btc.bid_price, Some(100.0));
        assert_eq!(btc.ask_price, Some(100.0));
        assert!(cache.get("ETHUSDT").is_none());
    }

    #[tokio::test]
    async fn book_ticker_merges_for_watched_only() {
        let (feed, cache, _) = feed(true, Arc::new(FakeSource::default()), None);
        feed.refresh_watched().await.unwrap();
        feed.ingest(PriceSample::new("BTCUSDT", 100.0, 1)).await;

        let ticker = Ticker {
            symbol: "BTCUSDT".into(),
            bid_price: 99.5,
            bid_qty: 1.0,
            ask_price: 100.5,
            ask_qty: 1.0,
            time: 2,
        };
        feed.on_book_ticker(ticker).await.unwrap();
        assert_eq!(cache.get("BTCUSDT").unwrap().bid_price, Some(99.5));
    }

    #[tokio::test]
    async fn whitelist_sync_replaces_selection() {
        let backend = RecordingBackend::default();
        backend
            .trades
            .lock()
            .push(open_trade(1, "XRP/USDT:USDT", true, 1.0, 1.0));
        let backend: Arc<dyn ExecutionBackend> = Arc::new(WhitelistBackend {
            inner: backend,
            pairs: vec!["BTC/USDT:USDT".into(), "ETH/USDT:USDT".into()],
        });
        let (feed, _, store) = feed(true, Arc::new(FakeSource::default()), Some(backend));
        store.set_selected("DOGEUSDT", true).await.unwrap();
        store.set_selected("BTCUSDT", true).await.unwrap();

        assert_eq!(feed.sync_whitelist().await.unwrap(), 3);
        assert_eq!(
            store.selected_instruments().await.unwrap(),
            vec!["BTCUSDT", "ETHUSDT", "XRPUSDT"]
        );
    }

    #[test]
    fn book_ticker_diff_adds_and_removes() {
        let current = vec!["btcusdt@bookTicker".to_string(), "dogeusdt@bookTicker".to_string()];
        let watched = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let (add, remove) = book_ticker_diff(&current, &watched);
        assert_eq!(add, vec!["ethusdt@bookTicker"]);
        assert_eq!(remove, vec!["dogeusdt@bookTicker"]);
    }

    struct WhitelistBackend {
        inner: RecordingBackend,
        pairs: Vec<String>,
    }

    #[async_trait]
    impl ExecutionBackend for WhitelistBackend {
        async fn submit(&self, intent: &crate::dispatch::OrderIntent) -> Result<()> {
            self.inner.submit(intent).await
        }
        async fn trades(&self) -> Result<Vec<crate::dispatch::TradePosition>> {
            self.inner.trades().await
        }
        async fn trade_count(&self) -> Result<crate::dispatch::TradeCount> {
            self.inner.trade_count().await
        }
        async fn whitelist(&self) -> Result<Vec<String>> {
            Ok(self.pairs.clone())
        }
    }
}
