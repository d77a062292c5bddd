// =============================================================================
// Market Data Cache — last-known price per instrument plus the watched set
// =============================================================================
//
// Many readers (trigger engine, broadcaster, HTTP handlers), few writers (the
// stream handler and the REST poller). Both maps sit behind `RwLock`s and no
// guard escapes a method, so nothing here can be held across an `.await`.
//
// The cache also remembers which instruments changed since the broadcaster
// last asked, so price pushes only carry updated samples.
//
// Best bid/ask live in their own map stamped with exchange time. A mark
// sample without a quote inherits the last one only while it is younger than
// the book TTL, measured against the sample's own timestamp.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::RwLock;

use crate::types::{PriceSample, Ticker};

const DEFAULT_BOOK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct BookQuote {
    bid: f64,
    ask: f64,
    /// Exchange time (ms).
    quoted_at: i64,
}

pub struct MarketDataCache {
    samples: RwLock<HashMap<String, PriceSample>>,
    books: RwLock<HashMap<String, BookQuote>>,
    book_ttl_ms: i64,
    watched: RwLock<HashSet<String>>,
    /// Instruments written since the last `take_updated`.
    updated: RwLock<HashSet<String>>,
}

impl MarketDataCache {
    pub fn new() -> Self {
        Self::with_book_ttl(DEFAULT_BOOK_TTL)
    }

    pub fn with_book_ttl(book_ttl: Duration) -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            book_ttl_ms: i64::try_from(book_ttl.as_millis()).unwrap_or(i64::MAX),
            watched: RwLock::new(HashSet::new()),
            updated: RwLock::new(HashSet::new()),
        }
    }

    /// Store `sample`, replacing any earlier one for the instrument. A
    /// sample without bid/ask picks up the last book quote unless it has
    /// expired. Returns the stored sample.
    pub fn put(&self, mut sample: PriceSample) -> PriceSample {
        let symbol = sample.symbol.clone();
        {
            let mut books = self.books.write();
            match (sample.bid_price, sample.ask_price) {
                (Some(bid), Some(ask)) => {
                    books.insert(
                        symbol.clone(),
                        BookQuote {
                            bid,
                            ask,
                            quoted_at: sample.timestamp,
                        },
                    );
                }
                _ => {
                    let fresh = books
                        .get(&symbol)
                        .filter(|q| sample.timestamp.saturating_sub(q.quoted_at) <= self.book_ttl_ms)
                        .copied();
                    match fresh {
                        Some(q) => {
                            sample.bid_price = sample.bid_price.or(Some(q.bid));
                            sample.ask_price = sample.ask_price.or(Some(q.ask));
                        }
                        None => {
                            books.remove(&symbol);
                        }
                    }
                }
            }
        }
        self.samples.write().insert(symbol.clone(), sample.clone());
        self.updated.write().insert(symbol);
        sample
    }

    /// Record best bid/ask and merge it into the existing sample. Returns the
    /// merged sample, or `None` when no mark price is known yet for the
    /// instrument.
    pub fn merge_book(&self, ticker: &Ticker) -> Option<PriceSample> {
        let merged = {
            let mut samples = self.samples.write();
            let sample = samples.get_mut(&ticker.symbol);
            let quoted_at = match &sample {
                Some(s) if ticker.time <= 0 => s.timestamp,
                _ => ticker.time,
            };
            self.books.write().insert(
                ticker.symbol.clone(),
                BookQuote {
                    bid: ticker.bid_price,
                    ask: ticker.ask_price,
                    quoted_at,
                },
            );
            let sample = sample?;
            sample.bid_price = Some(ticker.bid_price);
            sample.ask_price = Some(ticker.ask_price);
            sample.clone()
        };
        self.updated.write().insert(ticker.symbol.clone());
        Some(merged)
    }

    pub fn get(&self, symbol: &str) -> Option<PriceSample> {
        self.samples.read().get(symbol).cloned()
    }

    pub fn set_watched_set<I>(&self, symbols: I)
    where
        I: IntoIterator<Item = String>,
    {
        let next: HashSet<String> = symbols.into_iter().collect();
        *self.watched.write() = next;
    }

    pub fn is_watched(&self, symbol: &str) -> bool {
        self.watched.read().contains(symbol)
    }

    /// Sorted copy of the watched set.
    pub fn watched(&self) -> Vec<String> {
        let mut out: Vec<String> = self.watched.read().iter().cloned().collect();
        out.sort();
        out
    }

    pub fn snapshot(&self) -> Vec<PriceSample> {
        let mut out: Vec<PriceSample> = self.samples.read().values().cloned().collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Samples written since the previous call.
    pub fn take_updated(&self) -> Vec<PriceSample> {
        let symbols: Vec<String> = self.updated.write().drain().collect();
        if symbols.is_empty() {
            return Vec::new();
        }
        let samples = self.samples.read();
        symbols
            .iter()
            .filter_map(|s| samples.get(s).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }
}

impl Default for MarketDataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarketDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataCache")
            .field("samples", &self.samples.read().len())
            .field("watched", &self.watched.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str, bid: f64, ask: f64) -> Ticker {
        Ticker {
            symbol: symbol.into(),
            bid_price: bid,
            bid_qty: 1.0,
            ask_price: ask,
            ask_qty: 1.0,
            time: 0,
        }
    }

    #[test]
    fn put_then_get_returns_same_identity() {
        let cache = MarketDataCache::new();
        cache.put(PriceSample::new("BTCUSDT", 43_000.0, 1_000));
        let got = cache.get("BTCUSDT").unwrap();
        assert_eq!(got.symbol, "BTCUSDT");
        assert_eq!(got.mark_price, 43_000.0);
        assert_eq!(got.timestamp, 1_000);
        assert!(cache.get("ETHUSDT").is_none());
    }

    #[test]
    fn later_write_wins_and_keeps_book() {
        let cache = MarketDataCache::new();
        cache.put(PriceSample::new("ETHUSDT", 2_000.0, 1));
        assert!(cache.merge_book(&ticker("ETHUSDT", 1_999.5, 2_000.5)).is_some());
        cache.put(PriceSample::new("ETHUSDT", 2_010.0, 2));

        let got = cache.get("ETHUSDT").unwrap();
        assert_eq!(got.mark_price, 2_010.0);
        assert_eq!(got.bid_price, Some(1_999.5));
        assert_eq!(got.ask_price, Some(2_000.5));
    }

    #[test]
    fn stale_book_quote_is_not_carried_forward() {
        let cache = MarketDataCache::with_book_ttl(Duration::from_secs(5));
        cache.put(PriceSample::new("ETHUSDT", 2_000.0, 1_000));
        let mut quote = ticker("ETHUSDT", 1_999.5, 2_000.5);
        quote.time = 1_000;
        cache.merge_book(&quote);

        let fresh = cache.put(PriceSample::new("ETHUSDT", 2_001.0, 4_000));
        assert_eq!(fresh.bid_price, Some(1_999.5));

        let stale = cache.put(PriceSample::new("ETHUSDT", 2_002.0, 7_000));
        assert_eq!(stale.bid_price, None);
        assert_eq!(stale.ask_price, None);
        assert_eq!(cache.get("ETHUSDT").unwrap().ask_price, None);

        // Gone for good, even for an out-of-order older sample.
        assert_eq!(cache.put(PriceSample::new("ETHUSDT", 2_000.0, 2_000)).bid_price, None);
    }

    #[test]
    fn book_without_mark_is_ignored() {
        let cache = MarketDataCache::new();
        assert!(cache.merge_book(&ticker("SOLUSDT", 1.0, 2.0)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn watched_set_is_replaced_wholesale() {
        let cache = MarketDataCache::new();
        cache.set_watched_set(vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(cache.is_watched("BTCUSDT"));
        cache.set_watched_set(vec!["ETHUSDT".to_string()]);
        assert!(!cache.is_watched("BTCUSDT"));
        assert_eq!(cache.watched(), vec!["ETHUSDT"]);
    }

    #[test]
    fn take_updated_drains() {
        let cache = MarketDataCache::new();
        cache.put(PriceSample::new("BTCUSDT", 1.0, 1));
        cache.put(PriceSample::new("BTCUSDT", 2.0, 2));
        cache.put(PriceSample::new("ETHUSDT", 3.0, 3));

        let mut first = cache.take_updated();
        first.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].mark_price, 2.0);
        assert!(cache.take_updated().is_empty());
    }
}
