// =============================================================================
// Runtime Configuration — service settings with atomic save
// =============================================================================
//
// Every tunable lives here, grouped by component. All fields carry a serde
// default so an older or partial JSON file still loads. Secrets are not part
// of this file; they come from the environment (see `Secrets`).
//
// Persistence uses the tmp + rename pattern so a crash mid-write cannot leave
// a truncated file behind.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_stream_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}

fn default_rest_url() -> String {
    crate::binance::DEFAULT_REST_URL.to_string()
}

fn default_max_connections() -> usize {
    5
}

fn default_streams_per_connection() -> usize {
    200
}

fn default_pool_reconnect_attempts() -> u32 {
    3
}

fn default_batch_size() -> usize {
    20
}

fn default_batch_interval_ms() -> u64 {
    200
}

fn default_health_check_secs() -> u64 {
    15
}

fn default_process_concurrency() -> usize {
    20
}

fn default_message_interval_ms() -> u64 {
    200
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_keepalive_secs() -> u64 {
    30 * 60
}

fn default_session_health_secs() -> u64 {
    10
}

fn default_message_timeout_secs() -> u64 {
    65 * 60
}

fn default_session_reconnect_attempts() -> u32 {
    100
}

fn default_session_queue() -> usize {
    1_000
}

fn default_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_watch_refresh_secs() -> u64 {
    30
}

fn default_poll_secs() -> u64 {
    15
}

fn default_whitelist_sync_secs() -> u64 {
    60
}

fn default_tick_ms() -> u64 {
    1_000
}

fn default_short_funding_threshold() -> f64 {
    -0.002
}

fn default_token_refresh_secs() -> u64 {
    10 * 60
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_price_push_ms() -> u64 {
    1_000
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_kline_cache_secs() -> u64 {
    60
}

fn default_book_ttl_secs() -> u64 {
    30
}

// =============================================================================
// Component sections
// =============================================================================

/// Shared streaming transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_streams_per_connection")]
    pub streams_per_connection: usize,
    /// Per-connection reconnect ceiling; `0` disables auto-reconnect.
    #[serde(default = "default_pool_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
    #[serde(default = "default_process_concurrency")]
    pub process_concurrency: usize,
    /// Minimum spacing between control frames sent upstream.
    #[serde(default = "default_message_interval_ms")]
    pub message_interval_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            max_connections: default_max_connections(),
            streams_per_connection: default_streams_per_connection(),
            max_reconnect_attempts: default_pool_reconnect_attempts(),
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            health_check_secs: default_health_check_secs(),
            process_concurrency: default_process_concurrency(),
            message_interval_ms: default_message_interval_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

/// Private account stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_session_health_secs")]
    pub health_check_secs: u64,
    /// Payload silence tolerated before the keepalive state is consulted.
    #[serde(default = "default_message_timeout_secs")]
    pub message_timeout_secs: u64,
    #[serde(default = "default_session_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_session_queue")]
    pub event_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keepalive_secs: default_keepalive_secs(),
            health_check_secs: default_session_health_secs(),
            message_timeout_secs: default_message_timeout_secs(),
            max_reconnect_attempts: default_session_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            event_queue: default_session_queue(),
        }
    }
}

/// REST retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retries(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
            jitter: true,
        }
    }
}

/// Market data cache and feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Drop samples for instruments outside the watched set.
    #[serde(default = "default_true")]
    pub drop_unwatched: bool,
    #[serde(default = "default_watch_refresh_secs")]
    pub watch_refresh_secs: u64,
    /// REST polling fallback interval; `0` disables polling.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default = "default_whitelist_sync_secs")]
    pub whitelist_sync_secs: u64,
    #[serde(default = "default_true")]
    pub subscribe_book_tickers: bool,
    #[serde(default = "default_price_push_ms")]
    pub price_push_ms: u64,
    #[serde(default = "default_kline_cache_secs")]
    pub kline_cache_secs: u64,
    /// Best bid/ask older than this is no longer attached to mark samples.
    #[serde(default = "default_book_ttl_secs")]
    pub book_ttl_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            drop_unwatched: true,
            watch_refresh_secs: default_watch_refresh_secs(),
            poll_secs: default_poll_secs(),
            whitelist_sync_secs: default_whitelist_sync_secs(),
            subscribe_book_tickers: true,
            price_push_ms: default_price_push_ms(),
            kline_cache_secs: default_kline_cache_secs(),
            book_ttl_secs: default_book_ttl_secs(),
        }
    }
}

/// Trigger evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Short opens are refused while the funding rate is below this value.
    #[serde(default = "default_short_funding_threshold")]
    pub short_funding_threshold: f64,
    #[serde(default = "default_token_refresh_secs")]
    pub token_refresh_secs: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            short_funding_threshold: default_short_funding_threshold(),
            token_refresh_secs: default_token_refresh_secs(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for markwatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Instruments always watched, in addition to the externally selected
    /// ones.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            symbols: Vec::new(),
            stream: StreamConfig::default(),
            session: SessionConfig::default(),
            retry: RetryConfig::default(),
            feed: FeedConfig::default(),
            trigger: TriggerConfig::default(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            max_connections = config.stream.max_connections,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply non-secret environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("MARKWATCH_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(syms) = std::env::var("MARKWATCH_SYMBOLS") {
            self.symbols = parse_symbol_list(&syms);
        }
        if let Ok(raw) = std::env::var("SHORT_FUNDING_RATE_THRESHOLD") {
            match raw.parse::<f64>() {
                Ok(v) => self.trigger.short_funding_threshold = v,
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid SHORT_FUNDING_RATE_THRESHOLD"),
            }
        }
    }
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

pub fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

// =============================================================================
// Secrets
// =============================================================================

/// Credentials read from the environment. Never serialised.
#[derive(Clone, Default)]
pub struct Secrets {
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub redis_url: Option<String>,
    pub admin_token: String,
    pub freqtrade_url: String,
    pub freqtrade_username: String,
    pub freqtrade_password: String,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            binance_api_key: env_opt("BINANCE_API_KEY").unwrap_or_default(),
            binance_api_secret: env_opt("BINANCE_API_SECRET").unwrap_or_default(),
            redis_url: env_opt("MARKWATCH_REDIS_URL"),
            admin_token: env_opt("MARKWATCH_ADMIN_TOKEN").unwrap_or_default(),
            freqtrade_url: env_opt("FREQTRADE_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            freqtrade_username: env_opt("FREQTRADE_USERNAME").unwrap_or_default(),
            freqtrade_password: env_opt("FREQTRADE_PASSWORD").unwrap_or_default(),
            telegram_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),
        }
    }

    pub fn has_exchange_credentials(&self) -> bool {
        !self.binance_api_key.is_empty() && !self.binance_api_secret.is_empty()
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("binance_api_key", &redact(&self.binance_api_key))
            .field("binance_api_secret", &"[REDACTED]")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[SET]"))
            .field("admin_token", &redact(&self.admin_token))
            .field("freqtrade_url", &self.freqtrade_url)
            .field("freqtrade_username", &self.freqtrade_username)
            .field("freqtrade_password", &"[REDACTED]")
            .field("telegram_token", &self.telegram_token.as_ref().map(|_| "[SET]"))
            .field("telegram_chat_id", &self.telegram_chat_id)
            .finish()
    }
}

fn redact(value: &str) -> String {
    if value.is_empty() {
        "<unset>".to_string()
    } else {
        let visible: String = value.chars().take(4).collect();
        format!("{visible}…")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.stream.max_connections, 5);
        assert_eq!(cfg.stream.streams_per_connection, 200);
        assert_eq!(cfg.stream.batch_size, 20);
        assert_eq!(cfg.stream.batch_interval_ms, 200);
        assert_eq!(cfg.stream.health_check_secs, 15);
        assert_eq!(cfg.session.keepalive_secs, 1800);
        assert_eq!(cfg.session.max_reconnect_attempts, 100);
        assert_eq!(cfg.retry.max_retries, 3);
        assert!(cfg.retry.jitter);
        assert!(cfg.feed.drop_unwatched);
        assert_eq!(cfg.feed.watch_refresh_secs, 30);
        assert!((cfg.trigger.short_funding_threshold + 0.002).abs() < f64::EPSILON);
        assert_eq!(cfg.subscriber_buffer, 256);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert!(cfg.symbols.is_empty());
        assert_eq!(cfg.stream.url, "wss://fstream.binance.com/ws");
        assert_eq!(cfg.trigger.tick_ms, 1000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "stream": { "max_connections": 2 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.stream.max_connections, 2);
        assert_eq!(cfg.stream.streams_per_connection, 200);
        assert_eq!(cfg.session.health_check_secs, 10);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("markwatch-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["SOLUSDT".into()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["SOLUSDT"]);
        assert!(!path.with_extension("json.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn symbol_list_is_normalised() {
        assert_eq!(parse_symbol_list(" btcusdt, ,ethusdt "), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn secrets_debug_redacts() {
        let s = Secrets {
            binance_api_secret: "very-secret".into(),
            freqtrade_password: "hunter2".into(),
            ..Default::default()
        };
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("very-secret"));
        assert!(!dbg.contains("hunter2"));
    }
}
