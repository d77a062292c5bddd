// =============================================================================
// REST retry layer — error classification and exponential backoff
// =============================================================================
//
// Transient failures (timeouts, resets, 429, 502/503/504) are retried with
// capped exponential backoff and ±10% jitter. Everything else, including
// authentication and permission failures, is returned to the caller on the
// first occurrence.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::runtime_config::{millis, RetryConfig};
use crate::stream::backoff::{backoff_delay, with_jitter};

const JITTER_RATIO: f64 = 0.1;

/// Classified outcome of a failed REST call.
#[derive(Debug, Clone, PartialEq)]
pub enum RestError {
    Timeout(String),
    Network(String),
    RateLimited {
        retry_after: Option<Duration>,
        body: String,
    },
    Unavailable {
        status: u16,
        body: String,
    },
    /// 401 / 403.
    Auth {
        status: u16,
        body: String,
    },
    BadRequest {
        status: u16,
        body: String,
    },
    Exchange {
        status: u16,
        body: String,
    },
    Decode(String),
    /// The request could not be built or replayed.
    Invalid(String),
    Cancelled,
}

impl RestError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Network(_) | Self::RateLimited { .. } | Self::Unavailable { .. }
        )
    }

    pub fn from_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> Self {
        let code = status.as_u16();
        match code {
            400 => Self::BadRequest { status: code, body },
            401 | 403 => Self::Auth { status: code, body },
            429 => Self::RateLimited { retry_after, body },
            502 | 503 => Self::Unavailable { status: code, body },
            504 => Self::Timeout(format!("gateway timeout: {body}")),
            404 | 500 => Self::Exchange { status: code, body },
            c if (400..500).contains(&c) => Self::BadRequest { status: code, body },
            c if c >= 500 => Self::Exchange { status: code, body },
            _ => Self::Network(format!("unexpected HTTP {code}: {body}")),
        }
    }

    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_builder() {
            Self::Invalid(e.to_string())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            // Connect failures, resets, and broken bodies are all transport
            // problems.
            Self::Network(e.to_string())
        }
    }
}

impl std::fmt::Display for RestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(m) => write!(f, "request timed out: {m}"),
            Self::Network(m) => write!(f, "network error: {m}"),
            Self::RateLimited { retry_after, body } => {
                write!(f, "rate limited (retry after {retry_after:?}): {body}")
            }
            Self::Unavailable { status, body } => write!(f, "service unavailable ({status}): {body}"),
            Self::Auth { status, body } => write!(f, "authentication failed ({status}): {body}"),
            Self::BadRequest { status, body } => write!(f, "bad request ({status}): {body}"),
            Self::Exchange { status, body } => write!(f, "upstream error ({status}): {body}"),
            Self::Decode(m) => write!(f, "failed to decode response: {m}"),
            Self::Invalid(m) => write!(f, "invalid request: {m}"),
            Self::Cancelled => write!(f, "request cancelled by shutdown"),
        }
    }
}

impl std::error::Error for RestError {}

// =============================================================================
// Policy
// =============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: millis(cfg.base_delay_ms),
            max_delay: millis(cfg.max_delay_ms),
            jitter: cfg.jitter,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = backoff_delay(self.base_delay, self.max_delay, attempt);
        if self.jitter && attempt > 0 {
            with_jitter(delay, JITTER_RATIO, self.base_delay)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. The last error is returned unchanged.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RestError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RestError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }

        let mut delay = policy.delay_for(attempt);
        if let RestError::RateLimited {
            retry_after: Some(after),
            ..
        } = &err
        {
            delay = delay.max(*after);
        }

        warn!(
            op = label,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient REST failure — retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RestError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

// =============================================================================
// Tests
// =============================================================================
