// =============================================================================
// Request-weight tracker — USD-M futures REST usage
// =============================================================================
//
// Binance futures allow 2 400 request weight per minute per IP. Every
// response carries `X-MBX-USED-WEIGHT-1M`; the tracker keeps the latest value
// (and the peak) in atomics so the stats endpoint can read them lock-free.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use reqwest::header::HeaderMap;
use serde::Serialize;
use tracing::{debug, warn};

/// Exchange-side weight limit per minute.
pub const WEIGHT_LIMIT_1M: u32 = 2400;
/// Log a warning once usage crosses this share of the limit.
const WARN_RATIO: f64 = 0.8;

pub struct WeightTracker {
    used_weight_1m: AtomicU32,
    peak_weight_1m: AtomicU32,
    rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightSnapshot {
    pub used_weight_1m: u32,
    pub peak_weight_1m: u32,
    pub limit_1m: u32,
    pub headroom_1m: u32,
    pub rate_limited_responses: u64,
}

impl WeightTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            peak_weight_1m: AtomicU32::new(0),
            rate_limited: AtomicU64::new(0),
        }
    }

    pub fn update_from_headers(&self, headers: &HeaderMap) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let previous = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        self.peak_weight_1m.fetch_max(weight, Ordering::Relaxed);

        let threshold = (WEIGHT_LIMIT_1M as f64 * WARN_RATIO) as u32;
        if weight >= threshold && previous < threshold {
            warn!(
                used_weight = weight,
                limit = WEIGHT_LIMIT_1M,
                "futures request weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "request weight updated");
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Weight still available in the current minute, as last reported.
    pub fn headroom(&self) -> u32 {
        WEIGHT_LIMIT_1M.saturating_sub(self.used_weight_1m.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> WeightSnapshot {
        WeightSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            peak_weight_1m: self.peak_weight_1m.load(Ordering::Relaxed),
            limit_1m: WEIGHT_LIMIT_1M,
            headroom_1m: self.headroom(),
            rate_limited_responses: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

impl Default for WeightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WeightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_latest_and_peak_weight() {
        let tracker = WeightTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", "2000".parse().unwrap());
        tracker.update_from_headers(&headers);
        headers.insert("X-MBX-USED-WEIGHT-1M", "15".parse().unwrap());
        tracker.update_from_headers(&headers);
        tracker.update_from_headers(&HeaderMap::new());

        let snap = tracker.snapshot();
        assert_eq!(snap.used_weight_1m, 15);
        assert_eq!(snap.peak_weight_1m, 2000);
        assert_eq!(tracker.headroom(), WEIGHT_LIMIT_1M - 15);
    }
}
