// =============================================================================
// Backoff & pacing helpers shared by the streaming and REST layers
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

/// Exponential backoff: `min(base * 2^attempt, max)`.
///
/// Saturates instead of overflowing for large attempt numbers, so the
/// sequence is non-decreasing and never exceeds `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Apply a symmetric random jitter of `±ratio` to `delay`.
///
/// Falls back to `floor` if the jittered value would not be positive.
pub fn with_jitter(delay: Duration, ratio: f64, floor: Duration) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(-ratio..=ratio);
    let jittered = delay.as_secs_f64() * (1.0 + factor);
    if jittered <= 0.0 {
        floor
    } else {
        Duration::from_secs_f64(jittered)
    }
}

// ── Message pacer ────────────────────────────────────────────────────────────

/// Enforces a minimum spacing between outbound control frames.
///
/// Slots are reserved under a short lock and the wait happens after the lock
/// is released, so concurrent callers queue up in reservation order.
pub struct MessagePacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl MessagePacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserve the next send slot and return how long to wait for it.
    fn reserve(&self, now: Instant) -> Duration {
        let mut slot = self.next_slot.lock();
        let at = match *slot {
            Some(next) if next > now => next,
            _ => now,
        };
        *slot = Some(at + self.interval);
        at.saturating_duration_since(now)
    }

    /// Wait until a send slot is available.
    pub async fn acquire(&self) {
        let wait = self.reserve(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for MessagePacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePacer")
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_doubles_base() {
        let d = backoff_delay(Duration::from_secs(1), Duration::from_secs(30), 1);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn sequence_is_non_decreasing_and_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        let mut prev = Duration::ZERO;
        for attempt in 0..100 {
            let d = backoff_delay(base, max, attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= max);
            prev = d;
        }
        assert_eq!(backoff_delay(base, max, 7), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let d = Duration::from_secs(10);
        for _ in 0..200 {
            let j = with_jitter(d, 0.1, Duration::from_millis(1));
            assert!(j >= Duration::from_millis(8_999) && j <= Duration::from_millis(11_001));
        }
        assert_eq!(with_jitter(d, 0.0, Duration::ZERO), d);
    }

    #[test]
    fn pacer_spaces_reservations() {
        let pacer = MessagePacer::new(Duration::from_millis(200));
        let now = Instant::now();
        assert_eq!(pacer.reserve(now), Duration::ZERO);
        assert_eq!(pacer.reserve(now), Duration::from_millis(200));
        assert_eq!(pacer.reserve(now), Duration::from_millis(400));
        let later = now + Duration::from_secs(5);
        assert_eq!(pacer.reserve(later), Duration::ZERO);
    }
}
