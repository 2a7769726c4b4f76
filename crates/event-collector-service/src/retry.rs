//! Exponential backoff shared by the broker reconnect loop and the flusher.

use rand::Rng;
use std::time::Duration;

/// Backoff schedule: `base * factor^attempt`, capped, optionally with full
/// jitter (a uniform draw over `[0, delay]`).
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub full_jitter: bool,
}

impl BackoffPolicy {
    /// Broker reconnect policy: base 1s, cap 30s, full jitter.
    pub fn reconnect() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(30),
            full_jitter: true,
        }
    }

    /// Flush retry policy: deterministic doubling from the configured
    /// interval; the attempt count is bounded by the caller.
    pub fn flush(base: Duration) -> Self {
        Self {
            base,
            factor: 2.0,
            cap: Duration::from_secs(120),
            full_jitter: false,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = self.factor.powi(attempt.min(24) as i32);
        let raw = self.base.as_secs_f64() * exponent;
        let capped = raw.min(self.cap.as_secs_f64());
        if self.full_jitter {
            let drawn = rand::thread_rng().gen_range(0.0..=capped);
            Duration::from_secs_f64(drawn)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}
