// src/ingest/backoff.rs
//! Delay before the next poll of a source after a failed run.
//!
//! `delay = max(interval, min(base * 2^(failures-1), max) + jitter)`
//!
//! The configured interval is a floor: a degraded source is never polled
//! more often than a healthy one. A rate-limit hint replaces the
//! exponential part but still respects the floor.

use std::time::Duration;

use rand::Rng;

use crate::ingest::types::SourceError;

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorBackoff {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound on jitter, as a fraction of the exponential delay.
    pub jitter_ratio: f64,
}

impl Default for CollectorBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30 * 60),
            jitter_ratio: 0.2,
        }
    }
}

impl CollectorBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            ..Self::default()
        }
    }

    /// Exponential part without jitter, for `consecutive_failures >= 1`.
    pub fn raw_delay(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(31);
        let ms = (self.base.as_millis() as f64) * 2f64.powi(exp as i32);
        Duration::from_millis(ms.min(self.max.as_millis() as f64) as u64)
    }

    /// Wait before the next run of a source polled every `interval`.
    pub fn next_delay(
        &self,
        interval: Duration,
        consecutive_failures: u32,
        err: &SourceError,
    ) -> Duration {
        if consecutive_failures == 0 {
            return interval;
        }
        let backoff = match err {
            SourceError::RateLimited {
                retry_after: Some(hint),
            } => *hint,
            _ => {
                let raw = self.raw_delay(consecutive_failures);
                raw + self.jitter(raw)
            }
        };
        backoff.max(interval)
    }

    fn jitter(&self, raw: Duration) -> Duration {
        let cap = (raw.as_millis() as f64 * self.jitter_ratio) as u64;
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> SourceError {
        SourceError::Transient("503".into())
    }

    #[test]
    fn never_shorter_than_interval() {
        let b = CollectorBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let interval = Duration::from_secs(60);
        for n in 1..10 {
            assert!(b.next_delay(interval, n, &transient()) >= interval);
        }
    }

    #[test]
    fn grows_then_caps() {
        let b = CollectorBackoff::new(Duration::from_secs(10), Duration::from_secs(120));
        assert_eq!(b.raw_delay(1), Duration::from_secs(10));
        assert_eq!(b.raw_delay(2), Duration::from_secs(20));
        assert_eq!(b.raw_delay(4), Duration::from_secs(80));
        assert_eq!(b.raw_delay(5), Duration::from_secs(120));
        assert_eq!(b.raw_delay(40), Duration::from_secs(120));

        let d = b.next_delay(Duration::from_secs(1), 3, &transient());
        assert!(d >= Duration::from_secs(40) && d <= Duration::from_secs(48));
    }

    #[test]
    fn rate_limit_hint_is_honored() {
        let b = CollectorBackoff::default();
        let err = SourceError::RateLimited {
            retry_after: Some(Duration::from_secs(900)),
        };
        assert_eq!(
            b.next_delay(Duration::from_secs(60), 1, &err),
            Duration::from_secs(900)
        );
        assert_eq!(
            b.next_delay(Duration::from_secs(60), 0, &err),
            Duration::from_secs(60)
        );
    }
}
