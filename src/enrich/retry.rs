// src/enrich/retry.rs
//! Retry policy for enrichment tasks.
//!
//! ```text
//! delay(attempt) = min(base * 2^(attempt-1), max) + jitter,  jitter < 25% of the capped delay
//! ```
//!
//! Below the cap each delay is at least double the previous exponential
//! term, so jitter can never make a later retry come sooner than an
//! earlier one.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::EnrichError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const JITTER_RATIO: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-enqueue as `attempt` after `delay`.
    Retry { delay: Duration, attempt: u32 },
    /// Terminal: hand the task to the dead-letter sink.
    GiveUp { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: true,
        }
    }

    /// Deterministic delays (tests).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what happens after `attempt` (1-indexed) failed with `err`.
    ///
    /// `Unavailable` is not a retry case (the worker falls back locally) and
    /// is treated like `Permanent` if it ever reaches here.
    pub fn should_retry(&self, err: &EnrichError, attempt: u32) -> RetryDecision {
        match err {
            EnrichError::Transient(_) => {}
            EnrichError::Permanent(reason) | EnrichError::Unavailable(reason) => {
                return RetryDecision::GiveUp {
                    reason: format!("{}: {reason}", err.kind()),
                };
            }
        }
        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::GiveUp {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt),
            attempt: attempt + 1,
        }
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let ms = (self.base_delay.as_millis() as f64 * 2f64.powi(exp))
            .min(self.max_delay.as_millis() as f64);
        let capped = Duration::from_millis(ms as u64);
        if !self.jitter {
            return capped;
        }
        // Strictly below the ratio so two consecutive uncapped delays never meet.
        let cap = ((ms * JITTER_RATIO) as u64).saturating_sub(1);
        if cap == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::rng().random_range(0..=cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> EnrichError {
        EnrichError::Transient("503".into())
    }

    #[test]
    fn retries_until_max_attempts() {
        let p = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10));
        assert!(matches!(
            p.should_retry(&transient(), 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            p.should_retry(&transient(), 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert!(matches!(
            p.should_retry(&transient(), 3),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn permanent_never_retries() {
        let p = RetryPolicy::default();
        assert!(matches!(
            p.should_retry(&EnrichError::Permanent("422".into()), 1),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn jittered_delays_strictly_increase_below_cap() {
        let p = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(600));
        for _ in 0..50 {
            let mut prev = Duration::ZERO;
            for attempt in 1..8 {
                let d = p.delay_for(attempt);
                assert!(d > prev, "attempt {attempt}: {d:?} <= {prev:?}");
                prev = d;
            }
        }
    }

    #[test]
    fn delay_is_capped() {
        let p = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(4)).without_jitter();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(9), Duration::from_secs(4));
    }
}
