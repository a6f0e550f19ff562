//! Retry policy and backoff arithmetic.

use anyhow::{Result, bail};
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default upper bound on any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Default growth factor between consecutive delays.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Jitter is drawn uniformly from +/- this fraction of the computed delay.
pub const JITTER_FRACTION: f64 = 0.25;

/// Transient HTTP statuses retried by default.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Message fragments that mark an otherwise unclassified error as transient.
pub const DEFAULT_RETRYABLE_ERROR_SUBSTRINGS: [&str; 4] = [
    "temporary failure",
    "try again",
    "server misbehaving",
    "too many open connections",
];

/// Exponential backoff policy. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    retryable_error_substrings: HashSet<String>,
    retryable_status_codes: HashSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            retryable_error_substrings: DEFAULT_RETRYABLE_ERROR_SUBSTRINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    /// Builds a policy with the default retryable sets.
    ///
    /// Fails when `backoff_factor < 1` (or not finite) or `max_delay < base_delay`.
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Result<Self> {
        if !backoff_factor.is_finite() || backoff_factor < 1.0 {
            bail!("backoff factor must be >= 1.0, got {}", backoff_factor);
        }
        if max_delay < base_delay {
            bail!(
                "max delay ({:?}) must not be shorter than base delay ({:?})",
                max_delay,
                base_delay
            );
        }

        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_factor,
            ..Self::default()
        })
    }

    /// A policy that performs exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Replaces the message fragments consulted for unclassified errors.
    pub fn with_retryable_error_substrings<I, S>(mut self, substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_substrings = substrings.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the retryable HTTP status set.
    pub fn with_retryable_status_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn retryable_error_substrings(&self) -> &HashSet<String> {
        &self.retryable_error_substrings
    }

    pub fn retryable_status_codes(&self) -> &HashSet<u16> {
        &self.retryable_status_codes
    }

    /// Un-jittered delay before `attempt` (1-based retry number), in seconds.
    ///
    /// `base_delay * backoff_factor^(attempt-1)`; may exceed `max_delay` or
    /// even be infinite for very large attempts.
    pub fn raw_delay_secs(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent)
    }

    /// Delay before `attempt` with a fixed jitter sample.
    ///
    /// `jitter` is in `[-1.0, 1.0]` and scales [`JITTER_FRACTION`] of the raw
    /// delay. The result always lies in `[0, max_delay]`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let raw = self.raw_delay_secs(attempt);
        let jittered = raw + raw * JITTER_FRACTION * jitter.clamp(-1.0, 1.0);
        let max = self.max_delay.as_secs_f64();
        let clamped = if jittered.is_nan() {
            max
        } else {
            jittered.clamp(0.0, max)
        };
        Duration::try_from_secs_f64(clamped).unwrap_or(self.max_delay)
    }

    /// Delay before `attempt` with a random jitter sample.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries(), 3);
        assert_eq!(p.base_delay(), Duration::from_millis(100));
        assert_eq!(p.max_delay(), Duration::from_secs(5));
        assert_eq!(p.backoff_factor(), 2.0);
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(p.retryable_status_codes().contains(&code));
        }
        assert_eq!(p.retryable_status_codes().len(), 6);
    }

    #[test]
    fn test_new_rejects_invalid_values() {
        assert!(
            RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(1), 2.0).is_err()
        );
        assert!(
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(1), 0.5).is_err()
        );
        assert!(
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(1), f64::NAN)
                .is_err()
        );
        assert!(
            RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1), 1.0).is_ok()
        );
    }

    #[test]
    fn test_raw_delay_is_exponential() {
        let p = RetryPolicy::default();
        assert!((p.raw_delay_secs(1) - 0.1).abs() < 1e-9);
        assert!((p.raw_delay_secs(2) - 0.2).abs() < 1e-9);
        assert!((p.raw_delay_secs(3) - 0.4).abs() < 1e-9);
        assert!((p.raw_delay_secs(4) - 0.8).abs() < 1e-9);
    }

    fn assert_close(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff < Duration::from_micros(1),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn test_delay_without_jitter_matches_raw() {
        let p = RetryPolicy::default();
        assert_close(p.delay_with_jitter(1, 0.0), 100);
        assert_close(p.delay_with_jitter(3, 0.0), 400);
    }

    #[test]
    fn test_jitter_bounds() {
        let p = RetryPolicy::default();
        assert_close(p.delay_with_jitter(1, 1.0), 125);
        assert_close(p.delay_with_jitter(1, -1.0), 75);
        // Out-of-range samples are clamped to +/- 25%.
        assert_close(p.delay_with_jitter(2, 7.0), 250);
    }

    #[test]
    fn test_delay_is_clamped_to_max() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_with_jitter(10, 0.0), p.max_delay());
        assert_eq!(p.delay_with_jitter(10, 1.0), p.max_delay());
        // Exponent large enough to overflow to infinity.
        assert_eq!(p.delay_with_jitter(u32::MAX, -1.0), p.max_delay());
    }

    #[test]
    fn test_random_delay_always_within_bounds() {
        let p = RetryPolicy::default();
        for attempt in 1..=64 {
            for _ in 0..20 {
                let d = p.next_delay(attempt);
                assert!(d <= p.max_delay(), "attempt {attempt} gave {d:?}");
            }
        }
    }

    #[test]
    fn test_zero_base_delay_never_waits() {
        let p = RetryPolicy::new(5, Duration::ZERO, Duration::from_secs(1), 2.0).unwrap();
        for attempt in 1..=5 {
            assert_eq!(p.next_delay(attempt), Duration::ZERO);
        }
        // The exponential term overflows to infinity here.
        assert_eq!(p.delay_with_jitter(u32::MAX, 0.0), Duration::ZERO);
        assert_eq!(p.delay_with_jitter(u32::MAX, -1.0), Duration::ZERO);
    }

    #[test]
    fn test_builders_replace_sets() {
        let p = RetryPolicy::no_retry()
            .with_retryable_status_codes([418])
            .with_retryable_error_substrings(["teapot"]);
        assert_eq!(p.max_retries(), 0);
        assert!(p.retryable_status_codes().contains(&418));
        assert!(!p.retryable_status_codes().contains(&503));
        assert!(p.retryable_error_substrings().contains("teapot"));
    }
}
