//! Capped exponential backoff for scheduled retries.
//!
//! Retry `n` (1-based) waits `base * min(2^(n-1), multiplier_cap)`, never more than `max`.
//! With the defaults (1s base, cap 16, 300s max) the sequence is 1s, 2s, 4s, 8s, 16s, 16s, ...
//!
//! ```rust
//! use std::time::Duration;
//! use hookrelay::backoff::RetryBackoff;
//!
//! let backoff = RetryBackoff::new(Duration::from_secs(1), 16, Duration::from_secs(300)).unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay(3), Duration::from_secs(4));
//! assert_eq!(backoff.delay(9), Duration::from_secs(16)); // multiplier capped
//! ```
//!
//! Arithmetic saturates instead of overflowing; a zero `retry_count` is treated as the first retry.

use std::time::Duration;

use crate::error::ConfigError;

/// Exponential delay with a multiplier cap and an absolute ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    base: Duration,
    multiplier_cap: u32,
    max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), multiplier_cap: 16, max: Duration::from_secs(300) }
    }
}

impl RetryBackoff {
    /// Returns an error if `base`, `max` or `multiplier_cap` is zero, or if `max < base`.
    pub fn new(base: Duration, multiplier_cap: u32, max: Duration) -> Result<Self, ConfigError> {
        if base.is_zero() {
            return Err(ConfigError::positive("retry_base_delay_ms", 0u64));
        }
        if max.is_zero() {
            return Err(ConfigError::positive("retry_max_delay_ms", 0u64));
        }
        if multiplier_cap == 0 {
            return Err(ConfigError::positive("retry_multiplier_cap", 0u32));
        }
        if max < base {
            return Err(ConfigError::RetryDelayOrder { base, max });
        }
        Ok(Self { base, multiplier_cap, max })
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `retry_count`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.max(1) - 1;
        let multiplier = 2u128.saturating_pow(exponent).min(u128::from(self.multiplier_cap));
        let nanos = self.base.as_nanos().saturating_mul(multiplier).min(self.max.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sequence_doubles_then_plateaus() {
        let backoff = RetryBackoff::default();
        let secs: Vec<u64> = (1..=7).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn zero_retry_count_is_first_retry() {
        let backoff = RetryBackoff::default();
        assert_eq!(backoff.delay(0), backoff.delay(1));
    }

    #[test]
    fn max_delay_caps_the_multiplier() {
        let backoff =
            RetryBackoff::new(Duration::from_secs(10), 16, Duration::from_secs(45)).unwrap();
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(2), Duration::from_secs(20));
        assert_eq!(backoff.delay(3), Duration::from_secs(40));
        assert_eq!(backoff.delay(4), Duration::from_secs(45));
    }

    #[test]
    fn huge_retry_counts_saturate() {
        let backoff = RetryBackoff::new(Duration::from_secs(1), u32::MAX, Duration::MAX).unwrap();
        assert!(backoff.delay(u32::MAX) >= Duration::from_secs(1));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(RetryBackoff::new(Duration::ZERO, 16, Duration::from_secs(1)).is_err());
        assert!(RetryBackoff::new(Duration::from_secs(1), 0, Duration::from_secs(1)).is_err());
        let err =
            RetryBackoff::new(Duration::from_secs(10), 16, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, ConfigError::RetryDelayOrder { .. }));
    }
}
