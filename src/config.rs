//! Service configuration.
//!
//! Durations are stored as integer milliseconds so the struct maps one-to-one onto the host's
//! config file. Every field has a default; `validate` is run by the service builder.
//!
//! ```rust
//! use hookrelay::WebhookConfig;
//!
//! let cfg: WebhookConfig = serde_json::from_str(r#"{"workers": 8, "max_retries": 5}"#).unwrap();
//! assert_eq!(cfg.workers, 8);
//! assert_eq!(cfg.queue_size, 1000);
//! cfg.validate().unwrap();
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryBackoff;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::rate_limit::RateLimitConfig;

/// `User-Agent` sent with every delivery unless overridden.
pub fn default_user_agent() -> String {
    format!("Hookrelay-Webhook/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Size of the delivery worker pool.
    pub workers: usize,
    /// Ingress queue capacity.
    pub queue_size: usize,
    /// Retry queue capacity.
    pub retry_queue_size: usize,
    /// Per-request HTTP timeout.
    pub timeout_ms: u64,
    /// Retries after the first attempt before an event is dropped.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_multiplier_cap: u32,
    /// Upper bound on how long `stop` waits for background tasks.
    pub shutdown_timeout_ms: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 1000,
            retry_queue_size: 1000,
            timeout_ms: 30_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 300_000,
            retry_multiplier_cap: 16,
            shutdown_timeout_ms: 30_000,
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            user_agent: default_user_agent(),
        }
    }
}

impl WebhookConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::positive("workers", self.workers));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::positive("queue_size", self.queue_size));
        }
        if self.retry_queue_size == 0 {
            return Err(ConfigError::positive("retry_queue_size", self.retry_queue_size));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::positive("timeout_ms", self.timeout_ms));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::positive("shutdown_timeout_ms", self.shutdown_timeout_ms));
        }
        self.retry_backoff()?;
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Result<RetryBackoff, ConfigError> {
        RetryBackoff::new(
            Duration::from_millis(self.retry_base_delay_ms),
            self.retry_multiplier_cap,
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}
