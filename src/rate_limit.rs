//! Per-tenant token-bucket rate limiting.
//!
//! Each tenant gets a bucket seeded with `burst_size` tokens. Refill counts whole elapsed
//! seconds only: `elapsed_secs * requests_per_second` tokens are added (capped at the burst)
//! and the refill timestamp moves only once a full second has passed. Sub-second bursts are
//! therefore never smoothed by partial refill.
//!
//! Buckets are created lazily and reaped by [`RateLimiter::run_cleanup`] once their refill
//! timestamp is older than `idle_timeout`, so memory stays bounded under tenant churn.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;

/// Validated rate-limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    requests_per_second: u32,
    burst_size: u32,
    cleanup_interval_ms: u64,
    idle_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst_size: 20,
            cleanup_interval_ms: 60_000,
            idle_timeout_ms: 600_000,
        }
    }
}

impl RateLimitConfig {
    /// Create a config with validation; sweep settings keep their defaults.
    pub fn new(requests_per_second: u32, burst_size: u32) -> Result<Self, ConfigError> {
        let cfg = Self { requests_per_second, burst_size, ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Override how often idle buckets are swept and how long a bucket may idle.
    pub fn with_cleanup(
        mut self,
        interval: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        self.cleanup_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.idle_timeout_ms = u64::try_from(idle_timeout.as_millis()).unwrap_or(u64::MAX);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_per_second == 0 {
            return Err(ConfigError::positive("rate_limit.requests_per_second", 0u32));
        }
        if self.burst_size == 0 {
            return Err(ConfigError::positive("rate_limit.burst_size", 0u32));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigError::positive("rate_limit.cleanup_interval_ms", 0u64));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::positive("rate_limit.idle_timeout_ms", 0u64));
        }
        Ok(())
    }

    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second
    }

    pub fn burst_size(&self) -> u32 {
        self.burst_size
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u64,
    last_refill_millis: u64,
}

impl TokenBucket {
    fn refill(&mut self, now: u64, rate: u64, capacity: u64) {
        let elapsed_secs = now.saturating_sub(self.last_refill_millis) / 1_000;
        if elapsed_secs >= 1 {
            self.tokens = self.tokens.saturating_add(elapsed_secs.saturating_mul(rate)).min(capacity);
            self.last_refill_millis = now;
        }
    }
}

/// Token buckets keyed by tenant id.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Arc<Mutex<TokenBucket>>>>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { buckets: Arc::new(DashMap::new()), config, clock }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one token from the tenant's bucket.
    pub fn allow(&self, tenant_id: &str) -> bool {
        let now = self.clock.now_millis();
        let bucket = self.bucket(tenant_id, now);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(
            now,
            u64::from(self.config.requests_per_second),
            u64::from(self.config.burst_size),
        );
        if bucket.tokens >= 1 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Drop buckets whose last refill is older than the idle timeout. Returns how many went.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let Some(cutoff) = now.checked_sub(self.config.idle_timeout_ms) else {
            return 0;
        };
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            bucket.last_refill_millis >= cutoff
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Periodic sweep; runs until `token` is cancelled.
    pub async fn run_cleanup(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.cleanup();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.buckets.len(), "reaped idle rate-limit buckets");
                    }
                }
            }
        }
        tracing::debug!("rate-limit cleanup stopped");
    }

    /// Number of tenants currently holding a bucket.
    pub fn tracked_tenants(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, tenant_id: &str, now: u64) -> Arc<Mutex<TokenBucket>> {
        if let Some(existing) = self.buckets.get(tenant_id) {
            return existing.value().clone();
        }
        let burst = u64::from(self.config.burst_size);
        self.buckets
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket { tokens: burst, last_refill_millis: now }))
            })
            .value()
            .clone()
    }
}
