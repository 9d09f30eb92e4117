//! Per-destination circuit breaker.
//!
//! Every destination URL gets its own state machine, created lazily on first use and kept for
//! the life of the process:
//!
//! - **Closed**: all attempts allowed; `max_failures` consecutive failures open the circuit.
//! - **Open**: attempts refused until `reset_timeout` has passed since the last failure, then the
//!   next check moves the circuit to half-open and is allowed.
//! - **HalfOpen**: up to `half_open_max_calls` further probes are allowed. The first success
//!   closes the circuit; any failure reopens it.
//!
//! Entries live in a sharded map; each entry has its own lock, so destinations never contend
//! with each other once their entry exists.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;

/// Current state of one destination's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    #[default]
    Closed,
    /// Short-circuits attempts until the reset timeout elapses.
    Open,
    /// Probe mode allowing a limited number of attempts to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    max_failures: u32,
    reset_timeout_ms: u64,
    half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { max_failures: 5, reset_timeout_ms: 60_000, half_open_max_calls: 3 }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        max_failures: u32,
        reset_timeout: Duration,
        half_open_max_calls: u32,
    ) -> Result<Self, ConfigError> {
        let cfg = Self {
            max_failures,
            reset_timeout_ms: u64::try_from(reset_timeout.as_millis()).unwrap_or(u64::MAX),
            half_open_max_calls,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failures == 0 {
            return Err(ConfigError::positive("circuit_breaker.max_failures", self.max_failures));
        }
        if self.reset_timeout_ms == 0 {
            return Err(ConfigError::positive("circuit_breaker.reset_timeout_ms", 0u64));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::positive(
                "circuit_breaker.half_open_max_calls",
                self.half_open_max_calls,
            ));
        }
        Ok(())
    }

    /// Consecutive failures before opening from Closed.
    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Time since the last failure before an Open circuit admits a probe.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Probes granted while Half-Open.
    pub fn half_open_max_calls(&self) -> u32 {
        self.half_open_max_calls
    }
}

#[derive(Debug, Default)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_millis: Option<u64>,
    half_open_probes: u32,
}

impl CircuitEntry {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Point-in-time view of one destination's circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_probes: u32,
}

/// Returned by [`CircuitBreaker::reset`] for a destination that was never seen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no circuit tracked for destination '{url}'")]
pub struct UnknownDestination {
    pub url: String,
}

/// Circuit breakers keyed by destination URL.
///
/// Clones share the same state, so every worker observes the same circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    circuits: Arc<DashMap<String, Arc<Mutex<CircuitEntry>>>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { circuits: Arc::new(DashMap::new()), config, clock }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether an attempt against `url` may proceed.
    ///
    /// Side effects: an Open circuit whose reset timeout has passed moves to Half-Open (with the
    /// probe counter at zero), and a Half-Open grant consumes one probe.
    pub fn can_execute(&self, url: &str) -> bool {
        let entry = self.entry(url);
        let mut circuit = entry.lock().unwrap_or_else(PoisonError::into_inner);
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let since_failure = circuit
                    .last_failure_millis
                    .map(|at| self.clock.now_millis().saturating_sub(at))
                    .unwrap_or(u64::MAX);
                if since_failure >= self.config.reset_timeout_ms {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_probes = 0;
                    tracing::info!(url, "circuit breaker → half-open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if circuit.half_open_probes < self.config.half_open_max_calls {
                    circuit.half_open_probes += 1;
                    tracing::debug!(
                        url,
                        probe = circuit.half_open_probes,
                        max = self.config.half_open_max_calls,
                        "circuit breaker: half-open probe"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Same answer as [`can_execute`](Self::can_execute) but without changing state or using up
    /// a half-open probe. Used as the admission gate so probes are spent only on real attempts.
    pub fn allows(&self, url: &str) -> bool {
        let entry = self.entry(url);
        let circuit = entry.lock().unwrap_or_else(PoisonError::into_inner);
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => match circuit.last_failure_millis {
                Some(at) => {
                    self.clock.now_millis().saturating_sub(at) >= self.config.reset_timeout_ms
                }
                None => true,
            },
            CircuitState::HalfOpen => circuit.half_open_probes < self.config.half_open_max_calls,
        }
    }

    /// Record a successful attempt. A single half-open success closes the circuit.
    pub fn record_success(&self, url: &str) {
        let entry = self.entry(url);
        let mut circuit = entry.lock().unwrap_or_else(PoisonError::into_inner);
        match circuit.state {
            CircuitState::Closed => circuit.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                circuit.reset();
                tracing::info!(url, "circuit breaker → closed");
            }
            // A late success from an attempt started before the circuit opened changes nothing.
            CircuitState::Open => {}
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, url: &str) {
        let entry = self.entry(url);
        let mut circuit = entry.lock().unwrap_or_else(PoisonError::into_inner);
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        circuit.last_failure_millis = Some(self.clock.now_millis());
        let failures = circuit.consecutive_failures;
        match circuit.state {
            CircuitState::Closed if failures >= self.config.max_failures => {
                circuit.state = CircuitState::Open;
                circuit.half_open_probes = 0;
                tracing::error!(
                    url,
                    failures,
                    threshold = self.config.max_failures,
                    "circuit breaker → open"
                );
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.half_open_probes = 0;
                tracing::warn!(url, failures, "circuit breaker: probe failed → open");
            }
            _ => {}
        }
    }

    /// Current state for `url`; destinations never seen are Closed.
    pub fn state(&self, url: &str) -> CircuitState {
        self.circuits
            .get(url)
            .map(|entry| {
                let circuit = entry.lock().unwrap_or_else(PoisonError::into_inner);
                circuit.state
            })
            .unwrap_or_default()
    }

    /// Snapshot every tracked destination, sorted by URL.
    pub fn snapshot(&self) -> Vec<(String, CircuitSnapshot)> {
        let mut entries: Vec<(String, CircuitSnapshot)> = self
            .circuits
            .iter()
            .map(|item| {
                let circuit = item.value().lock().unwrap_or_else(PoisonError::into_inner);
                (
                    item.key().clone(),
                    CircuitSnapshot {
                        state: circuit.state,
                        consecutive_failures: circuit.consecutive_failures,
                        half_open_probes: circuit.half_open_probes,
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Force a destination back to Closed, clearing its counters.
    pub fn reset(&self, url: &str) -> Result<(), UnknownDestination> {
        let entry = self
            .circuits
            .get(url)
            .map(|item| item.value().clone())
            .ok_or_else(|| UnknownDestination { url: url.to_string() })?;
        entry.lock().unwrap_or_else(PoisonError::into_inner).reset();
        tracing::info!(url, "circuit breaker reset");
        Ok(())
    }

    /// Number of destinations tracked.
    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    fn entry(&self, url: &str) -> Arc<Mutex<CircuitEntry>> {
        if let Some(existing) = self.circuits.get(url) {
            return existing.value().clone();
        }
        self.circuits.entry(url.to_string()).or_default().value().clone()
    }
}
