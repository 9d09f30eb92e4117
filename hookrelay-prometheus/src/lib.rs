//! Prometheus collector for `hookrelay`.
//! Bring your own `prometheus::Registry`; values are read from [`Metrics`] at scrape time.
//!
//! Counters are exported as gauges because [`Metrics::reset`] can move them backwards.

use std::sync::Arc;

use hookrelay::{CircuitBreaker, CircuitState, Metrics};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, IntGaugeVec, Opts, Registry};

/// Scrape-time view of a service's delivery metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    metrics: Arc<Metrics>,
    breaker: Option<CircuitBreaker>,
    events: IntGaugeVec,
    latency: GaugeVec,
    circuits: IntGaugeVec,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("metrics", &self.metrics)
            .field("circuits", &self.breaker.is_some())
            .finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// # Errors
    /// Returns an error if a metric descriptor is invalid.
    pub fn new(metrics: Arc<Metrics>) -> Result<Self, prometheus::Error> {
        let events = IntGaugeVec::new(
            Opts::new("hookrelay_events", "Delivery pipeline counters by outcome"),
            &["outcome"],
        )?;
        let latency = GaugeVec::new(
            Opts::new("hookrelay_delivery_latency_milliseconds", "Delivery attempt latency"),
            &["stat"],
        )?;
        let circuits = IntGaugeVec::new(
            Opts::new(
                "hookrelay_circuit_state",
                "Circuit state per destination (0 closed, 1 open, 2 half-open)",
            ),
            &["destination"],
        )?;
        Ok(Self { metrics, breaker: None, events, latency, circuits })
    }

    /// Also export per-destination circuit state.
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Register a clone of this collector into `registry`.
    ///
    /// # Errors
    /// Returns an error if the metric names are already registered.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.clone()))
    }

    fn refresh(&self) {
        let s = self.metrics.snapshot();
        for (outcome, value) in [
            ("attempt", s.total_attempts),
            ("success", s.total_success),
            ("failed", s.total_failed),
            ("queued", s.total_queued),
            ("queue_full", s.queue_full),
            ("rate_limited", s.rate_limited),
            ("circuit_open", s.circuit_open),
            ("retried", s.retried),
        ] {
            self.events.with_label_values(&[outcome]).set(clamp(value));
        }

        let l = &s.latency;
        for (stat, value) in [
            ("count", l.count as f64),
            ("min", l.min_ms),
            ("max", l.max_ms),
            ("mean", l.mean_ms),
            ("p50", l.p50_ms),
            ("p99", l.p99_ms),
        ] {
            self.latency.with_label_values(&[stat]).set(value);
        }

        if let Some(breaker) = &self.breaker {
            self.circuits.reset();
            for (url, circuit) in breaker.snapshot() {
                let code = match circuit.state {
                    CircuitState::Closed => 0,
                    CircuitState::Open => 1,
                    CircuitState::HalfOpen => 2,
                };
                self.circuits.with_label_values(&[url.as_str()]).set(code);
            }
        }
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl Collector for MetricsCollector {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.events.desc();
        descs.extend(self.latency.desc());
        descs.extend(self.circuits.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.refresh();
        let mut families = self.events.collect();
        families.extend(self.latency.collect());
        if self.breaker.is_some() {
            families.extend(self.circuits.collect());
        }
        families
    }
}
