//! Delivery counters and latency aggregates.
//!
//! Counters are plain relaxed atomics: every recording is a single `fetch_add`, and a
//! [`MetricsSnapshot`] reads each counter independently, so a snapshot taken under load is not a
//! single consistent cut. Latency samples go through one mutex holding the running aggregate and
//! an HDR histogram (microsecond resolution) for percentiles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
    queue_full: AtomicU64,
    rate_limited: AtomicU64,
    circuit_open: AtomicU64,
    retried: AtomicU64,
}

#[derive(Debug)]
struct Latency {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    histogram: Option<Histogram<u64>>,
}

impl Latency {
    fn new() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: None,
            max: Duration::ZERO,
            histogram: Histogram::new(3).ok(),
        }
    }

    fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(sample);
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = self.max.max(sample);
        if let Some(h) = self.histogram.as_mut() {
            h.saturating_record(u64::try_from(sample.as_micros()).unwrap_or(u64::MAX));
        }
    }

    fn quantile_ms(&self, q: f64) -> f64 {
        match &self.histogram {
            Some(h) if !h.is_empty() => h.value_at_quantile(q) as f64 / 1_000.0,
            _ => 0.0,
        }
    }
}

/// Process-wide delivery metrics. Share it behind an `Arc`.
#[derive(Debug)]
pub struct Metrics {
    counters: Counters,
    latency: Mutex<Latency>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { counters: Counters::default(), latency: Mutex::new(Latency::new()) }
    }

    pub fn record_attempt(&self) {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.counters.success.fetch_add(1, Ordering::Relaxed);
    }

    /// An event was dropped for good: retries exhausted or no room left to retry.
    pub fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_open(&self) {
        self.counters.circuit_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, sample: Duration) {
        self.latency.lock().unwrap_or_else(PoisonError::into_inner).record(sample);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        let latency = {
            let l = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
            LatencySnapshot {
                count: l.count,
                total_ms: millis(l.total),
                min_ms: l.min.map_or(0.0, millis),
                max_ms: millis(l.max),
                mean_ms: if l.count == 0 { 0.0 } else { millis(l.total) / l.count as f64 },
                p50_ms: l.quantile_ms(0.50),
                p99_ms: l.quantile_ms(0.99),
            }
        };
        MetricsSnapshot {
            total_attempts: c.attempts.load(Ordering::Relaxed),
            total_success: c.success.load(Ordering::Relaxed),
            total_failed: c.failed.load(Ordering::Relaxed),
            total_queued: c.queued.load(Ordering::Relaxed),
            queue_full: c.queue_full.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            circuit_open: c.circuit_open.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            latency,
        }
    }

    /// Zero every counter and drop all latency samples.
    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.attempts,
            &c.success,
            &c.failed,
            &c.queued,
            &c.queue_full,
            &c.rate_limited,
            &c.circuit_open,
            &c.retried,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Latency::new();
    }
}

fn millis(d: Duration) -> f64 {
    d.as_micros() as f64 / 1_000.0
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_attempts: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub total_queued: u64,
    pub queue_full: u64,
    pub rate_limited: u64,
    pub circuit_open: u64,
    pub retried: u64,
    pub latency: LatencySnapshot,
}

/// Latency aggregate in milliseconds. All zero until the first sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
}
