//! Error types for admission, delivery, and configuration.
//!
//! Only [`AdmissionError`] ever reaches a producer. [`DeliveryError`] values stay inside the
//! pipeline, where they are retried or dropped and surface through metrics and logs.

use std::time::Duration;

use thiserror::Error;

/// Rejection returned synchronously by the admission gates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The tenant's token bucket is empty.
    #[error("rate limit exceeded for tenant '{tenant_id}'")]
    RateLimited {
        /// Tenant whose bucket rejected the event.
        tenant_id: String,
    },
    /// The destination's circuit is open.
    #[error("circuit breaker open for destination {destination_url}")]
    CircuitOpen {
        /// Destination whose circuit rejected the event.
        destination_url: String,
    },
    /// The bounded ingress queue has no free slot.
    #[error("ingress queue full (capacity {capacity})")]
    QueueFull {
        /// Configured ingress capacity.
        capacity: usize,
    },
    /// The service has been stopped and no longer accepts events.
    #[error("webhook service is stopped")]
    Closed,
    /// The event itself is malformed.
    #[error("invalid event: {0}")]
    Invalid(#[from] ConfigError),
}

impl AdmissionError {
    /// Check if this rejection came from the rate limiter.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this rejection came from the circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this rejection came from a full ingress queue.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}

/// Failure of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The request never produced an HTTP response.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the underlying failure.
        message: String,
        /// Whether the client-side timeout fired.
        timed_out: bool,
    },
    /// The destination answered outside `[200, 300)`.
    #[error("destination returned HTTP {status}")]
    HttpStatus {
        /// Response status code.
        status: u16,
        /// Response body, truncated, kept for diagnostics.
        body: String,
    },
    /// The event could not be encoded as JSON.
    #[error("failed to serialize payload: {message}")]
    Serialization {
        /// Encoder error message.
        message: String,
    },
    /// The destination's circuit refused the attempt; no request was sent.
    #[error("circuit breaker open for destination {destination_url}")]
    CircuitOpen {
        /// Destination whose circuit is open.
        destination_url: String,
    },
    /// Every attempt of a synchronous retry loop failed.
    #[error("delivery failed after {attempts} attempts; last error: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: Box<DeliveryError>,
    },
}

impl DeliveryError {
    /// Creates a transport error from a message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), timed_out: false }
    }

    /// Creates a transport error for an elapsed client timeout.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Transport { message: format!("request timed out after {timeout:?}"), timed_out: true }
    }

    /// Check if the attempt was refused by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Failures that would repeat identically on every attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Serialization { .. })
    }

    /// HTTP status of the failed attempt, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// Invalid configuration or event input, rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("destination URL must not be empty")]
    EmptyDestinationUrl,
    #[error("destination URL '{url}' is invalid: {reason}")]
    InvalidDestinationUrl { url: String, reason: String },
    #[error("tenant id must not be empty")]
    EmptyTenantId,
    #[error("tenant id {tenant_id:?} cannot be sent as a header value")]
    InvalidTenantId { tenant_id: String },
    #[error("{field} must be > 0 (got {provided})")]
    MustBePositive { field: &'static str, provided: u64 },
    #[error("retry max delay ({max:?}) must be >= base delay ({base:?})")]
    RetryDelayOrder { base: Duration, max: Duration },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
    #[error("user agent '{0}' is not a valid header value")]
    InvalidUserAgent(String),
}

impl ConfigError {
    pub(crate) fn positive(field: &'static str, provided: impl TryInto<u64>) -> Self {
        Self::MustBePositive { field, provided: provided.try_into().unwrap_or(u64::MAX) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_predicates_match_variants() {
        let limited = AdmissionError::RateLimited { tenant_id: "t1".into() };
        assert!(limited.is_rate_limited());
        assert!(!limited.is_queue_full());

        let full = AdmissionError::QueueFull { capacity: 1 };
        assert!(full.is_queue_full());
        assert!(!full.is_circuit_open());

        let open = AdmissionError::CircuitOpen { destination_url: "http://x".into() };
        assert!(open.is_circuit_open());
    }

    #[test]
    fn config_errors_convert_into_admission_errors() {
        let err: AdmissionError = ConfigError::EmptyDestinationUrl.into();
        assert_eq!(err, AdmissionError::Invalid(ConfigError::EmptyDestinationUrl));
        assert_eq!(err.to_string(), "invalid event: destination URL must not be empty");
    }

    #[test]
    fn retries_exhausted_reports_last_error() {
        let err = DeliveryError::RetriesExhausted {
            attempts: 3,
            last: Box::new(DeliveryError::HttpStatus { status: 503, body: "busy".into() }),
        };
        assert_eq!(err.status(), Some(503));
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("HTTP 503"));
    }

    #[test]
    fn timeout_is_a_transport_error() {
        let err = DeliveryError::timeout(Duration::from_secs(5));
        assert!(matches!(err, DeliveryError::Transport { timed_out: true, .. }));
        assert!(err.status().is_none());
        assert!(!err.is_circuit_open());
    }

    #[test]
    fn positive_field_error_display() {
        let err = ConfigError::positive("workers", 0usize);
        assert_eq!(err.to_string(), "workers must be > 0 (got 0)");
    }
}
