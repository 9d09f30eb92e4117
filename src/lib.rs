#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # hookrelay
//!
//! Reliable outbound webhook delivery for event-producing services.
//!
//! ## Features
//!
//! - **Admission gates**: per-tenant token buckets, per-destination circuit breakers, and a
//!   bounded ingress queue, all answered synchronously
//! - **Worker pool** delivering over HTTP with a bounded client timeout
//! - **Backoff retries** parked on a single time-ordered heap, released onto a bounded queue
//! - **Subscription filtering** by kind, named group, or wildcard
//! - **Metrics** with latency percentiles, exportable through `hookrelay-prometheus`
//!
//! Delivery is at most `1 + max_retries` attempts per event, unordered, and not persisted
//! across restarts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hookrelay::{RawEvent, EventData, EventKind, Subscription, WebhookConfig, WebhookService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = WebhookService::new(WebhookConfig::default())?;
//!     service.start().await;
//!
//!     let sub = Subscription::new(
//!         "session-1",
//!         "https://example.com/hooks",
//!         Subscription::parse_events("messages, connection"),
//!     );
//!     service.publish(&sub, &RawEvent::known(EventKind::Message, EventData::new()))?;
//!
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod filter;
pub mod metrics;
pub mod prelude;
pub mod rate_limit;
pub mod retry;
pub mod serializer;
pub mod service;
pub mod transport;
mod worker;

// Re-exports
pub use backoff::RetryBackoff;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::WebhookConfig;
pub use dispatcher::Dispatcher;
pub use error::{AdmissionError, ConfigError, DeliveryError};
pub use event::{Event, EventData, EventKind, RawEvent};
pub use filter::{should_deliver, validate_events, Subscription};
pub use metrics::{LatencySnapshot, Metrics, MetricsSnapshot};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{RetryManager, RetryOutcome};
pub use serializer::{EventSerializer, Payload};
pub use service::{WebhookService, WebhookServiceBuilder};
pub use transport::{BoxTransport, HttpTransport, TransportError, WebhookRequest, WebhookResponse};
