//! Single delivery attempts against a destination.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tower::ServiceExt;
use tracing::Instrument;

use crate::backoff::RetryBackoff;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ConfigError, DeliveryError};
use crate::event::Event;
use crate::metrics::Metrics;
use crate::serializer::{EventSerializer, Payload};
use crate::transport::{BoxTransport, WebhookRequest, WebhookResponse};

pub const HEADER_EVENT: &str = "x-webhook-event";
pub const HEADER_SESSION: &str = "x-webhook-session";
pub const HEADER_TIMESTAMP: &str = "x-webhook-timestamp";
pub const HEADER_ID: &str = "x-webhook-id";

/// Issues HTTP POSTs and feeds the outcome into the circuit breaker and metrics.
///
/// Cheap to clone; every worker holds its own copy over shared state.
#[derive(Clone)]
pub struct Dispatcher {
    transport: BoxTransport,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
    serializer: EventSerializer,
    timeout: Duration,
    user_agent: HeaderValue,
    backoff: RetryBackoff,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        transport: BoxTransport,
        breaker: CircuitBreaker,
        metrics: Arc<Metrics>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::positive("timeout_ms", 0u64));
        }
        let user_agent = HeaderValue::from_str(user_agent)
            .map_err(|_| ConfigError::InvalidUserAgent(user_agent.to_string()))?;
        Ok(Self {
            transport,
            breaker,
            metrics,
            serializer: EventSerializer,
            timeout,
            user_agent,
            backoff: RetryBackoff::default(),
        })
    }

    /// Backoff used between attempts of [`Dispatcher::send_with_retry`].
    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Make one delivery attempt.
    ///
    /// The request is built before the breaker is consulted, so an event that cannot be encoded
    /// fails with `Serialization` without touching the circuit or using up a half-open probe.
    /// A refused circuit counts as another failure for the destination and no request is sent.
    /// Any transport error or non-2xx status is recorded against the breaker.
    pub async fn send(&self, event: &Event) -> Result<WebhookResponse, DeliveryError> {
        let url = event.destination_url.as_str();
        let payload = self.serializer.serialize_event(event);
        let body = payload
            .to_json()
            .map_err(|e| DeliveryError::Serialization { message: e.to_string() })?;
        let headers = self.headers(&payload)?;
        let request = WebhookRequest { url: url.to_string(), headers, body: Bytes::from(body) };

        if !self.breaker.can_execute(url) {
            self.breaker.record_failure(url);
            self.metrics.record_circuit_open();
            tracing::debug!(event_id = %event.id, url, "circuit open, attempt skipped");
            return Err(DeliveryError::CircuitOpen { destination_url: url.to_string() });
        }

        let span = tracing::info_span!(
            "webhook_delivery",
            event_id = %event.id,
            kind = %event.kind,
            tenant_id = %event.tenant_id,
            url,
            retry_count = event.retry_count,
        );
        async move {
            self.metrics.record_attempt();
            let started = tokio::time::Instant::now();
            let outcome =
                tokio::time::timeout(self.timeout, self.transport.clone().oneshot(request)).await;
            let elapsed = started.elapsed();
            self.metrics.record_latency(elapsed);

            let result = match outcome {
                Err(_) => Err(DeliveryError::timeout(self.timeout)),
                Ok(Err(e)) => Err(DeliveryError::Transport { message: e.message, timed_out: e.timed_out }),
                Ok(Ok(response)) if response.is_success() => Ok(response),
                Ok(Ok(response)) => Err(DeliveryError::HttpStatus {
                    status: response.status,
                    body: response.body,
                }),
            };

            match &result {
                Ok(response) => {
                    self.breaker.record_success(url);
                    self.metrics.record_success();
                    tracing::debug!(status = response.status, elapsed_ms = elapsed.as_millis() as u64, "delivered");
                }
                Err(error) => {
                    self.breaker.record_failure(url);
                    tracing::warn!(%error, elapsed_ms = elapsed.as_millis() as u64, "delivery attempt failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Synchronous bounded retry, for ad-hoc validation of a destination.
    ///
    /// Runs up to `max_attempts` attempts (at least one), sleeping the backoff delay in between.
    /// Serialization failures are not retried. Independent of the asynchronous retry pipeline.
    pub async fn send_with_retry(
        &self,
        event: &Event,
        max_attempts: u32,
    ) -> Result<WebhookResponse, DeliveryError> {
        let max_attempts = max_attempts.max(1);
        let mut event = event.clone();
        let mut attempt = 1;
        loop {
            let last = match self.send(&event).await {
                Ok(response) => return Ok(response),
                Err(e @ DeliveryError::Serialization { .. }) => return Err(e),
                Err(e) => e,
            };
            if attempt >= max_attempts {
                return Err(DeliveryError::RetriesExhausted { attempts: attempt, last: Box::new(last) });
            }
            let delay = self.backoff.delay(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %last, "retrying delivery");
            tokio::time::sleep(delay).await;
            attempt += 1;
            event.retry_count = event.retry_count.saturating_add(1);
        }
    }

    fn headers(&self, payload: &Payload) -> Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::with_capacity(6);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, self.user_agent.clone());
        headers.insert(HeaderName::from_static(HEADER_EVENT), HeaderValue::from_static(payload.kind.as_str()));
        headers.insert(HeaderName::from_static(HEADER_SESSION), header_value(&payload.tenant_id)?);
        headers.insert(
            HeaderName::from_static(HEADER_TIMESTAMP),
            header_value(&payload.timestamp.to_rfc3339())?,
        );
        headers.insert(
            HeaderName::from_static(HEADER_ID),
            header_value(&payload.metadata.event_id.to_string())?,
        );
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, DeliveryError> {
    HeaderValue::from_str(value).map_err(|_| DeliveryError::Serialization {
        message: format!("'{value}' is not a valid header value"),
    })
}
