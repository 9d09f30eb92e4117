//! The delivery service: admission gates, the ingress queue, and background task lifecycle.
//!
//! ```rust,no_run
//! use hookrelay::{EventData, EventKind, WebhookConfig, WebhookService};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = WebhookService::new(WebhookConfig::default())?;
//! service.start().await;
//!
//! let id = service.send_event("tenant-1", "https://example.com/hook", EventKind::Message, EventData::new())?;
//! println!("accepted {id}");
//!
//! service.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! Admission answers "accepted for delivery" or "rejected", never "delivered". Delivery runs on
//! the worker pool; its outcome is visible only in [`Metrics`] and logs. Events for the same
//! tenant or destination may be delivered in any order.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::Service;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, MonotonicClock};
use crate::config::WebhookConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{AdmissionError, ConfigError};
use crate::event::{Event, EventData, EventKind, RawEvent};
use crate::filter::{should_deliver, Subscription};
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryManager;
use crate::serializer::EventSerializer;
use crate::transport::{
    BoxTransport, HttpTransport, TransportError, WebhookRequest, WebhookResponse,
};
use crate::worker::{DeliveryWorker, SharedIngress};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// How long `stop` waits for aborted tasks to unwind and release the ingress queue.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Builder for [`WebhookService`].
pub struct WebhookServiceBuilder {
    config: WebhookConfig,
    transport: Option<BoxTransport>,
    clock: Option<Arc<dyn Clock>>,
}

impl std::fmt::Debug for WebhookServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookServiceBuilder")
            .field("config", &self.config)
            .field("custom_transport", &self.transport.is_some())
            .field("clock", &self.clock)
            .finish()
    }
}

impl WebhookServiceBuilder {
    /// Deliver through `transport` instead of the built-in HTTP client.
    pub fn transport<S>(mut self, transport: S) -> Self
    where
        S: Service<WebhookRequest, Response = WebhookResponse, Error = TransportError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.transport = Some(BoxTransport::new(transport));
        self
    }

    /// Clock shared by the circuit breaker and the rate limiter.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<WebhookService, ConfigError> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let breaker = CircuitBreaker::with_clock(config.circuit_breaker.clone(), clock.clone());
        let limiter = RateLimiter::with_clock(config.rate_limit.clone(), clock);
        let metrics = Arc::new(Metrics::new());

        let transport = match self.transport {
            Some(transport) => transport,
            None => HttpTransport::new(config.timeout(), &config.user_agent)?.boxed(),
        };
        let backoff = config.retry_backoff()?;
        let dispatcher = Dispatcher::new(
            transport,
            breaker.clone(),
            metrics.clone(),
            config.timeout(),
            &config.user_agent,
        )?
        .with_backoff(backoff);

        let token = CancellationToken::new();
        let retries = RetryManager::new(
            backoff,
            config.max_retries,
            config.retry_queue_size,
            metrics.clone(),
            token.clone(),
        )?;
        let (ingress_tx, ingress_rx) = mpsc::channel(config.queue_size);

        Ok(WebhookService {
            config,
            breaker,
            limiter,
            metrics,
            dispatcher,
            retries,
            serializer: EventSerializer,
            ingress_tx,
            ingress_rx: Arc::new(tokio::sync::Mutex::new(ingress_rx)),
            token,
            state: AtomicU8::new(IDLE),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Reliable outbound webhook delivery.
///
/// `start` and `stop` are idempotent. A stopped service cannot be restarted; build a new one.
#[derive(Debug)]
pub struct WebhookService {
    config: WebhookConfig,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    metrics: Arc<Metrics>,
    dispatcher: Dispatcher,
    retries: RetryManager,
    serializer: EventSerializer,
    ingress_tx: mpsc::Sender<Event>,
    ingress_rx: SharedIngress,
    token: CancellationToken,
    state: AtomicU8,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebhookService {
    pub fn builder(config: WebhookConfig) -> WebhookServiceBuilder {
        WebhookServiceBuilder { config, transport: None, clock: None }
    }

    /// Service using the built-in `reqwest` transport.
    pub fn new(config: WebhookConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    /// Admit one event for delivery.
    ///
    /// Gates run in order: rate limit (per tenant), circuit breaker (per destination), then a
    /// non-blocking push onto the ingress queue. A rejection at any gate returns immediately
    /// and leaves the later gates untouched. Never waits on I/O.
    pub fn send_event(
        &self,
        tenant_id: &str,
        destination_url: &str,
        kind: EventKind,
        payload: EventData,
    ) -> Result<Uuid, AdmissionError> {
        let event = Event::new(tenant_id, destination_url, kind, payload)?;
        self.admit(event)
    }

    /// Filter, serialize and admit a raw producer event for a subscription.
    ///
    /// Returns `Ok(None)` when the subscription does not want this kind.
    pub fn publish(
        &self,
        subscription: &Subscription,
        raw: &RawEvent,
    ) -> Result<Option<Uuid>, AdmissionError> {
        if !should_deliver(subscription, raw.kind().as_str()) {
            tracing::trace!(tenant_id = %subscription.tenant_id, kind = %raw.kind(), "event filtered out");
            return Ok(None);
        }
        let payload = self.serializer.serialize(&subscription.tenant_id, raw);
        let mut event = Event::new(
            subscription.tenant_id.as_str(),
            subscription.destination_url.as_str(),
            payload.kind,
            payload.data,
        )?;
        event.timestamp = payload.timestamp;
        self.admit(event).map(Some)
    }

    fn admit(&self, event: Event) -> Result<Uuid, AdmissionError> {
        if self.state.load(Ordering::Acquire) == STOPPED {
            return Err(AdmissionError::Closed);
        }
        if !self.limiter.allow(&event.tenant_id) {
            self.metrics.record_rate_limited();
            tracing::debug!(tenant_id = %event.tenant_id, "event rejected: rate limited");
            return Err(AdmissionError::RateLimited { tenant_id: event.tenant_id });
        }
        if !self.breaker.allows(&event.destination_url) {
            self.metrics.record_circuit_open();
            tracing::debug!(url = %event.destination_url, "event rejected: circuit open");
            return Err(AdmissionError::CircuitOpen { destination_url: event.destination_url });
        }
        let id = event.id;
        match self.ingress_tx.try_send(event) {
            Ok(()) => {
                self.metrics.record_queued();
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.record_queue_full();
                tracing::debug!(tenant_id = %event.tenant_id, capacity = self.config.queue_size, "event rejected: queue full");
                Err(AdmissionError::QueueFull { capacity: self.config.queue_size })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AdmissionError::Closed),
        }
    }

    /// Spawn the worker pool, the retry scheduler and drain loop, and the rate-limit sweep.
    ///
    /// Must be called from within a Tokio runtime. Calling it again, or after `stop`, only logs.
    pub async fn start(&self) {
        if let Err(current) =
            self.state.compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            if current == RUNNING {
                tracing::debug!("webhook service already running");
            } else {
                tracing::warn!("webhook service was stopped and cannot be restarted");
            }
            return;
        }

        tracing::info!(
            workers = self.config.workers,
            queue_size = self.config.queue_size,
            retry_queue_size = self.config.retry_queue_size,
            max_retries = self.config.max_retries,
            "starting webhook service"
        );

        let mut tasks = Vec::with_capacity(self.config.workers + 3);
        for id in 0..self.config.workers {
            let worker = DeliveryWorker::new(
                id,
                self.ingress_rx.clone(),
                self.dispatcher.clone(),
                self.retries.clone(),
                self.token.clone(),
            );
            tasks.push(tokio::spawn(worker.run()));
        }
        tasks.push(tokio::spawn(self.retries.clone().run_scheduler()));
        tasks.push(tokio::spawn(self.retries.clone().run_drain(self.dispatcher.clone())));
        tasks.push(tokio::spawn(self.limiter.clone().run_cleanup(self.token.clone())));

        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).extend(tasks);
    }

    /// Cancel every background task, wait for them (bounded by `shutdown_timeout`), then close
    /// the ingress queue. Events still queued are dropped.
    pub async fn stop(&self) {
        if self.state.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            tracing::debug!("webhook service already stopped");
            return;
        }
        tracing::info!("stopping webhook service");
        self.token.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let all = join_all(handles);
        tokio::pin!(all);
        let timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut all).await {
            Ok(results) => {
                for error in results.into_iter().filter_map(Result::err) {
                    tracing::error!(%error, "background task failed during shutdown");
                }
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "shutdown timed out, aborting remaining tasks"
                );
                for abort in aborts {
                    abort.abort();
                }
                if tokio::time::timeout(ABORT_GRACE, &mut all).await.is_err() {
                    tracing::warn!("aborted tasks did not finish in time");
                }
            }
        }

        match tokio::time::timeout(ABORT_GRACE, self.ingress_rx.lock()).await {
            Ok(mut rx) => {
                rx.close();
                tracing::info!(dropped = rx.len(), "webhook service stopped");
            }
            Err(_) => tracing::warn!("ingress queue still held at shutdown; left open"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retries
    }

    /// Direct access for ad-hoc deliveries such as [`Dispatcher::send_with_retry`].
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}
