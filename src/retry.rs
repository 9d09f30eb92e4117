//! Asynchronous retry scheduling.
//!
//! Failed events wait in a single time-ordered heap owned by one scheduler task instead of one
//! timer per event. When an entry comes due it is moved onto the bounded retry queue with a
//! non-blocking push; a full queue drops the event and counts it as failed. A drain loop feeds
//! the retry queue back through the [`Dispatcher`].
//!
//! Everything stops on one [`CancellationToken`]. After cancellation nothing is scheduled and
//! the scheduler never pushes onto the retry queue again, so a queue being torn down is never
//! touched.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryBackoff;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, DeliveryError};
use crate::event::Event;
use crate::metrics::Metrics;

/// What [`RetryManager::handle_failure`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Parked until `delay` has passed; `retry_count` is the value it will be delivered with.
    Scheduled { retry_count: u32, delay: Duration },
    /// Retry budget used up; the event was dropped and counted as failed.
    Exhausted,
    /// The failure cannot go away on retry; the event was dropped and counted as failed.
    Permanent,
    /// Shutdown in progress; the event was dropped.
    Cancelled,
}

#[derive(Debug)]
struct Delayed {
    fire_at: Instant,
    seq: u64,
    event: Event,
}

impl Eq for Delayed {}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
        other.fire_at.cmp(&self.fire_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Inner {
    delayed: Mutex<BinaryHeap<Delayed>>,
    seq: AtomicU64,
    wake: Notify,
    queue_tx: mpsc::Sender<Event>,
    queue_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    backoff: RetryBackoff,
    max_retries: u32,
    metrics: Arc<Metrics>,
    token: CancellationToken,
}

/// Reschedules failed deliveries with exponential backoff.
///
/// Clones share the same heap and queue.
#[derive(Debug, Clone)]
pub struct RetryManager {
    inner: Arc<Inner>,
}

impl RetryManager {
    pub fn new(
        backoff: RetryBackoff,
        max_retries: u32,
        queue_size: usize,
        metrics: Arc<Metrics>,
        token: CancellationToken,
    ) -> Result<Self, ConfigError> {
        if queue_size == 0 {
            return Err(ConfigError::positive("retry_queue_size", 0usize));
        }
        let (queue_tx, queue_rx) = mpsc::channel(queue_size);
        Ok(Self {
            inner: Arc::new(Inner {
                delayed: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                wake: Notify::new(),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                backoff,
                max_retries,
                metrics,
                token,
            }),
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.max_retries
    }

    /// Events waiting for their delay to pass.
    pub fn pending(&self) -> usize {
        self.inner.delayed.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Events released and waiting on the retry queue.
    pub fn queued(&self) -> usize {
        self.inner.queue_tx.max_capacity() - self.inner.queue_tx.capacity()
    }

    /// Decide the fate of an event whose delivery just failed.
    ///
    /// An event already at `max_retries`, or one whose failure is permanent, is dropped and
    /// counted as failed exactly once; otherwise its `retry_count` is bumped and it is scheduled
    /// again.
    pub fn handle_failure(&self, mut event: Event, error: &DeliveryError) -> RetryOutcome {
        if self.inner.token.is_cancelled() {
            tracing::debug!(event_id = %event.id, %error, "shutting down, failed event not retried");
            return RetryOutcome::Cancelled;
        }
        if error.is_permanent() {
            self.inner.metrics.record_failed();
            tracing::warn!(
                event_id = %event.id,
                tenant_id = %event.tenant_id,
                url = %event.destination_url,
                %error,
                "permanent delivery failure, dropping event"
            );
            return RetryOutcome::Permanent;
        }
        if event.retry_count >= self.inner.max_retries {
            self.inner.metrics.record_failed();
            tracing::warn!(
                event_id = %event.id,
                tenant_id = %event.tenant_id,
                url = %event.destination_url,
                attempts = event.retry_count.saturating_add(1),
                %error,
                "retries exhausted, dropping event"
            );
            return RetryOutcome::Exhausted;
        }
        event.retry_count += 1;
        let retry_count = event.retry_count;
        match self.schedule_retry(event) {
            Some(delay) => {
                self.inner.metrics.record_retried();
                RetryOutcome::Scheduled { retry_count, delay }
            }
            None => RetryOutcome::Cancelled,
        }
    }

    /// Park `event` for the backoff delay of its current `retry_count`.
    ///
    /// Returns the delay, or `None` once cancellation has been signalled.
    pub fn schedule_retry(&self, event: Event) -> Option<Duration> {
        if self.inner.token.is_cancelled() {
            return None;
        }
        let delay = self.inner.backoff.delay(event.retry_count);
        tracing::debug!(
            event_id = %event.id,
            retry_count = event.retry_count,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        let entry = Delayed {
            fire_at: Instant::now() + delay,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            event,
        };
        self.inner.delayed.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
        self.inner.wake.notify_one();
        Some(delay)
    }

    /// Scheduler task: releases due events onto the retry queue until cancelled.
    pub async fn run_scheduler(self) {
        let inner = &self.inner;
        loop {
            let next = self.release_due();
            let sleep = async move {
                match next {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                () = inner.token.cancelled() => break,
                () = inner.wake.notified() => {}
                () = sleep => {}
            }
        }
        let abandoned = {
            let mut delayed = inner.delayed.lock().unwrap_or_else(PoisonError::into_inner);
            let n = delayed.len();
            delayed.clear();
            n
        };
        tracing::debug!(abandoned, "retry scheduler stopped");
    }

    /// Move every due entry onto the retry queue; returns the next deadline.
    fn release_due(&self) -> Option<Instant> {
        let inner = &self.inner;
        let now = Instant::now();
        let mut delayed = inner.delayed.lock().unwrap_or_else(PoisonError::into_inner);
        while delayed.peek().is_some_and(|d| d.fire_at <= now) {
            if inner.token.is_cancelled() {
                return None;
            }
            let Some(due) = delayed.pop() else { break };
            match inner.queue_tx.try_send(due.event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    inner.metrics.record_failed();
                    tracing::warn!(
                        event_id = %event.id,
                        tenant_id = %event.tenant_id,
                        retry_count = event.retry_count,
                        "retry queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return None,
            }
        }
        delayed.peek().map(|d| d.fire_at)
    }

    /// Drain loop: re-dispatches retried events until cancelled.
    ///
    /// The retry queue has a single consumer; a second call logs and returns.
    pub async fn run_drain(self, dispatcher: Dispatcher) {
        let taken = self.inner.queue_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut rx) = taken else {
            tracing::warn!("retry drain loop already running");
            return;
        };
        loop {
            let event = tokio::select! {
                biased;
                () = self.inner.token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            match dispatcher.send(&event).await {
                Ok(_) => tracing::debug!(event_id = %event.id, retry_count = event.retry_count, "retry delivered"),
                Err(error) => {
                    self.handle_failure(event, &error);
                }
            }
        }
        rx.close();
        tracing::debug!(dropped = rx.len(), "retry drain loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::event::{EventData, EventKind};
    use crate::transport::test_support::scripted;

    fn manager(max_retries: u32, queue_size: usize) -> (RetryManager, Arc<Metrics>, CancellationToken) {
        let metrics = Arc::new(Metrics::new());
        let token = CancellationToken::new();
        let backoff =
            RetryBackoff::new(Duration::from_secs(1), 16, Duration::from_secs(300)).unwrap();
        let rm = RetryManager::new(backoff, max_retries, queue_size, metrics.clone(), token.clone())
            .unwrap();
        (rm, metrics, token)
    }

    fn event() -> Event {
        Event::new("t1", "https://hooks.test/in", EventKind::Message, EventData::new()).unwrap()
    }

    fn take_rx(rm: &RetryManager) -> mpsc::Receiver<Event> {
        rm.inner.queue_rx.lock().unwrap().take().unwrap()
    }

    fn boom() -> DeliveryError {
        DeliveryError::HttpStatus { status: 500, body: String::new() }
    }

    #[test]
    fn event_at_budget_is_dropped_and_counted_once() {
        let (rm, metrics, _) = manager(3, 10);
        let mut ev = event();
        ev.retry_count = 3;
        assert_eq!(rm.handle_failure(ev, &boom()), RetryOutcome::Exhausted);
        assert_eq!(rm.pending(), 0);
        let s = metrics.snapshot();
        assert_eq!(s.total_failed, 1);
        assert_eq!(s.retried, 0);
    }

    #[test]
    fn serialization_failure_is_dropped_without_retrying() {
        let (rm, metrics, _) = manager(3, 10);
        let err = DeliveryError::Serialization { message: "bad header".into() };
        assert_eq!(rm.handle_failure(event(), &err), RetryOutcome::Permanent);
        assert_eq!(rm.pending(), 0);
        let s = metrics.snapshot();
        assert_eq!(s.total_failed, 1);
        assert_eq!(s.retried, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_bumps_retry_count_with_backoff() {
        let (rm, metrics, _) = manager(3, 10);
        assert_eq!(
            rm.handle_failure(event(), &boom()),
            RetryOutcome::Scheduled { retry_count: 1, delay: Duration::from_secs(1) }
        );
        let mut ev = event();
        ev.retry_count = 2;
        assert_eq!(
            rm.handle_failure(ev, &boom()),
            RetryOutcome::Scheduled { retry_count: 3, delay: Duration::from_secs(4) }
        );
        assert_eq!(rm.pending(), 2);
        assert_eq!(metrics.snapshot().retried, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_releases_in_deadline_order_after_delay() {
        let (rm, _, token) = manager(5, 10);
        let mut rx = take_rx(&rm);
        let task = tokio::spawn(rm.clone().run_scheduler());

        let mut late = event();
        late.retry_count = 3;
        let mut early = event();
        early.retry_count = 1;
        let started = Instant::now();
        rm.schedule_retry(late.clone());
        rm.schedule_retry(early.clone());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, early.id);
        assert!(started.elapsed() >= Duration::from_secs(1));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.id, late.id);
        assert!(started.elapsed() >= Duration::from_secs(4));

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn full_retry_queue_drops_and_counts_failure() {
        let (rm, metrics, token) = manager(5, 1);
        let mut rx = take_rx(&rm);
        let task = tokio::spawn(rm.clone().run_scheduler());

        rm.schedule_retry(event());
        rm.schedule_retry(event());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(rm.queued(), 1);
        assert_eq!(metrics.snapshot().total_failed, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_scheduling_and_pushing() {
        let (rm, _, token) = manager(5, 10);
        let mut rx = take_rx(&rm);
        let task = tokio::spawn(rm.clone().run_scheduler());

        rm.schedule_retry(event());
        token.cancel();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(rx.try_recv().is_err(), "nothing pushed after cancellation");
        assert_eq!(rm.pending(), 0);
        assert_eq!(rm.schedule_retry(event()), None);
        assert_eq!(rm.handle_failure(event(), &boom()), RetryOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_loop_redelivers_until_success() {
        let (rm, metrics, token) = manager(5, 10);
        let (transport, seen) = scripted(&[500, 200]);
        let dispatcher = Dispatcher::new(
            transport,
            CircuitBreaker::new(CircuitBreakerConfig::default()),
            metrics.clone(),
            Duration::from_secs(5),
            "test",
        )
        .unwrap();

        let scheduler = tokio::spawn(rm.clone().run_scheduler());
        let drain = tokio::spawn(rm.clone().run_drain(dispatcher));

        rm.handle_failure(event(), &boom());
        for _ in 0..100 {
            if metrics.snapshot().total_success == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let s = metrics.snapshot();
        assert_eq!(s.total_success, 1);
        assert_eq!(s.retried, 2);
        assert_eq!(s.total_failed, 0);
        assert_eq!(seen.lock().unwrap().len(), 2);

        token.cancel();
        scheduler.await.unwrap();
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn second_drain_loop_returns_immediately() {
        let (rm, metrics, _) = manager(1, 1);
        let (transport, _) = scripted(&[200]);
        let dispatcher = Dispatcher::new(
            transport,
            CircuitBreaker::new(CircuitBreakerConfig::default()),
            metrics,
            Duration::from_secs(1),
            "test",
        )
        .unwrap();
        let _rx = take_rx(&rm);
        rm.run_drain(dispatcher).await;
    }

    #[test]
    fn zero_queue_size_is_rejected() {
        let err = RetryManager::new(
            RetryBackoff::default(),
            3,
            0,
            Arc::new(Metrics::new()),
            CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "retry_queue_size", .. }));
    }
}
