//! Delivery workers consuming the shared ingress queue.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::event::Event;
use crate::retry::RetryManager;

/// Receiving half of the ingress queue, shared by every worker.
pub(crate) type SharedIngress = Arc<Mutex<mpsc::Receiver<Event>>>;

/// One member of the fixed worker pool.
#[derive(Debug)]
pub(crate) struct DeliveryWorker {
    id: usize,
    ingress: SharedIngress,
    dispatcher: Dispatcher,
    retries: RetryManager,
    token: CancellationToken,
}

impl DeliveryWorker {
    pub(crate) fn new(
        id: usize,
        ingress: SharedIngress,
        dispatcher: Dispatcher,
        retries: RetryManager,
        token: CancellationToken,
    ) -> Self {
        Self { id, ingress, dispatcher, retries, token }
    }

    /// Take events until cancelled or the queue closes.
    ///
    /// The queue lock is held only while waiting for the next event, never across a delivery.
    pub(crate) async fn run(self) {
        tracing::debug!(worker_id = self.id, "delivery worker starting");
        loop {
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                next = async { self.ingress.lock().await.recv().await } => next,
            };
            let Some(event) = next else { break };

            if let Err(error) = self.dispatcher.send(&event).await {
                let outcome = self.retries.handle_failure(event, &error);
                tracing::trace!(worker_id = self.id, ?outcome, "failure handled");
            }
        }
        tracing::debug!(worker_id = self.id, "delivery worker stopped");
    }
}
