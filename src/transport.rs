//! HTTP transport seam.
//!
//! The dispatcher talks to destinations through a boxed [`tower::Service`], so tests and
//! embedders can substitute their own transport (`tower::service_fn` is enough). The production
//! implementation is [`HttpTransport`], a thin `reqwest` client.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Client;
use thiserror::Error;
use tower::util::BoxCloneSyncService;
use tower::Service;

use crate::error::ConfigError;

/// Bodies larger than this are cut before being kept for diagnostics.
pub const MAX_RESPONSE_BODY_BYTES: usize = 1024;

const TRUNCATED_SUFFIX: &str = "... (truncated)";

/// One outbound POST.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What came back from the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request produced no HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub timed_out: bool,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), timed_out: false }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        };
        Self { message, timed_out: err.is_timeout() }
    }
}

/// Type-erased transport shared by all workers.
pub type BoxTransport = BoxCloneSyncService<WebhookRequest, WebhookResponse, TransportError>;

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a client with a per-request timeout and a fixed `User-Agent`.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn boxed(self) -> BoxTransport {
        BoxCloneSyncService::new(self)
    }
}

impl Service<WebhookRequest> for HttpTransport {
    type Response = WebhookResponse;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<WebhookResponse, TransportError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: WebhookRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let response = client
                .post(&request.url)
                .headers(request.headers)
                .body(request.body)
                .send()
                .await?;
            let status = response.status().as_u16();
            let body = match response.bytes().await {
                Ok(bytes) => truncate_body(&bytes),
                Err(e) => {
                    tracing::debug!(error = %e, "failed to read response body");
                    format!("[failed to read response body: {e}]")
                }
            };
            Ok(WebhookResponse { status, body })
        })
    }
}

/// Lossy UTF-8 view of `bytes`, cut to [`MAX_RESPONSE_BODY_BYTES`].
pub fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_RESPONSE_BODY_BYTES {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let keep = MAX_RESPONSE_BODY_BYTES - TRUNCATED_SUFFIX.len();
    format!("{}{TRUNCATED_SUFFIX}", String::from_utf8_lossy(&bytes[..keep]))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    pub(crate) type Seen = Arc<Mutex<Vec<WebhookRequest>>>;

    /// Fake transport answering with `statuses` in order, repeating the last one.
    pub(crate) fn scripted(statuses: &[u16]) -> (BoxTransport, Seen) {
        let statuses = Arc::new(statuses.to_vec());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen: Seen = Arc::default();
        let log = seen.clone();
        let svc = tower::service_fn(move |req: WebhookRequest| {
            let statuses = statuses.clone();
            let n = calls.fetch_add(1, Ordering::SeqCst);
            log.lock().unwrap().push(req);
            async move {
                let status = statuses[n.min(statuses.len() - 1)];
                Ok::<_, TransportError>(WebhookResponse { status, body: format!("status {status}") })
            }
        });
        (BoxCloneSyncService::new(svc), seen)
    }
}
