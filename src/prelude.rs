//! Convenient re-exports for producers embedding the service.
pub use crate::{
    error::{AdmissionError, ConfigError},
    event::{EventData, EventKind, RawEvent},
    filter::Subscription,
    metrics::MetricsSnapshot,
    service::{WebhookService, WebhookServiceBuilder},
    WebhookConfig,
};
