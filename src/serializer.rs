//! Canonical wire payload.
//!
//! Body posted to every destination:
//!
//! ```json
//! {
//!   "event": "message",
//!   "session_id": "tenant-1",
//!   "timestamp": "2024-05-01T12:00:00Z",
//!   "data": { ... },
//!   "metadata": { "version": "0.1.0", "source": "hookrelay", "event_id": "...", "timestamp": "..." }
//! }
//! ```
//!
//! `metadata.event_id` is regenerated on every serialization (UUIDv7, so ids sort by creation
//! time). It is a correlation handle for logs, not a deduplication key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::{Event, EventData, EventKind, RawEvent};

/// Value of `metadata.source`.
pub const SOURCE: &str = "hookrelay";

/// Value of `metadata.version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Key under which an unknown event keeps its producer type name.
pub const ORIGINAL_TYPE_KEY: &str = "original_type";

/// Delivery envelope metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
    pub source: String,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl Metadata {
    fn fresh() -> Self {
        Self {
            version: VERSION.to_string(),
            source: SOURCE.to_string(),
            event_id: Uuid::now_v7(),
            timestamp: Utc::now(),
        }
    }
}

/// Wire form of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "event")]
    pub kind: EventKind,
    #[serde(rename = "session_id")]
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
    pub metadata: Metadata,
}

impl Payload {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Turns producer events and queued events into [`Payload`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSerializer;

impl EventSerializer {
    /// Serialize a raw producer event.
    ///
    /// Unknown events become `generic`, with the producer's type name stored under
    /// [`ORIGINAL_TYPE_KEY`] next to the original fields, so nothing is dropped here.
    pub fn serialize(&self, tenant_id: &str, raw: &RawEvent) -> Payload {
        let data = match raw {
            RawEvent::Known { data, .. } => data.clone(),
            RawEvent::Unknown { type_name, data, .. } => {
                let mut body = data.clone();
                body.insert(ORIGINAL_TYPE_KEY.to_string(), Value::String(type_name.clone()));
                body
            }
        };
        Payload {
            kind: raw.kind(),
            tenant_id: tenant_id.to_string(),
            timestamp: raw.timestamp(),
            data,
            metadata: Metadata::fresh(),
        }
    }

    /// Serialize an admitted event for one delivery attempt.
    pub fn serialize_event(&self, event: &Event) -> Payload {
        Payload {
            kind: event.kind,
            tenant_id: event.tenant_id.clone(),
            timestamp: event.timestamp,
            data: event.payload.clone(),
            metadata: Metadata::fresh(),
        }
    }
}
