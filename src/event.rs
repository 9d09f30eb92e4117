//! Event model: canonical kinds, raw producer events, and queued delivery events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ConfigError;

/// JSON object carried as an event body.
pub type EventData = Map<String, Value>;

macro_rules! event_kinds {
    ($($variant:ident => $tag:literal),+ $(,)?) => {
        /// Canonical tag identifying an event's semantic type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum EventKind {
            $($variant,)+
            /// Any producer event without a canonical tag.
            Generic,
        }

        impl EventKind {
            /// Every kind, `Generic` last.
            pub const ALL: &'static [EventKind] = &[$(EventKind::$variant,)+ EventKind::Generic];

            /// Wire tag of this kind.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(EventKind::$variant => $tag,)+
                    EventKind::Generic => "generic",
                }
            }
        }
    };
}

event_kinds! {
    Message => "message",
    Receipt => "receipt",
    UndecryptableMessage => "undecryptable_message",
    Presence => "presence",
    ChatPresence => "chat_presence",
    Connected => "connected",
    Disconnected => "disconnected",
    LoggedOut => "logged_out",
    ConnectFailure => "connect_failure",
    StreamReplaced => "stream_replaced",
    TemporaryBan => "temporary_ban",
    Qr => "qr",
    PairSuccess => "pair_success",
    PairError => "pair_error",
    HistorySync => "history_sync",
    AppStateSync => "app_state_sync",
    OfflineSyncCompleted => "offline_sync_completed",
    CallOffer => "call_offer",
    CallAccept => "call_accept",
    CallTerminate => "call_terminate",
    GroupInfo => "group_info",
    JoinedGroup => "joined_group",
    Picture => "picture",
    PushName => "push_name",
    BusinessName => "business_name",
    IdentityChange => "identity_change",
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no canonical kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind '{0}'")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    /// Case-insensitive lookup by wire tag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// An event as handed over by the protocol client, before serialization.
///
/// Known kinds carry their canonical tag; anything else is kept as `Unknown` together with the
/// producer's own type name so the serializer can still forward it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Known { kind: EventKind, timestamp: DateTime<Utc>, data: EventData },
    Unknown { type_name: String, timestamp: DateTime<Utc>, data: EventData },
}

impl RawEvent {
    /// Known event stamped with the current time.
    pub fn known(kind: EventKind, data: EventData) -> Self {
        Self::Known { kind, timestamp: Utc::now(), data }
    }

    /// Unrecognized event stamped with the current time.
    pub fn unknown(type_name: impl Into<String>, data: EventData) -> Self {
        Self::Unknown { type_name: type_name.into(), timestamp: Utc::now(), data }
    }

    /// Canonical kind, `Generic` for unknown events.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Known { kind, .. } => *kind,
            Self::Unknown { .. } => EventKind::Generic,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Known { timestamp, .. } | Self::Unknown { timestamp, .. } => *timestamp,
        }
    }
}

/// An admitted event travelling through the delivery pipeline.
///
/// Owned by exactly one queue at a time; only `retry_count` changes after admission.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventData,
    pub destination_url: String,
    pub retry_count: u32,
}

impl Event {
    /// Build a fresh event, validating tenant and destination.
    pub fn new(
        tenant_id: impl Into<String>,
        destination_url: impl Into<String>,
        kind: EventKind,
        payload: EventData,
    ) -> Result<Self, ConfigError> {
        let tenant_id = tenant_id.into();
        let destination_url = destination_url.into();
        if tenant_id.trim().is_empty() {
            return Err(ConfigError::EmptyTenantId);
        }
        // Delivered as `X-Webhook-Session`.
        if HeaderValue::from_str(&tenant_id).is_err() {
            return Err(ConfigError::InvalidTenantId { tenant_id });
        }
        validate_destination_url(&destination_url)?;
        Ok(Self {
            id: Uuid::now_v7(),
            kind,
            tenant_id,
            timestamp: Utc::now(),
            payload,
            destination_url,
            retry_count: 0,
        })
    }
}

/// Reject empty or non-HTTP destination URLs.
pub fn validate_destination_url(url: &str) -> Result<(), ConfigError> {
    if url.trim().is_empty() {
        return Err(ConfigError::EmptyDestinationUrl);
    }
    let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidDestinationUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidDestinationUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}
