//! Subscription filtering.
//!
//! A tenant subscribes with a list of tokens. Each token is tried against an event kind in this
//! order, first match wins:
//!
//! 1. exact kind tag (case-insensitive), e.g. `message`
//! 2. a named group, e.g. `messages` covers `message` and `receipt`
//! 3. full wildcard, `*` or `all`
//! 4. prefix wildcard, e.g. `call*` covers every kind starting with `call`
//!
//! An empty list means "everything"; a tenant without a destination URL receives nothing.
//!
//! ```rust
//! use hookrelay::filter::{should_deliver, Subscription};
//!
//! let sub = Subscription::new("tenant-1", "https://example.com/hook", ["messages"]);
//! assert!(should_deliver(&sub, "message"));
//! assert!(!should_deliver(&sub, "qr"));
//! ```

use crate::event::EventKind;

/// Named event groups. Group names are matched case-insensitively.
const EVENT_GROUPS: &[(&str, &[EventKind])] = &[
    ("messages", &[EventKind::Message, EventKind::Receipt]),
    (
        "connection",
        &[
            EventKind::Connected,
            EventKind::Disconnected,
            EventKind::LoggedOut,
            EventKind::ConnectFailure,
            EventKind::StreamReplaced,
            EventKind::TemporaryBan,
        ],
    ),
    ("pairing", &[EventKind::Qr, EventKind::PairSuccess, EventKind::PairError]),
    ("presence", &[EventKind::Presence, EventKind::ChatPresence]),
    ("calls", &[EventKind::CallOffer, EventKind::CallAccept, EventKind::CallTerminate]),
    ("groups", &[EventKind::GroupInfo, EventKind::JoinedGroup]),
    (
        "sync",
        &[EventKind::HistorySync, EventKind::AppStateSync, EventKind::OfflineSyncCompleted],
    ),
    (
        "contacts",
        &[EventKind::Picture, EventKind::PushName, EventKind::BusinessName, EventKind::IdentityChange],
    ),
];

/// Read-only view of the group registry.
pub fn event_groups() -> &'static [(&'static str, &'static [EventKind])] {
    EVENT_GROUPS
}

/// A tenant's delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subscription {
    pub tenant_id: String,
    pub destination_url: String,
    pub events: Vec<String>,
}

impl Subscription {
    pub fn new<I, S>(
        tenant_id: impl Into<String>,
        destination_url: impl Into<String>,
        events: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenant_id: tenant_id.into(),
            destination_url: destination_url.into(),
            events: events.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a comma-separated token list, dropping blanks.
    pub fn parse_events(list: &str) -> Vec<String> {
        list.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_string).collect()
    }
}

/// Decide whether `kind` should be forwarded to the subscriber.
pub fn should_deliver(subscription: &Subscription, kind: &str) -> bool {
    if subscription.destination_url.trim().is_empty() {
        return false;
    }
    if subscription.events.is_empty() {
        return true;
    }
    let kind = kind.trim().to_ascii_lowercase();
    subscription.events.iter().any(|token| token_matches(token, &kind))
}

fn token_matches(token: &str, kind: &str) -> bool {
    let token = token.trim().to_ascii_lowercase();
    if token == kind {
        return true;
    }
    if group_members(&token).is_some_and(|members| members.iter().any(|k| k.as_str() == kind)) {
        return true;
    }
    if token == "*" || token == "all" {
        return true;
    }
    match token.strip_suffix('*') {
        Some(prefix) if !prefix.is_empty() => kind.starts_with(prefix),
        _ => false,
    }
}

fn group_members(name: &str) -> Option<&'static [EventKind]> {
    EVENT_GROUPS.iter().find(|(group, _)| group.eq_ignore_ascii_case(name)).map(|(_, kinds)| *kinds)
}

/// Check tokens against the known kinds and groups.
///
/// Returns the tokens that match nothing. These are warnings only: a subscription with unknown
/// tokens is still accepted, and the unknown tokens simply never match.
pub fn validate_events(events: &[String]) -> Vec<String> {
    let unknown: Vec<String> =
        events.iter().filter(|token| !is_known_token(token)).cloned().collect();
    if !unknown.is_empty() {
        tracing::warn!(unknown = ?unknown, "subscription lists unknown event tokens");
    }
    unknown
}

fn is_known_token(token: &str) -> bool {
    let token = token.trim().to_ascii_lowercase();
    if token == "*" || token == "all" || group_members(&token).is_some() {
        return true;
    }
    if let Some(prefix) = token.strip_suffix('*') {
        return !prefix.is_empty() && EventKind::ALL.iter().any(|k| k.as_str().starts_with(prefix));
    }
    EventKind::ALL.iter().any(|k| k.as_str() == token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(events: &[&str]) -> Subscription {
        Subscription::new("t1", "https://hooks.test/in", events.iter().copied())
    }

    #[test]
    fn empty_destination_never_delivers() {
        let mut s = sub(&["*"]);
        s.destination_url = String::new();
        for kind in EventKind::ALL {
            assert!(!should_deliver(&s, kind.as_str()));
        }
    }

    #[test]
    fn empty_event_list_delivers_everything() {
        let s = sub(&[]);
        for kind in EventKind::ALL {
            assert!(should_deliver(&s, kind.as_str()));
        }
    }

    #[test]
    fn wildcards_deliver_any_kind() {
        for token in ["*", "all", "ALL"] {
            let s = sub(&[token]);
            for kind in EventKind::ALL {
                assert!(should_deliver(&s, kind.as_str()), "{token} should match {kind}");
            }
            assert!(should_deliver(&s, "something_new"));
        }
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let s = sub(&["Message"]);
        assert!(should_deliver(&s, "message"));
        assert!(should_deliver(&s, "MESSAGE"));
        assert!(!should_deliver(&s, "receipt"));
    }

    #[test]
    fn group_membership_matches_members_only() {
        let s = sub(&["messages"]);
        assert!(should_deliver(&s, "message"));
        assert!(should_deliver(&s, "receipt"));
        assert!(!should_deliver(&s, "qr"));
    }

    #[test]
    fn prefix_wildcard_matches_by_prefix() {
        let s = sub(&["call*"]);
        assert!(should_deliver(&s, "call_offer"));
        assert!(should_deliver(&s, "call_terminate"));
        assert!(!should_deliver(&s, "connected"));

        let bare = sub(&["*x"]);
        assert!(!should_deliver(&bare, "message"));
    }

    #[test]
    fn parse_events_splits_and_trims() {
        assert_eq!(
            Subscription::parse_events(" messages, qr ,,call* "),
            vec!["messages".to_string(), "qr".to_string(), "call*".to_string()]
        );
        assert!(Subscription::parse_events("").is_empty());
    }

    #[test]
    fn validate_reports_unknown_tokens_without_rejecting() {
        let tokens: Vec<String> =
            ["message", "messages", "all", "pair*", "bogus", "zzz*"].map(String::from).to_vec();
        assert_eq!(validate_events(&tokens), vec!["bogus".to_string(), "zzz*".to_string()]);

        let s = Subscription::new("t1", "https://hooks.test/in", tokens);
        assert!(should_deliver(&s, "qr"), "unknown tokens do not disable the subscription");
    }

    #[test]
    fn every_group_member_is_a_canonical_kind() {
        for (name, kinds) in event_groups() {
            assert!(!kinds.is_empty(), "group {name} is empty");
            assert!(!kinds.contains(&EventKind::Generic));
        }
    }
}
