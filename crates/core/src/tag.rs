//! Temporal tags
//!
//! The atomic unit of entity state change is the temporal tag: a
//! `(timestamp_ns, namespace, value)` triple whose wire form is
//! `<nanoseconds>|<namespace>:<value>`. Tag sequences are append-only;
//! "removing" state means appending a successor tag in the same namespace.
//!
//! # Grammar
//!
//! ```text
//! tag        := [ timestamp "|" ] plain
//! plain      := namespace ":" value
//! timestamp  := decimal nanoseconds since epoch
//! ```
//!
//! Namespaces may themselves contain colons (`rbac:perm:entity`); the value
//! is everything after the **last** colon. All parsing is explicit — there
//! is no reflective dispatch anywhere in the tag path.

use crate::error::{Error, Result};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespaces reserved by the engine.
pub mod namespaces {
    /// Entity kind (`type:task`, `type:session`, `type:metric`, ...).
    pub const TYPE: &str = "type";
    /// Dataset membership.
    pub const DATASET: &str = "dataset";
    /// Free-form status.
    pub const STATUS: &str = "status";
    /// Caller identity recorded at creation.
    pub const CREATED_BY: &str = "created_by";
    /// Creation marker.
    pub const CREATED: &str = "created";
    /// Lifecycle state (`lifecycle:active` etc.).
    pub const LIFECYCLE: &str = "lifecycle";
    /// Content-write marker; lets as-of queries decide content visibility.
    pub const CONTENT: &str = "content";
    /// RBAC role assignments.
    pub const RBAC_ROLE: &str = "rbac:role";
    /// RBAC permission prefix (`rbac:perm:entity:view`, ...).
    pub const RBAC_PERM_PREFIX: &str = "rbac:perm";
    /// Identity attribute prefix.
    pub const IDENTITY_PREFIX: &str = "identity";
    /// Metric tag prefix; writes to entities tagged under it never emit
    /// metrics themselves.
    pub const METRIC_PREFIX: &str = "metric";
}

/// Entity type value used for engine-emitted metric entities.
pub const METRIC_ENTITY_TYPE: &str = "metric";
/// Entity type value for session entities.
pub const SESSION_ENTITY_TYPE: &str = "session";
/// Entity type value for stored configuration.
pub const CONFIG_ENTITY_TYPE: &str = "config";
/// Entity type value for content chunk entities.
pub const CHUNK_ENTITY_TYPE: &str = "chunk";

/// A single temporal tag: when, what namespace, what value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemporalTag {
    /// When this tag was attached (nanoseconds since epoch).
    pub timestamp: Timestamp,
    /// Namespace; may contain colons.
    pub namespace: String,
    /// Value within the namespace.
    pub value: String,
}

impl TemporalTag {
    /// Create a tag from parts.
    pub fn new(
        timestamp: Timestamp,
        namespace: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        TemporalTag {
            timestamp,
            namespace: namespace.into(),
            value: value.into(),
        }
    }

    /// Parse a tag in either wire form (`ts|ns:value`) or plain form
    /// (`ns:value`). A plain tag gets the supplied `default_ts`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a malformed timestamp prefix or a missing
    /// `namespace:value` separator.
    pub fn parse(s: &str, default_ts: Timestamp) -> Result<Self> {
        let (ts, plain) = match split_timestamp(s) {
            Some((ts_str, rest)) => {
                let nanos: u64 = ts_str.parse().map_err(|_| {
                    Error::invalid_input(format!("malformed tag timestamp in '{}'", s))
                })?;
                (Timestamp::from_nanos(nanos), rest)
            }
            None => (default_ts, s),
        };
        let (namespace, value) = split_plain(plain).ok_or_else(|| {
            Error::invalid_input(format!("tag '{}' is not of the form namespace:value", plain))
        })?;
        if namespace.is_empty() {
            return Err(Error::invalid_input(format!(
                "tag '{}' has an empty namespace",
                plain
            )));
        }
        Ok(TemporalTag::new(ts, namespace, value))
    }

    /// Wire form: `timestamp|namespace:value`.
    pub fn wire(&self) -> String {
        format!(
            "{}|{}:{}",
            self.timestamp.as_nanos(),
            self.namespace,
            self.value
        )
    }

    /// Plain form without the timestamp: `namespace:value`.
    ///
    /// This is the form the tag index is keyed by.
    pub fn plain(&self) -> String {
        format!("{}:{}", self.namespace, self.value)
    }

    /// True for tags under the reserved metric prefix.
    pub fn is_metric(&self) -> bool {
        self.namespace == namespaces::METRIC_PREFIX
            || self
                .namespace
                .starts_with(&format!("{}:", namespaces::METRIC_PREFIX))
    }
}

impl fmt::Display for TemporalTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire())
    }
}

/// Split a leading all-digit timestamp prefix off a tag string.
///
/// Returns `None` when the string carries no `|` or the prefix is not
/// purely numeric (a `|` inside a value must not be mistaken for one).
pub fn split_timestamp(s: &str) -> Option<(&str, &str)> {
    let (prefix, rest) = s.split_once('|')?;
    if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) {
        Some((prefix, rest))
    } else {
        None
    }
}

/// Split a plain tag into `(namespace, value)` at the last colon.
pub fn split_plain(s: &str) -> Option<(&str, &str)> {
    s.rsplit_once(':')
}

/// Normalize a query tag to the plain indexed form, dropping any numeric
/// timestamp prefix.
pub fn normalize_query_tag(s: &str) -> &str {
    match split_timestamp(s) {
        Some((_, rest)) => rest,
        None => s,
    }
}

/// Lifecycle states an entity moves through.
///
/// Transitions are ordinary tag writes (`lifecycle:<state>`) through the
/// normal writer path, so they are WAL-durable like any other mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Live entity, fully visible.
    Active,
    /// Logically deleted; record retained until compaction.
    SoftDeleted,
    /// Moved to cold state by policy.
    Archived,
    /// Final state; contents dropped at next checkpoint.
    Purged,
}

impl LifecycleState {
    /// The tag value for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::SoftDeleted => "soft_deleted",
            LifecycleState::Archived => "archived",
            LifecycleState::Purged => "purged",
        }
    }

    /// Parse a `lifecycle:` tag value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(LifecycleState::Active),
            "soft_deleted" => Some(LifecycleState::SoftDeleted),
            "archived" => Some(LifecycleState::Archived),
            "purged" => Some(LifecycleState::Purged),
            _ => None,
        }
    }

    /// The full plain tag for this state.
    pub fn tag_value(&self) -> String {
        format!("{}:{}", namespaces::LIFECYCLE, self.as_str())
    }

    /// All states in transition order.
    pub fn all() -> [LifecycleState; 4] {
        [
            LifecycleState::Active,
            LifecycleState::SoftDeleted,
            LifecycleState::Archived,
            LifecycleState::Purged,
        ]
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_wire_form() {
        let tag = TemporalTag::parse("1000|status:open", Timestamp::ZERO).unwrap();
        assert_eq!(tag.timestamp.as_nanos(), 1000);
        assert_eq!(tag.namespace, "status");
        assert_eq!(tag.value, "open");
    }

    #[test]
    fn parse_plain_form_uses_default_ts() {
        let tag = TemporalTag::parse("type:task", Timestamp::from_nanos(42)).unwrap();
        assert_eq!(tag.timestamp.as_nanos(), 42);
        assert_eq!(tag.plain(), "type:task");
    }

    #[test]
    fn parse_nested_namespace_splits_at_last_colon() {
        let tag = TemporalTag::parse("rbac:perm:entity:view", Timestamp::ZERO).unwrap();
        assert_eq!(tag.namespace, "rbac:perm:entity");
        assert_eq!(tag.value, "view");
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert!(TemporalTag::parse("justonestring", Timestamp::ZERO).is_err());
    }

    #[test]
    fn parse_rejects_bad_timestamp() {
        // A non-numeric prefix before '|' is not a timestamp, so the '|'
        // lands inside the namespace and parsing still succeeds
        let tag = TemporalTag::parse("abc|ns:v", Timestamp::ZERO).unwrap();
        assert_eq!(tag.namespace, "abc|ns");

        // An overflowing numeric prefix is a malformed timestamp
        assert!(TemporalTag::parse("99999999999999999999999|ns:v", Timestamp::ZERO).is_err());
    }

    #[test]
    fn wire_round_trip() {
        let tag = TemporalTag::new(Timestamp::from_nanos(123456789), "dataset", "ops");
        let parsed = TemporalTag::parse(&tag.wire(), Timestamp::ZERO).unwrap();
        assert_eq!(tag, parsed);
    }

    #[test]
    fn normalize_strips_numeric_prefix_only() {
        assert_eq!(normalize_query_tag("1000|status:open"), "status:open");
        assert_eq!(normalize_query_tag("status:open"), "status:open");
        assert_eq!(normalize_query_tag("a|b:c"), "a|b:c");
    }

    #[test]
    fn metric_prefix_detection() {
        let m = TemporalTag::new(Timestamp::ZERO, "metric", "writes_total");
        assert!(m.is_metric());
        let m2 = TemporalTag::new(Timestamp::ZERO, "metric:storage", "bytes");
        assert!(m2.is_metric());
        let user = TemporalTag::new(Timestamp::ZERO, "metrics_dashboard", "on");
        assert!(!user.is_metric());
    }

    proptest::proptest! {
        // Colon-free values keep the last-colon split unambiguous; nested
        // namespaces are fair game
        #[test]
        fn wire_round_trip_holds(
            ts in proptest::prelude::any::<u64>(),
            ns in "[a-z]{1,8}(:[a-z]{1,8}){0,2}",
            value in "[A-Za-z0-9_.-]{1,16}",
        ) {
            let tag = TemporalTag::new(Timestamp::from_nanos(ts), ns, value);
            let parsed = TemporalTag::parse(&tag.wire(), Timestamp::ZERO).unwrap();
            proptest::prop_assert_eq!(parsed, tag);
        }
    }

    #[test]
    fn lifecycle_round_trip() {
        for state in LifecycleState::all() {
            assert_eq!(LifecycleState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(LifecycleState::from_str("nope"), None);
        assert_eq!(
            LifecycleState::SoftDeleted.tag_value(),
            "lifecycle:soft_deleted"
        );
    }
}
