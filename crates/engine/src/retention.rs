//! Temporal retention
//!
//! Retention bounds each entity's tag history by age and count. It runs
//! **in-line** with ordinary writes — when the writer touches an entity,
//! the retention manager trims it right there. There is deliberately no
//! standalone sweeping process: a sweeper writing trims of its own is the
//! feedback loop that melted the original design.
//!
//! Trimming drops the oldest entries beyond policy while always preserving
//! the newest tag in every namespace, so the entity's current state stays
//! reconstructible.
//!
//! The same module defines the lifecycle policy types
//! (`active → soft_deleted → archived → purged`) the deletion collector
//! evaluates; transitions themselves are ordinary tag writes.

use crate::memory::PressureLevel;
use entitydb_core::{namespaces, Entity, LifecycleState, TemporalTag, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Age/count bounds for one class of entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimPolicy {
    /// Entity type this policy applies to; `None` is the fallback.
    pub entity_type: Option<String>,
    /// Tags older than this are eligible for trimming.
    pub max_age: Duration,
    /// Tag count above which the oldest eligible tags are trimmed.
    pub max_tags: usize,
}

/// What one in-line retention pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrimOutcome {
    /// Tags removed.
    pub trimmed: usize,
    /// Plain tag forms no longer present on the entity at all; the caller
    /// removes these from the tag index.
    pub removed_plain: Vec<String>,
}

/// In-line retention manager.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    policies: Vec<TrimPolicy>,
    fallback: TrimPolicy,
}

impl RetentionManager {
    /// Build the default policy table: metrics 24 h / 1000 tags, sessions
    /// 7 d / 50 tags, everything else per the configured defaults.
    pub fn with_defaults(default_max_age: Duration, default_max_tags: usize) -> Self {
        RetentionManager {
            policies: vec![
                TrimPolicy {
                    entity_type: Some("metric".to_string()),
                    max_age: Duration::from_secs(24 * 3600),
                    max_tags: 1000,
                },
                TrimPolicy {
                    entity_type: Some("session".to_string()),
                    max_age: Duration::from_secs(7 * 24 * 3600),
                    max_tags: 50,
                },
            ],
            fallback: TrimPolicy {
                entity_type: None,
                max_age: default_max_age,
                max_tags: default_max_tags,
            },
        }
    }

    /// The policy governing an entity type.
    pub fn policy_for(&self, entity_type: Option<&str>) -> &TrimPolicy {
        entity_type
            .and_then(|t| {
                self.policies
                    .iter()
                    .find(|p| p.entity_type.as_deref() == Some(t))
            })
            .unwrap_or(&self.fallback)
    }

    /// Trim one entity in-line with a write.
    ///
    /// Under memory pressure metric entities are skipped entirely (their
    /// churn is what pressure is trying to shed), and thresholds tighten to
    /// half for everything else.
    pub fn apply(
        &self,
        entity: &mut Entity,
        now: Timestamp,
        pressure: PressureLevel,
    ) -> TrimOutcome {
        if pressure >= PressureLevel::High && entity.is_metric() {
            return TrimOutcome::default();
        }

        let policy = self.policy_for(entity.entity_type());
        let (max_age, max_tags) = if pressure >= PressureLevel::High {
            (policy.max_age / 2, (policy.max_tags / 2).max(1))
        } else {
            (policy.max_age, policy.max_tags)
        };

        trim_tags(entity, now, max_age, max_tags)
    }
}

/// Drop the oldest tags beyond the given bounds, preserving the newest tag
/// per namespace.
fn trim_tags(
    entity: &mut Entity,
    now: Timestamp,
    max_age: Duration,
    max_tags: usize,
) -> TrimOutcome {
    let before_plain: HashSet<String> = entity.tags.iter().map(|t| t.plain()).collect();

    // The newest tag of each namespace is immovable
    let mut protected = vec![false; entity.tags.len()];
    let mut seen: HashSet<&str> = HashSet::new();
    for (idx, tag) in entity.tags.iter().enumerate().rev() {
        if seen.insert(tag.namespace.as_str()) {
            protected[idx] = true;
        }
    }

    let cutoff = now.saturating_sub(max_age);
    let mut keep: Vec<bool> = entity
        .tags
        .iter()
        .enumerate()
        .map(|(idx, tag)| protected[idx] || tag.timestamp >= cutoff)
        .collect();

    // Count bound: walk oldest-first, dropping unprotected survivors until
    // the total fits
    let mut surviving = keep.iter().filter(|k| **k).count();
    if surviving > max_tags {
        for idx in 0..entity.tags.len() {
            if surviving <= max_tags {
                break;
            }
            if keep[idx] && !protected[idx] {
                keep[idx] = false;
                surviving -= 1;
            }
        }
    }

    let trimmed = keep.iter().filter(|k| !**k).count();
    if trimmed == 0 {
        return TrimOutcome::default();
    }

    let mut kept_tags: Vec<TemporalTag> = Vec::with_capacity(surviving);
    for (idx, tag) in entity.tags.drain(..).enumerate() {
        if keep[idx] {
            kept_tags.push(tag);
        }
    }
    entity.tags = kept_tags;
    // Trimming the oldest entries moves the derived creation timestamp
    entity.created_at = entity.tags.first().map(|t| t.timestamp).unwrap_or(now);

    let after_plain: HashSet<String> = entity.tags.iter().map(|t| t.plain()).collect();
    let removed_plain: Vec<String> = before_plain
        .into_iter()
        .filter(|p| !after_plain.contains(p))
        .collect();

    debug!(id = %entity.id, trimmed, "retention trimmed tag history");
    TrimOutcome {
        trimmed,
        removed_plain,
    }
}

// ============================================================================
// Lifecycle policies (consumed by the deletion collector)
// ============================================================================

/// Which entities a lifecycle policy covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppliesTo {
    /// Every entity.
    Any,
    /// Entities of one `type:` value.
    EntityType(String),
    /// Entities carrying a plain tag.
    HasTag(String),
}

impl AppliesTo {
    /// Whether an entity is covered.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            AppliesTo::Any => true,
            AppliesTo::EntityType(t) => entity.entity_type() == Some(t.as_str()),
            AppliesTo::HasTag(plain) => entity.tags.iter().any(|tag| &tag.plain() == plain),
        }
    }
}

/// Condition gating a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleCondition {
    /// Entity untouched for longer than this.
    IdleLongerThan(Duration),
    /// Tag history larger than this.
    TagCountExceeds(usize),
    /// Entity carries a plain tag.
    HasTag(String),
}

impl RuleCondition {
    /// Evaluate against an entity.
    pub fn met(&self, entity: &Entity, now: Timestamp) -> bool {
        match self {
            RuleCondition::IdleLongerThan(d) => now.since(entity.updated_at) > *d,
            RuleCondition::TagCountExceeds(n) => entity.tags.len() > *n,
            RuleCondition::HasTag(plain) => entity.tags.iter().any(|tag| &tag.plain() == plain),
        }
    }
}

/// One lifecycle transition rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRule {
    /// State the entity must currently be in.
    pub from_state: LifecycleState,
    /// State the transition moves it to.
    pub to_state: LifecycleState,
    /// Gate condition.
    pub condition: RuleCondition,
    /// Collector batch size for this rule.
    pub batch_size: usize,
    /// Disabled rules are kept but never fire.
    pub enabled: bool,
    /// Recorded with the transition for audit.
    pub reason: String,
}

/// A named, prioritized set of lifecycle rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Policy name, for logs and stats.
    pub name: String,
    /// Lower numbers evaluate first.
    pub priority: u32,
    /// Which entities this policy covers.
    pub applies_to: AppliesTo,
    /// Rules, evaluated in order.
    pub rules: Vec<LifecycleRule>,
}

impl RetentionPolicy {
    /// The first enabled rule whose from-state and condition match.
    pub fn first_matching_rule(&self, entity: &Entity, now: Timestamp) -> Option<&LifecycleRule> {
        if !self.applies_to.matches(entity) {
            return None;
        }
        let state = entity.lifecycle_state();
        self.rules
            .iter()
            .find(|r| r.enabled && r.from_state == state && r.condition.met(entity, now))
    }
}

/// Built-in lifecycle ladder: idle entities drift toward purge.
pub fn default_lifecycle_policies() -> Vec<RetentionPolicy> {
    vec![RetentionPolicy {
        name: "idle-lifecycle".to_string(),
        priority: 100,
        applies_to: AppliesTo::Any,
        rules: vec![
            LifecycleRule {
                from_state: LifecycleState::Active,
                to_state: LifecycleState::SoftDeleted,
                condition: RuleCondition::IdleLongerThan(Duration::from_secs(90 * 24 * 3600)),
                batch_size: 100,
                enabled: false,
                reason: "idle for 90 days".to_string(),
            },
            LifecycleRule {
                from_state: LifecycleState::SoftDeleted,
                to_state: LifecycleState::Archived,
                condition: RuleCondition::IdleLongerThan(Duration::from_secs(30 * 24 * 3600)),
                batch_size: 100,
                enabled: true,
                reason: "soft-deleted for 30 days".to_string(),
            },
            LifecycleRule {
                from_state: LifecycleState::Archived,
                to_state: LifecycleState::Purged,
                condition: RuleCondition::IdleLongerThan(Duration::from_secs(180 * 24 * 3600)),
                batch_size: 100,
                enabled: true,
                reason: "archived for 180 days".to_string(),
            },
        ],
    }]
}

/// The tag written to perform a transition.
pub fn transition_tag(to_state: LifecycleState, at: Timestamp) -> TemporalTag {
    TemporalTag::new(at, namespaces::LIFECYCLE, to_state.as_str())
}
