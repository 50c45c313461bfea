//! The entity data model
//!
//! An entity is an id, an append-only sequence of temporal tags, and an
//! opaque content payload. `created_at` and `updated_at` are derived from
//! the earliest and latest tag timestamps, never stored independently of
//! them.
//!
//! Tag timestamps are monotonically non-decreasing within an entity; equal
//! timestamps are allowed and keep insertion order. Tags are immutable once
//! appended — the only removal path is retention trimming, which drops
//! strictly-older entries while preserving the newest tag per namespace.

use crate::content::Content;
use crate::error::{Error, Result};
use crate::id::EntityId;
use crate::tag::{namespaces, LifecycleState, TemporalTag, METRIC_ENTITY_TYPE};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Namespaces that must be present on every entity at creation.
pub const MANDATORY_NAMESPACES: [&str; 3] = [
    namespaces::TYPE,
    namespaces::DATASET,
    namespaces::CREATED_BY,
];

/// A single entity: id, temporal tag timeline, content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Immutable 32-character identifier.
    pub id: EntityId,
    /// Append-only temporal tag sequence, timestamp-ordered.
    pub tags: Vec<TemporalTag>,
    /// Opaque payload.
    pub content: Content,
    /// Earliest tag timestamp.
    pub created_at: Timestamp,
    /// Latest tag timestamp.
    pub updated_at: Timestamp,
}

impl Entity {
    /// Build an entity from an id and an initial tag set.
    ///
    /// Tags must already be timestamp-ordered (the writer assigns
    /// timestamps before calling this).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the tag list is empty or out of order.
    pub fn new(id: EntityId, tags: Vec<TemporalTag>, content: Content) -> Result<Self> {
        if tags.is_empty() {
            return Err(Error::invalid_input(
                "an entity must carry at least one tag".to_string(),
            ));
        }
        for pair in tags.windows(2) {
            if pair[1].timestamp < pair[0].timestamp {
                return Err(Error::invalid_input(format!(
                    "tag timestamps out of order: {} after {}",
                    pair[1].timestamp, pair[0].timestamp
                )));
            }
        }
        let created_at = tags[0].timestamp;
        let updated_at = tags[tags.len() - 1].timestamp;
        Ok(Entity {
            id,
            tags,
            content,
            created_at,
            updated_at,
        })
    }

    /// Append a tag, enforcing timestamp monotonicity.
    ///
    /// Equal timestamps are accepted and ordered after existing entries.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the tag's timestamp precedes the latest
    /// existing tag.
    pub fn append_tag(&mut self, tag: TemporalTag) -> Result<()> {
        if tag.timestamp < self.updated_at {
            return Err(Error::invalid_input(format!(
                "tag timestamp {} precedes entity's latest tag at {}",
                tag.timestamp, self.updated_at
            )));
        }
        self.updated_at = tag.timestamp;
        self.tags.push(tag);
        Ok(())
    }

    /// The latest tag in a namespace, if any.
    pub fn latest_in_namespace(&self, namespace: &str) -> Option<&TemporalTag> {
        self.tags.iter().rev().find(|t| t.namespace == namespace)
    }

    /// The latest tag per namespace at the current time, in first-seen
    /// namespace order.
    pub fn current_tags(&self) -> Vec<&TemporalTag> {
        collapse(&self.tags, Timestamp::MAX)
    }

    /// The latest tag per namespace with timestamp ≤ `at`.
    pub fn tags_as_of(&self, at: Timestamp) -> Vec<&TemporalTag> {
        collapse(&self.tags, at)
    }

    /// Namespaces that are mandatory but missing from this entity.
    pub fn missing_mandatory(&self) -> Vec<&'static str> {
        MANDATORY_NAMESPACES
            .iter()
            .copied()
            .filter(|ns| self.latest_in_namespace(ns).is_none())
            .collect()
    }

    /// Value of the latest `type:` tag.
    pub fn entity_type(&self) -> Option<&str> {
        self.latest_in_namespace(namespaces::TYPE)
            .map(|t| t.value.as_str())
    }

    /// Value of the latest `dataset:` tag.
    pub fn dataset(&self) -> Option<&str> {
        self.latest_in_namespace(namespaces::DATASET)
            .map(|t| t.value.as_str())
    }

    /// Current lifecycle state; entities with no `lifecycle:` tag are
    /// active.
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.latest_in_namespace(namespaces::LIFECYCLE)
            .and_then(|t| LifecycleState::from_str(&t.value))
            .unwrap_or(LifecycleState::Active)
    }

    /// True for engine-emitted metric entities.
    ///
    /// Identified by the reserved metric tag prefix or the metric entity
    /// type, so writes targeting them never themselves emit metrics.
    pub fn is_metric(&self) -> bool {
        self.entity_type() == Some(METRIC_ENTITY_TYPE) || self.tags.iter().any(|t| t.is_metric())
    }

    /// Timestamp of the latest content write, if the content was ever
    /// written.
    pub fn content_written_at(&self) -> Option<Timestamp> {
        self.latest_in_namespace(namespaces::CONTENT)
            .map(|t| t.timestamp)
    }

    /// Approximate heap footprint, used for cache byte accounting.
    pub fn heap_size(&self) -> usize {
        let tags: usize = self
            .tags
            .iter()
            .map(|t| t.namespace.capacity() + t.value.capacity() + std::mem::size_of::<TemporalTag>())
            .sum();
        std::mem::size_of::<Entity>() + tags + self.content.heap_size()
    }
}

/// Collapse a timestamp-ordered tag sequence to the latest entry per
/// namespace with timestamp ≤ `at`.
///
/// Equal timestamps resolve by insertion order: a later position wins.
/// Output preserves the order namespaces were first seen in.
fn collapse(tags: &[TemporalTag], at: Timestamp) -> Vec<&TemporalTag> {
    let mut latest: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for (idx, tag) in tags.iter().enumerate() {
        if tag.timestamp > at {
            break;
        }
        if latest.insert(tag.namespace.as_str(), idx).is_none() {
            order.push(tag.namespace.as_str());
        }
    }
    order
        .into_iter()
        .map(|ns| &tags[latest[ns]])
        .collect()
}
