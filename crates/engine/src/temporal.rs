//! Temporal query engine
//!
//! Pure functions over an entity's immutable tag history. Nothing here
//! mutates state; every operation is a fold over the timestamp-ordered tag
//! sequence. Equal timestamps resolve by insertion order — the tag's
//! position in the entity's array.

use entitydb_core::{namespaces, Content, Entity, Error, Result, TemporalTag, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An entity reconstructed as of a past instant.
#[derive(Debug, Clone, PartialEq)]
pub struct AsOfView {
    /// The entity id.
    pub id: entitydb_core::EntityId,
    /// Latest tag per namespace with timestamp ≤ the query time.
    pub tags: Vec<TemporalTag>,
    /// Content visible at the query time.
    ///
    /// Only the latest content is retained, so the content is returned
    /// when its most recent write is at or before the query time — that
    /// is exactly what a reader at that instant saw. A later rewrite
    /// hides it.
    pub content: Content,
    /// The query time.
    pub as_of: Timestamp,
}

/// One side of a diff, labelled with the tag timestamp that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    /// Namespace of the changed tag.
    pub namespace: String,
    /// Value of the changed tag.
    pub value: String,
    /// The tag timestamp that caused the change.
    pub changed_at: Timestamp,
}

/// Difference between two as-of reconstructions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    /// Present at the later time, absent at the earlier.
    pub added: Vec<DiffEntry>,
    /// Present at the earlier time, absent at the later.
    pub removed: Vec<DiffEntry>,
}

impl TagDiff {
    /// True when the two instants agree.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Tag events of one entity after a cutoff.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChanges {
    /// The changed entity.
    pub id: entitydb_core::EntityId,
    /// Tags appended after the cutoff, in order.
    pub events: Vec<TemporalTag>,
}

/// Reconstruct an entity's state as of `at`.
pub fn as_of(entity: &Entity, at: Timestamp) -> AsOfView {
    let tags: Vec<TemporalTag> = entity.tags_as_of(at).into_iter().cloned().collect();
    let content = match entity.content_written_at() {
        Some(written) if written <= at => entity.content.clone(),
        _ => Content::Empty,
    };
    AsOfView {
        id: entity.id,
        tags,
        content,
        as_of: at,
    }
}

/// The ordered tag subsequence with timestamps in `[t0, t1]`.
///
/// Streaming callers pass a cancellation flag; it is checked between
/// records and aborts with `Transient` so a caller can distinguish
/// cancellation from completion.
pub fn history(
    entity: &Entity,
    t0: Timestamp,
    t1: Timestamp,
    cancel: &AtomicBool,
) -> Result<Vec<TemporalTag>> {
    let mut out = Vec::new();
    for tag in &entity.tags {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Transient("history walk cancelled".to_string()));
        }
        if tag.timestamp > t1 {
            break;
        }
        if tag.timestamp >= t0 {
            out.push(tag.clone());
        }
    }
    Ok(out)
}

/// Diff the entity between two instants.
///
/// Each entry carries the timestamp of the tag that caused it: an added
/// entry carries its own tag's timestamp; a removed entry carries the
/// timestamp of the superseding tag when one exists, else the later query
/// time.
pub fn diff(entity: &Entity, t1: Timestamp, t2: Timestamp) -> TagDiff {
    let (earlier, later) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
    let before = as_of(entity, earlier);
    let after = as_of(entity, later);

    let before_map: HashMap<(&str, &str), &TemporalTag> = before
        .tags
        .iter()
        .map(|t| ((t.namespace.as_str(), t.value.as_str()), t))
        .collect();
    let after_map: HashMap<(&str, &str), &TemporalTag> = after
        .tags
        .iter()
        .map(|t| ((t.namespace.as_str(), t.value.as_str()), t))
        .collect();
    let after_by_ns: HashMap<&str, &TemporalTag> = after
        .tags
        .iter()
        .map(|t| (t.namespace.as_str(), t))
        .collect();

    let mut result = TagDiff::default();
    for tag in &after.tags {
        if !before_map.contains_key(&(tag.namespace.as_str(), tag.value.as_str())) {
            result.added.push(DiffEntry {
                namespace: tag.namespace.clone(),
                value: tag.value.clone(),
                changed_at: tag.timestamp,
            });
        }
    }
    for tag in &before.tags {
        if !after_map.contains_key(&(tag.namespace.as_str(), tag.value.as_str())) {
            let changed_at = after_by_ns
                .get(tag.namespace.as_str())
                .map(|successor| successor.timestamp)
                .unwrap_or(later);
            result.removed.push(DiffEntry {
                namespace: tag.namespace.clone(),
                value: tag.value.clone(),
                changed_at,
            });
        }
    }
    result
}

/// Per-entity tag events after `since`, for entities updated after it.
pub fn recent_changes<'a>(
    entities: impl Iterator<Item = &'a Entity>,
    since: Timestamp,
) -> Vec<EntityChanges> {
    let mut out = Vec::new();
    for entity in entities {
        if entity.updated_at <= since {
            continue;
        }
        let events: Vec<TemporalTag> = entity
            .tags
            .iter()
            .filter(|t| t.timestamp > since)
            .cloned()
            .collect();
        if !events.is_empty() {
            out.push(EntityChanges {
                id: entity.id,
                events,
            });
        }
    }
    out
}

/// Never-cancelled flag for non-streaming callers.
pub fn no_cancel() -> AtomicBool {
    AtomicBool::new(false)
}

/// True when the namespace is engine-internal bookkeeping that as-of
/// consumers usually filter out.
pub fn is_bookkeeping_namespace(ns: &str) -> bool {
    ns == namespaces::CONTENT
}
