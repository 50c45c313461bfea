//! Tag selectors
//!
//! `query()` takes a selector: a conjunction of tag requirements, each an
//! exact plain tag, a wildcard prefix (`rbac:perm:entity:*`), or a bare
//! namespace requirement (`status:`). Selectors resolve entirely through
//! index lookups — relationships between entities are tags too
//! (`rel:<kind>:<id>`), so traversals are just more selector queries.

use entitydb_core::tag::normalize_query_tag;
use entitydb_core::{EntityId, Error, Result};
use entitydb_storage::{ShardedTagIndex, TagVariantCache};
use rustc_hash::FxHashSet;

/// One requirement within a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagMatch {
    /// Exact plain tag (`status:open`).
    Exact(String),
    /// Any tag with the given prefix (`rbac:perm:entity:*` minus the star).
    Prefix(String),
}

impl TagMatch {
    /// Parse one requirement string. A trailing `*` makes it a prefix
    /// match; a numeric timestamp prefix is dropped.
    pub fn parse(s: &str) -> Result<TagMatch> {
        let plain = normalize_query_tag(s);
        if plain.is_empty() {
            return Err(Error::invalid_input("empty tag requirement".to_string()));
        }
        if let Some(prefix) = plain.strip_suffix('*') {
            if prefix.is_empty() {
                return Err(Error::invalid_input(
                    "a bare '*' would match every entity; name a prefix".to_string(),
                ));
            }
            Ok(TagMatch::Prefix(prefix.to_string()))
        } else {
            Ok(TagMatch::Exact(plain.to_string()))
        }
    }

    fn lookup(&self, index: &ShardedTagIndex, variants: &TagVariantCache) -> Vec<EntityId> {
        match self {
            TagMatch::Exact(tag) => {
                let mut seen: FxHashSet<EntityId> = FxHashSet::default();
                for variant in variants.variants_for(tag).iter() {
                    let key = TagVariantCache::index_key(variant);
                    seen.extend(index.lookup(key));
                }
                let mut out: Vec<EntityId> = seen.into_iter().collect();
                out.sort_unstable();
                out
            }
            TagMatch::Prefix(prefix) => index.lookup_prefix(prefix),
        }
    }
}

/// Conjunction of tag requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<TagMatch>,
}

impl Selector {
    /// Parse a selector from requirement strings; all must match.
    pub fn parse<S: AsRef<str>>(requirements: &[S]) -> Result<Selector> {
        let parsed: Result<Vec<TagMatch>> = requirements
            .iter()
            .map(|s| TagMatch::parse(s.as_ref()))
            .collect();
        Ok(Selector {
            requirements: parsed?,
        })
    }

    /// True when no requirement was given (matches nothing).
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Evaluate against the index: the sorted intersection of every
    /// requirement's result set.
    pub fn evaluate(
        &self,
        index: &ShardedTagIndex,
        variants: &TagVariantCache,
    ) -> Vec<EntityId> {
        let mut sets = self
            .requirements
            .iter()
            .map(|req| req.lookup(index, variants));

        let Some(first) = sets.next() else {
            return Vec::new();
        };
        let mut current: FxHashSet<EntityId> = first.into_iter().collect();
        for set in sets {
            let next: FxHashSet<EntityId> = set.into_iter().collect();
            current.retain(|id| next.contains(id));
            if current.is_empty() {
                break;
            }
        }
        let mut out: Vec<EntityId> = current.into_iter().collect();
        out.sort_unstable();
        out
    }
}
