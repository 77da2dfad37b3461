//! Content units and content sets.
//!
//! # Invariants
//! - A `ContentSet` never holds duplicates and iterates in id order.
//! - Content units are immutable; only membership in versions changes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::iter::FromIterator;
use uuid::Uuid;

/// Stable identifier of one content unit.
pub type ContentId = Uuid;

static CONTENT_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("valid content type regex"));

/// Lowercases and checks a content type tag; `None` when malformed.
pub fn normalize_content_type(value: &str) -> Option<String> {
    let normalized = value.trim().to_ascii_lowercase();
    if CONTENT_TYPE_RE.is_match(&normalized) {
        Some(normalized)
    } else {
        None
    }
}

/// One immutable piece of managed content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: ContentId,
    /// Short lowercase type tag such as `file`.
    pub content_type: String,
    /// Epoch milliseconds.
    pub created_at: i64,
}

/// Unordered set of content ids; iteration order is by id for determinism.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentSet(BTreeSet<ContentId>);

impl ContentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.0.contains(id)
    }

    pub fn insert(&mut self, id: ContentId) -> bool {
        self.0.insert(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentId> + '_ {
        self.0.iter()
    }

    /// Ids present in `self` but not in `other`.
    pub fn difference(&self, other: &ContentSet) -> ContentSet {
        self.0.difference(&other.0).copied().collect()
    }

    pub fn union(&self, other: &ContentSet) -> ContentSet {
        self.0.union(&other.0).copied().collect()
    }

    /// Computes `(self - remove) + add`, the content of a successor version.
    pub fn apply(&self, add: &ContentSet, remove: &ContentSet) -> ContentSet {
        self.difference(remove).union(add)
    }
}

impl FromIterator<ContentId> for ContentSet {
    fn from_iter<T: IntoIterator<Item = ContentId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ContentSet {
    type Item = ContentId;
    type IntoIter = std::collections::btree_set::IntoIter<ContentId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ContentSet {
    type Item = &'a ContentId;
    type IntoIter = std::collections::btree_set::Iter<'a, ContentId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
