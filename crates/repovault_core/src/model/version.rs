//! Repository version model and diff semantics.
//!
//! # Responsibility
//! - Describe the version lifecycle states.
//! - Compute `added`/`removed` as pure functions of two content sets.
//!
//! # Invariants
//! - Numbers are strictly increasing per repository and never reused.
//! - A complete version is never mutated; changes produce a new version.
//! - The predecessor of a version is the nearest complete version with a
//!   smaller number, so deleting an intermediate version relinks implicitly.

use crate::model::content::ContentSet;
use crate::model::repository::RepositoryId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type VersionId = Uuid;

/// Number given to the empty version created with every repository.
pub const INITIAL_VERSION_NUMBER: i64 = 0;

/// Lifecycle state of a repository version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    /// Content is still being computed; invisible to readers.
    Building,
    /// Durable and immutable.
    Complete,
    /// Construction aborted; the number stays burned.
    Failed,
}

impl VersionState {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "building" => Some(Self::Building),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Building)
    }
}

/// Immutable snapshot header; content is loaded separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryVersion {
    pub id: VersionId,
    pub repository_id: RepositoryId,
    pub number: i64,
    pub state: VersionState,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl RepositoryVersion {
    pub fn is_initial(&self) -> bool {
        self.number == INITIAL_VERSION_NUMBER
    }

    pub fn is_complete(&self) -> bool {
        self.state == VersionState::Complete
    }
}

/// Content in `current` that is absent from `predecessor`.
///
/// Without a predecessor everything counts as added.
pub fn added(current: &ContentSet, predecessor: Option<&ContentSet>) -> ContentSet {
    match predecessor {
        Some(previous) => current.difference(previous),
        None => current.clone(),
    }
}

/// Content in `predecessor` that is absent from `current`.
pub fn removed(current: &ContentSet, predecessor: Option<&ContentSet>) -> ContentSet {
    match predecessor {
        Some(previous) => previous.difference(current),
        None => ContentSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{added, removed, VersionState};
    use crate::model::content::ContentSet;
    use uuid::Uuid;

    #[test]
    fn initial_version_adds_everything_and_removes_nothing() {
        let content: ContentSet = [Uuid::new_v4(), Uuid::new_v4()].into_iter().collect();
        assert_eq!(added(&content, None), content);
        assert!(removed(&content, None).is_empty());
    }

    #[test]
    fn diff_reconstructs_current_from_predecessor() {
        let (c1, c2, c3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let previous: ContentSet = [c1, c2].into_iter().collect();
        let current: ContentSet = [c2, c3].into_iter().collect();

        let plus = added(&current, Some(&previous));
        let minus = removed(&current, Some(&previous));
        assert_eq!(plus, [c3].into_iter().collect());
        assert_eq!(minus, [c1].into_iter().collect());
        assert_eq!(previous.apply(&plus, &minus), current);
    }

    #[test]
    fn only_building_is_non_terminal() {
        assert!(!VersionState::Building.is_terminal());
        assert!(VersionState::Complete.is_terminal());
        assert!(VersionState::Failed.is_terminal());
        assert_eq!(VersionState::from_db("complete"), Some(VersionState::Complete));
        assert_eq!(VersionState::from_db("deleted"), None);
    }
}
