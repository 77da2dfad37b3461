//! Polymorphic owner references for generic attachments.
//!
//! Key/value rows can hang off any entity. Instead of a runtime type lookup
//! the owner is an explicit `(type tag, id)` pair.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Closed set of entity kinds that can own attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    Repository,
    RepositoryVersion,
    Content,
    Publication,
    Distribution,
}

impl OwnerType {
    /// Stable tag persisted in `owner_type` columns.
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::RepositoryVersion => "repository_version",
            Self::Content => "content",
            Self::Publication => "publication",
            Self::Distribution => "distribution",
        }
    }

    pub fn from_tag(value: &str) -> Option<Self> {
        match value {
            "repository" => Some(Self::Repository),
            "repository_version" => Some(Self::RepositoryVersion),
            "content" => Some(Self::Content),
            "publication" => Some(Self::Publication),
            "distribution" => Some(Self::Distribution),
            _ => None,
        }
    }
}

/// Discriminated reference to the entity owning an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
}

impl OwnerRef {
    pub fn new(owner_type: OwnerType, owner_id: Uuid) -> Self {
        Self {
            owner_type,
            owner_id,
        }
    }

    pub fn repository(id: Uuid) -> Self {
        Self::new(OwnerType::Repository, id)
    }

    pub fn repository_version(id: Uuid) -> Self {
        Self::new(OwnerType::RepositoryVersion, id)
    }
}

impl Display for OwnerRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner_type.as_tag(), self.owner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{OwnerRef, OwnerType};
    use uuid::Uuid;

    #[test]
    fn owner_type_tags_round_trip() {
        for kind in [
            OwnerType::Repository,
            OwnerType::RepositoryVersion,
            OwnerType::Content,
            OwnerType::Publication,
            OwnerType::Distribution,
        ] {
            assert_eq!(OwnerType::from_tag(kind.as_tag()), Some(kind));
        }
        assert_eq!(OwnerType::from_tag("widget"), None);
    }

    #[test]
    fn owner_ref_displays_tag_and_id() {
        let id = Uuid::nil();
        let owner = OwnerRef::repository(id);
        assert_eq!(owner.to_string(), format!("repository:{id}"));
    }
}
