//! Repository domain model and patch validation.
//!
//! # Invariants
//! - `name` is non-empty after trimming and unique across repositories
//!   (uniqueness is enforced by storage).
//! - `next_version` only grows; version numbers are never reused.

use serde::{Deserialize, Deserializer, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type RepositoryId = Uuid;

const NAME_MAX_CHARS: usize = 255;

/// Named, versioned collection of content units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub description: Option<String>,
    /// Epoch ms of the last version that added content.
    pub last_content_added: Option<i64>,
    /// Number the next created version will receive.
    pub next_version: i64,
    pub created_at: i64,
}

/// Partial update for repository attributes.
///
/// `description: Some(None)` clears the description; `None` leaves it as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_option"
    )]
    pub description: Option<Option<String>>,
}

// A present `null` means "clear", which plain `Option<Option<_>>` would drop.
fn present_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl RepositoryPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }

    /// Returns a copy with the name trimmed, validating shape only.
    pub fn normalized(&self) -> Result<Self, RepositoryValidationError> {
        let name = match self.name.as_deref() {
            Some(value) => Some(normalize_repository_name(value)?),
            None => None,
        };
        Ok(Self {
            name,
            description: self.description.clone(),
        })
    }
}

/// Shape errors for repository input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryValidationError {
    EmptyName,
    NameTooLong(usize),
    EmptyPatch,
}

impl Display for RepositoryValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "repository name cannot be empty"),
            Self::NameTooLong(len) => write!(
                f,
                "repository name has {len} characters; at most {NAME_MAX_CHARS} allowed"
            ),
            Self::EmptyPatch => write!(f, "repository update has no fields"),
        }
    }
}

impl Error for RepositoryValidationError {}

/// Trims and checks a repository name.
pub fn normalize_repository_name(name: &str) -> Result<String, RepositoryValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RepositoryValidationError::EmptyName);
    }
    let len = trimmed.chars().count();
    if len > NAME_MAX_CHARS {
        return Err(RepositoryValidationError::NameTooLong(len));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::{normalize_repository_name, RepositoryPatch, RepositoryValidationError};

    #[test]
    fn name_is_trimmed_and_must_not_be_blank() {
        assert_eq!(normalize_repository_name("  repo-a ").unwrap(), "repo-a");
        assert_eq!(
            normalize_repository_name("   ").unwrap_err(),
            RepositoryValidationError::EmptyName
        );
    }

    #[test]
    fn patch_keeps_explicit_description_clear() {
        let patch = RepositoryPatch {
            name: None,
            description: Some(None),
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "description": null }));
        let back: RepositoryPatch = serde_json::from_value(json).unwrap();
        assert_eq!(back, patch);

        let untouched: RepositoryPatch = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(untouched.is_empty());
    }
}
