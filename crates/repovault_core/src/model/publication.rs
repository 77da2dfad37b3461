//! Downstream artifacts that pin a repository version.

use crate::model::version::VersionId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PublicationId = Uuid;
pub type DistributionId = Uuid;

/// Published rendering of one complete repository version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub id: PublicationId,
    pub repository_version_id: VersionId,
    pub created_at: i64,
}

/// Named serving point for a publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub id: DistributionId,
    pub name: String,
    /// Cleared when the publication goes away.
    pub publication_id: Option<PublicationId>,
    pub created_at: i64,
}
