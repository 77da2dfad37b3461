//! Queued repository and distribution mutations.
//!
//! # Responsibility
//! - Define the argument payloads of every repository task.
//! - Execute the mutation on a worker connection.
//!
//! # Invariants
//! - Handlers re-check everything the request path validated; the repository
//!   may have changed between enqueue and execution.
//! - Handlers run while holding the reservation of the resource they mutate,
//!   so they never race another mutation of the same resource.

use crate::model::content::ContentSet;
use crate::model::publication::DistributionId;
use crate::model::repository::{RepositoryId, RepositoryPatch};
use crate::queue::registry::{RegistryError, TaskError, TaskOutput, TaskRegistry};
use crate::repo::publication_repo::{PublicationRepository, SqlitePublicationRepository};
use crate::repo::repository_repo::{RepositoryStore, SqliteRepositoryStore};
use crate::repo::version_repo::{SqliteVersionRepository, VersionRepository};
use log::info;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const UPDATE_REPOSITORY_TASK: &str = "repository.update";
pub const DELETE_REPOSITORY_TASK: &str = "repository.delete";
pub const ADD_AND_REMOVE_TASK: &str = "repository.add_and_remove";
pub const DELETE_VERSION_TASK: &str = "repository.delete_version";
pub const DELETE_DISTRIBUTION_TASK: &str = "distribution.delete";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRepositoryArgs {
    pub repository_id: RepositoryId,
    pub patch: RepositoryPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRepositoryArgs {
    pub repository_id: RepositoryId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAndRemoveArgs {
    pub repository_id: RepositoryId,
    #[serde(default)]
    pub add: ContentSet,
    #[serde(default)]
    pub remove: ContentSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteVersionArgs {
    pub repository_id: RepositoryId,
    pub number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDistributionArgs {
    pub distribution_id: DistributionId,
}

/// Registers every repository and distribution task handler.
pub fn register_repository_tasks(registry: &mut TaskRegistry) -> Result<(), RegistryError> {
    registry.register(UPDATE_REPOSITORY_TASK, update_repository)?;
    registry.register(DELETE_REPOSITORY_TASK, delete_repository)?;
    registry.register(ADD_AND_REMOVE_TASK, add_and_remove)?;
    registry.register(DELETE_VERSION_TASK, delete_version)?;
    registry.register(DELETE_DISTRIBUTION_TASK, delete_distribution)?;
    Ok(())
}

/// Applies a repository patch.
pub fn update_repository(conn: &Connection, args: &Value) -> TaskOutput {
    let args: UpdateRepositoryArgs = serde_json::from_value(args.clone())?;
    let patch = args
        .patch
        .normalized()
        .map_err(|err| TaskError::new(err.to_string()))?;
    let repository =
        SqliteRepositoryStore::new(conn).update_repository(args.repository_id, &patch)?;

    info!(
        "event=repository_update module=service status=ok repository_id={}",
        repository.id
    );
    Ok(serde_json::to_value(repository)?)
}

/// Deletes a repository with its versions, publications and attachments.
pub fn delete_repository(conn: &Connection, args: &Value) -> TaskOutput {
    let args: DeleteRepositoryArgs = serde_json::from_value(args.clone())?;
    SqliteRepositoryStore::new(conn).delete_repository(args.repository_id)?;

    info!(
        "event=repository_delete module=service status=ok repository_id={}",
        args.repository_id
    );
    Ok(json!({ "repository_id": args.repository_id }))
}

/// Creates a new version from the latest one plus `add` minus `remove`.
pub fn add_and_remove(conn: &Connection, args: &Value) -> TaskOutput {
    let args: AddAndRemoveArgs = serde_json::from_value(args.clone())?;
    let version = SqliteVersionRepository::new(conn).create_version(
        args.repository_id,
        &args.add,
        &args.remove,
    )?;
    Ok(serde_json::to_value(version)?)
}

/// Deletes one repository version.
pub fn delete_version(conn: &Connection, args: &Value) -> TaskOutput {
    let args: DeleteVersionArgs = serde_json::from_value(args.clone())?;
    SqliteVersionRepository::new(conn).delete_version(args.repository_id, args.number)?;
    Ok(json!({
        "repository_id": args.repository_id,
        "number": args.number,
    }))
}

/// Deletes a distribution and its attachments.
pub fn delete_distribution(conn: &Connection, args: &Value) -> TaskOutput {
    let args: DeleteDistributionArgs = serde_json::from_value(args.clone())?;
    SqlitePublicationRepository::new(conn).delete_distribution(args.distribution_id)?;

    info!(
        "event=distribution_delete module=service status=ok distribution_id={}",
        args.distribution_id
    );
    Ok(json!({ "distribution_id": args.distribution_id }))
}

#[cfg(test)]
mod tests {
    use super::{
        register_repository_tasks, AddAndRemoveArgs, ADD_AND_REMOVE_TASK, DELETE_DISTRIBUTION_TASK,
    };
    use crate::queue::registry::TaskRegistry;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn registers_all_repository_tasks_once() {
        let mut registry = TaskRegistry::new();
        register_repository_tasks(&mut registry).unwrap();
        assert_eq!(registry.len(), 5);
        assert!(registry.contains(ADD_AND_REMOVE_TASK));
        assert!(registry.contains(DELETE_DISTRIBUTION_TASK));
        assert!(register_repository_tasks(&mut registry).is_err());
    }

    #[test]
    fn add_and_remove_args_default_to_empty_sets() {
        let id = Uuid::new_v4();
        let args: AddAndRemoveArgs =
            serde_json::from_value(json!({ "repository_id": id })).unwrap();
        assert_eq!(args.repository_id, id);
        assert!(args.add.is_empty());
        assert!(args.remove.is_empty());
    }
}
