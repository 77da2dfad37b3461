//! Core of the repovault content-repository backend.
//! This crate is the single source of truth for version-chain invariants.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod queue;
pub mod repo;
pub mod service;

pub use config::{ConfigError, CoreConfig, WorkerSection};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, init_logging_from_config, logging_status};
pub use model::content::{ContentId, ContentSet, ContentUnit};
pub use model::owner::{OwnerRef, OwnerType};
pub use model::repository::{Repository, RepositoryId, RepositoryPatch};
pub use model::task::{ReservationKey, ResourceType, TaskHandle, TaskId, TaskRecord, TaskState};
pub use model::version::{RepositoryVersion, VersionId, VersionState};
pub use queue::registry::{TaskError, TaskOutput, TaskRegistry};
pub use queue::reservation::{wait_for_task, SqliteTaskQueue, TaskListQuery, TaskQueue};
pub use queue::worker::{drain, run_next, WorkerConfig, WorkerError, WorkerPool};
pub use repo::kv_repo::{KeyValueMap, SqliteKeyValueMap, StoreKind};
pub use repo::{RepoError, RepoResult};
pub use service::repository_service::{RepositoryService, ServiceError, ServiceResult};
pub use service::resolver::{ContentResolver, HrefContentResolver, ResolveError};
pub use service::tasks::register_repository_tasks;

/// Minimal health-check API.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Registry with every built-in repository task.
pub fn default_registry() -> Result<TaskRegistry, queue::registry::RegistryError> {
    let mut registry = TaskRegistry::new();
    register_repository_tasks(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::{core_version, default_registry, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }

    #[test]
    fn default_registry_knows_repository_tasks() {
        let registry = default_registry().unwrap();
        assert!(registry.contains("repository.add_and_remove"));
    }
}
