//! Repository use-case service.
//!
//! # Responsibility
//! - Validate mutation requests synchronously and enqueue them under the
//!   repository reservation key.
//! - Serve read paths (repositories, versions, content views, attachments)
//!   directly from storage.
//!
//! # Invariants
//! - Mutation entrypoints never modify repository state themselves; they
//!   return a [`TaskHandle`] and the worker applies the change.
//! - Validation here is best effort. Task handlers re-check authoritatively.

use crate::model::content::{ContentId, ContentSet, ContentUnit};
use crate::model::owner::OwnerRef;
use crate::model::publication::{Distribution, DistributionId, Publication, PublicationId};
use crate::model::repository::{
    normalize_repository_name, Repository, RepositoryId, RepositoryPatch,
    RepositoryValidationError,
};
use crate::model::task::{ReservationKey, TaskHandle};
use crate::model::version::RepositoryVersion;
use crate::queue::reservation::{SqliteTaskQueue, TaskQueue};
use crate::repo::content_repo::{ContentRepository, SqliteContentRepository};
use crate::repo::kv_repo::{SqliteKeyValueMap, StoreKind};
use crate::repo::publication_repo::{PublicationRepository, SqlitePublicationRepository};
use crate::repo::repository_repo::{RepositoryListQuery, RepositoryStore, SqliteRepositoryStore};
use crate::repo::version_repo::{
    ensure_version_deletable, ContentPage, ContentView, SqliteVersionRepository,
    VersionRepository,
};
use crate::repo::RepoError;
use crate::service::resolver::{ContentResolver, HrefContentResolver, ResolveError};
use crate::service::tasks::{
    AddAndRemoveArgs, DeleteDistributionArgs, DeleteRepositoryArgs, DeleteVersionArgs,
    UpdateRepositoryArgs, ADD_AND_REMOVE_TASK, DELETE_DISTRIBUTION_TASK, DELETE_REPOSITORY_TASK,
    DELETE_VERSION_TASK, UPDATE_REPOSITORY_TASK,
};
use log::{info, warn};
use rusqlite::Connection;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Request-path error for repository use-cases.
#[derive(Debug)]
pub enum ServiceError {
    /// Input is malformed or refers to something unusable.
    Validation(String),
    /// Request would break a version-chain invariant.
    Conflict(String),
    NotFound { entity: &'static str, id: String },
    /// Persistence-layer failure.
    Repo(RepoError),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "validation failed: {message}"),
            Self::Conflict(message) => write!(f, "conflict: {message}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Validation(message) => Self::Validation(message),
            RepoError::Conflict(message) => Self::Conflict(message),
            RepoError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Repo(other),
        }
    }
}

impl From<ResolveError> for ServiceError {
    fn from(value: ResolveError) -> Self {
        match value {
            ResolveError::InvalidReference(href) => {
                Self::Validation(format!("invalid reference: {href}"))
            }
            ResolveError::Repo(err) => err.into(),
        }
    }
}

impl From<RepositoryValidationError> for ServiceError {
    fn from(value: RepositoryValidationError) -> Self {
        Self::Validation(value.to_string())
    }
}

/// Use-case service for repositories and their versions.
pub struct RepositoryService<'conn> {
    conn: &'conn Connection,
    resolver: Box<dyn ContentResolver + 'conn>,
}

impl<'conn> RepositoryService<'conn> {
    /// Creates a service that resolves content hrefs against the catalogue.
    pub fn new(conn: &'conn Connection) -> Self {
        Self::with_resolver(conn, Box::new(HrefContentResolver::new(conn)))
    }

    pub fn with_resolver(conn: &'conn Connection, resolver: Box<dyn ContentResolver + 'conn>) -> Self {
        Self { conn, resolver }
    }

    /// Creates a repository together with its empty version 0.
    pub fn create_repository(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> ServiceResult<Repository> {
        let name = normalize_repository_name(name)?;
        let repository = self.repositories().create_repository(&name, description)?;
        info!(
            "event=repository_create module=service status=ok repository_id={}",
            repository.id
        );
        Ok(repository)
    }

    pub fn get_repository(&self, id: RepositoryId) -> ServiceResult<Repository> {
        self.repositories()
            .get_repository(id)?
            .ok_or_else(|| not_found("repository", id))
    }

    /// Lists repositories ordered by name.
    pub fn list_repositories(&self, query: &RepositoryListQuery) -> ServiceResult<Vec<Repository>> {
        Ok(self.repositories().list_repositories(query)?)
    }

    /// Validates a patch and enqueues `repository.update`.
    ///
    /// # Errors
    /// - `NotFound` when the repository does not exist.
    /// - `Validation` for an empty patch, a blank name or a name used by
    ///   another repository.
    pub fn update_repository(
        &self,
        id: RepositoryId,
        patch: &RepositoryPatch,
    ) -> ServiceResult<TaskHandle> {
        self.get_repository(id)?;
        if patch.is_empty() {
            return Err(RepositoryValidationError::EmptyPatch.into());
        }
        let patch = patch.normalized()?;
        if let Some(name) = patch.name.as_deref() {
            if self.repositories().name_in_use(name, Some(id))? {
                return Err(ServiceError::Validation(format!(
                    "repository name `{name}` is already in use"
                )));
            }
        }

        self.enqueue(
            ReservationKey::repository(id),
            UPDATE_REPOSITORY_TASK,
            &UpdateRepositoryArgs {
                repository_id: id,
                patch,
            },
        )
    }

    /// Enqueues `repository.delete` for an existing repository.
    pub fn delete_repository(&self, id: RepositoryId) -> ServiceResult<TaskHandle> {
        self.get_repository(id)?;
        self.enqueue(
            ReservationKey::repository(id),
            DELETE_REPOSITORY_TASK,
            &DeleteRepositoryArgs { repository_id: id },
        )
    }

    /// Resolves content hrefs and enqueues `repository.add_and_remove`.
    ///
    /// # Errors
    /// - `NotFound` when the repository does not exist.
    /// - `Validation` naming the first href that does not resolve.
    pub fn create_version<S: AsRef<str>>(
        &self,
        repository_id: RepositoryId,
        add_hrefs: &[S],
        remove_hrefs: &[S],
    ) -> ServiceResult<TaskHandle> {
        self.get_repository(repository_id)?;
        let add = self.resolve_all(add_hrefs)?;
        let remove = self.resolve_all(remove_hrefs)?;

        self.enqueue(
            ReservationKey::repository(repository_id),
            ADD_AND_REMOVE_TASK,
            &AddAndRemoveArgs {
                repository_id,
                add,
                remove,
            },
        )
    }

    /// Checks deletability and enqueues `repository.delete_version`.
    pub fn delete_version(
        &self,
        repository_id: RepositoryId,
        number: i64,
    ) -> ServiceResult<TaskHandle> {
        let version = self.get_version(repository_id, number)?;
        ensure_version_deletable(self.conn, &version)?;
        self.enqueue(
            ReservationKey::repository(repository_id),
            DELETE_VERSION_TASK,
            &DeleteVersionArgs {
                repository_id,
                number,
            },
        )
    }

    /// Complete versions in ascending number order.
    pub fn list_versions(
        &self,
        repository_id: RepositoryId,
    ) -> ServiceResult<Vec<RepositoryVersion>> {
        self.get_repository(repository_id)?;
        Ok(self.versions().list_versions(repository_id)?)
    }

    pub fn get_version(
        &self,
        repository_id: RepositoryId,
        number: i64,
    ) -> ServiceResult<RepositoryVersion> {
        self.versions()
            .get_version(repository_id, number)?
            .ok_or_else(|| not_found("repository version", format!("{repository_id}/{number}")))
    }

    pub fn latest_version(&self, repository_id: RepositoryId) -> ServiceResult<RepositoryVersion> {
        self.versions()
            .latest_version(repository_id)?
            .ok_or_else(|| not_found("repository", repository_id))
    }

    pub fn version_content(
        &self,
        repository_id: RepositoryId,
        number: i64,
        page: &ContentPage,
    ) -> ServiceResult<Vec<ContentId>> {
        self.content_view(repository_id, number, ContentView::All, page)
    }

    pub fn version_added(
        &self,
        repository_id: RepositoryId,
        number: i64,
        page: &ContentPage,
    ) -> ServiceResult<Vec<ContentId>> {
        self.content_view(repository_id, number, ContentView::Added, page)
    }

    pub fn version_removed(
        &self,
        repository_id: RepositoryId,
        number: i64,
        page: &ContentPage,
    ) -> ServiceResult<Vec<ContentId>> {
        self.content_view(repository_id, number, ContentView::Removed, page)
    }

    /// Operator configuration attached to `owner`.
    pub fn config(&self, owner: OwnerRef) -> SqliteKeyValueMap<'conn> {
        SqliteKeyValueMap::new(self.conn, StoreKind::Config, owner)
    }

    /// User notes attached to `owner`.
    pub fn notes(&self, owner: OwnerRef) -> SqliteKeyValueMap<'conn> {
        SqliteKeyValueMap::new(self.conn, StoreKind::Notes, owner)
    }

    /// System scratch data attached to `owner`.
    pub fn scratchpad(&self, owner: OwnerRef) -> SqliteKeyValueMap<'conn> {
        SqliteKeyValueMap::new(self.conn, StoreKind::Scratchpad, owner)
    }

    /// Adds an immutable content unit to the catalogue.
    pub fn register_content(&self, content_type: &str) -> ServiceResult<ContentUnit> {
        Ok(SqliteContentRepository::new(self.conn).create_content(content_type)?)
    }

    /// Publishes one complete version.
    pub fn publish_version(
        &self,
        repository_id: RepositoryId,
        number: i64,
    ) -> ServiceResult<Publication> {
        let version = self.get_version(repository_id, number)?;
        Ok(self.publications().create_publication(version.id)?)
    }

    pub fn create_distribution(
        &self,
        name: &str,
        publication_id: Option<PublicationId>,
    ) -> ServiceResult<Distribution> {
        Ok(self
            .publications()
            .create_distribution(name, publication_id)?)
    }

    pub fn get_distribution(&self, id: DistributionId) -> ServiceResult<Distribution> {
        self.publications()
            .get_distribution(id)?
            .ok_or_else(|| not_found("distribution", id))
    }

    /// Enqueues `distribution.delete` under the distribution's own
    /// reservation.
    pub fn delete_distribution(&self, id: DistributionId) -> ServiceResult<TaskHandle> {
        self.get_distribution(id)?;
        self.enqueue(
            ReservationKey::distribution(id),
            DELETE_DISTRIBUTION_TASK,
            &DeleteDistributionArgs {
                distribution_id: id,
            },
        )
    }

    fn content_view(
        &self,
        repository_id: RepositoryId,
        number: i64,
        view: ContentView,
        page: &ContentPage,
    ) -> ServiceResult<Vec<ContentId>> {
        let version = self.get_version(repository_id, number)?;
        Ok(self.versions().list_content(&version, view, page)?)
    }

    fn resolve_all<S: AsRef<str>>(&self, hrefs: &[S]) -> ServiceResult<ContentSet> {
        let mut ids = ContentSet::new();
        for href in hrefs {
            let href = href.as_ref();
            match self.resolver.resolve_content_ref(href) {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(err) => {
                    warn!(
                        "event=content_resolve module=service status=error error={}",
                        err
                    );
                    return Err(err.into());
                }
            }
        }
        Ok(ids)
    }

    fn enqueue<A: Serialize>(
        &self,
        key: ReservationKey,
        task_name: &str,
        args: &A,
    ) -> ServiceResult<TaskHandle> {
        let args = serde_json::to_value(args).map_err(|err| {
            ServiceError::Repo(RepoError::InvalidData(format!(
                "task arguments for `{task_name}` are not serializable: {err}"
            )))
        })?;
        Ok(SqliteTaskQueue::new(self.conn).reserve_and_run(key, task_name, &args)?)
    }

    fn repositories(&self) -> SqliteRepositoryStore<'conn> {
        SqliteRepositoryStore::new(self.conn)
    }

    fn versions(&self) -> SqliteVersionRepository<'conn> {
        SqliteVersionRepository::new(self.conn)
    }

    fn publications(&self) -> SqlitePublicationRepository<'conn> {
        SqlitePublicationRepository::new(self.conn)
    }
}

fn not_found(entity: &'static str, id: impl Display) -> ServiceError {
    ServiceError::NotFound {
        entity,
        id: id.to_string(),
    }
}
