//! Publication and distribution persistence.
//!
//! These rows exist so version deletion can tell whether a version is still
//! referenced downstream.
//!
//! # Invariants
//! - A publication always points at a complete version.
//! - Removing a publication detaches distributions instead of deleting them.

use crate::model::owner::{OwnerRef, OwnerType};
use crate::model::publication::{Distribution, DistributionId, Publication, PublicationId};
use crate::model::version::VersionId;
use crate::repo::kv_repo::purge_owner;
use crate::repo::{parse_uuid, RepoError, RepoResult};
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};
use uuid::Uuid;

/// Repository interface for publications and distributions.
pub trait PublicationRepository {
    fn create_publication(&self, version_id: VersionId) -> RepoResult<Publication>;
    fn get_publication(&self, id: PublicationId) -> RepoResult<Option<Publication>>;
    fn list_publications(&self, version_id: VersionId) -> RepoResult<Vec<Publication>>;
    fn delete_publication(&self, id: PublicationId) -> RepoResult<()>;
    fn create_distribution(
        &self,
        name: &str,
        publication_id: Option<PublicationId>,
    ) -> RepoResult<Distribution>;
    fn get_distribution(&self, id: DistributionId) -> RepoResult<Option<Distribution>>;
    fn delete_distribution(&self, id: DistributionId) -> RepoResult<()>;
}

/// SQLite-backed publication repository.
pub struct SqlitePublicationRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqlitePublicationRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl PublicationRepository for SqlitePublicationRepository<'_> {
    fn create_publication(&self, version_id: VersionId) -> RepoResult<Publication> {
        let complete: i64 = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM repository_versions WHERE id = ?1 AND state = 'complete'
            );",
            [version_id.to_string()],
            |row| row.get(0),
        )?;
        if complete == 0 {
            return Err(RepoError::not_found("repository version", version_id));
        }

        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO publications (id, repository_version_id) VALUES (?1, ?2);",
            params![id.to_string(), version_id.to_string()],
        )?;
        self.get_publication(id)?
            .ok_or_else(|| RepoError::not_found("publication", id))
    }

    fn get_publication(&self, id: PublicationId) -> RepoResult<Option<Publication>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, repository_version_id, created_at FROM publications WHERE id = ?1;",
        )?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_publication_row(row)?));
        }
        Ok(None)
    }

    fn list_publications(&self, version_id: VersionId) -> RepoResult<Vec<Publication>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, repository_version_id, created_at
             FROM publications
             WHERE repository_version_id = ?1
             ORDER BY created_at ASC, id ASC;",
        )?;
        let mut rows = stmt.query([version_id.to_string()])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_publication_row(row)?);
        }
        Ok(items)
    }

    fn delete_publication(&self, id: PublicationId) -> RepoResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM publications WHERE id = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("publication", id));
        }
        purge_owner(self.conn, &OwnerRef::new(OwnerType::Publication, id))?;
        Ok(())
    }

    fn create_distribution(
        &self,
        name: &str,
        publication_id: Option<PublicationId>,
    ) -> RepoResult<Distribution> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(RepoError::Validation(
                "distribution name cannot be empty".to_string(),
            ));
        }
        let taken: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM distributions WHERE name = ?1);",
            [trimmed],
            |row| row.get(0),
        )?;
        if taken == 1 {
            return Err(RepoError::Validation(format!(
                "distribution name `{trimmed}` is already in use"
            )));
        }
        if let Some(publication_id) = publication_id {
            if self.get_publication(publication_id)?.is_none() {
                return Err(RepoError::not_found("publication", publication_id));
            }
        }

        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO distributions (id, name, publication_id) VALUES (?1, ?2, ?3);",
            params![
                id.to_string(),
                trimmed,
                publication_id.map(|value| value.to_string())
            ],
        )?;
        self.get_distribution(id)?
            .ok_or_else(|| RepoError::not_found("distribution", id))
    }

    fn get_distribution(&self, id: DistributionId) -> RepoResult<Option<Distribution>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, publication_id, created_at FROM distributions WHERE id = ?1;",
        )?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_distribution_row(row)?));
        }
        Ok(None)
    }

    fn delete_distribution(&self, id: DistributionId) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let changed = tx.execute("DELETE FROM distributions WHERE id = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("distribution", id));
        }
        purge_owner(&tx, &OwnerRef::new(OwnerType::Distribution, id))?;
        tx.commit()?;
        Ok(())
    }
}

fn parse_publication_row(row: &Row<'_>) -> RepoResult<Publication> {
    let id_text: String = row.get("id")?;
    let version_text: String = row.get("repository_version_id")?;
    Ok(Publication {
        id: parse_uuid(&id_text, "publications.id")?,
        repository_version_id: parse_uuid(&version_text, "publications.repository_version_id")?,
        created_at: row.get("created_at")?,
    })
}

fn parse_distribution_row(row: &Row<'_>) -> RepoResult<Distribution> {
    let id_text: String = row.get("id")?;
    let publication_id = match row.get::<_, Option<String>>("publication_id")? {
        Some(text) => Some(parse_uuid(&text, "distributions.publication_id")?),
        None => None,
    };
    Ok(Distribution {
        id: parse_uuid(&id_text, "distributions.id")?,
        name: row.get("name")?,
        publication_id,
        created_at: row.get("created_at")?,
    })
}
