//! Repository persistence: create, read, filter, update and cascade delete.
//!
//! # Invariants
//! - Repository names are unique; collisions surface as `Validation`.
//! - Creating a repository also creates its empty, complete version 0 in the
//!   same transaction.
//! - Deleting a repository removes its versions, memberships, publications and
//!   every key/value attachment of the repository and its versions.

use crate::model::owner::{OwnerRef, OwnerType};
use crate::model::repository::{Repository, RepositoryId, RepositoryPatch};
use crate::repo::kv_repo::purge_owner;
use crate::repo::version_repo::insert_initial_version;
use crate::repo::{parse_uuid, RepoError, RepoResult};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row, Transaction, TransactionBehavior};
use uuid::Uuid;

const REPOSITORY_SELECT_SQL: &str = "SELECT
    id,
    name,
    description,
    last_content_added,
    next_version,
    created_at
FROM repositories";

const REPOSITORIES_DEFAULT_LIMIT: u32 = 10;
const REPOSITORIES_LIMIT_MAX: u32 = 100;

/// Filters for repository listing. All present filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryListQuery {
    /// Exact name match.
    pub name: Option<String>,
    /// Name must be one of these; ignored when empty.
    pub names_in: Vec<String>,
    /// `last_content_added` strictly greater than this epoch ms value.
    pub content_added_since: Option<i64>,
    /// Defaults to 10 and clamps to 100.
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Repository interface for repository rows.
pub trait RepositoryStore {
    fn create_repository(&self, name: &str, description: Option<&str>)
        -> RepoResult<Repository>;
    fn get_repository(&self, id: RepositoryId) -> RepoResult<Option<Repository>>;
    /// Lists repositories ordered by name.
    fn list_repositories(&self, query: &RepositoryListQuery) -> RepoResult<Vec<Repository>>;
    /// Returns whether another repository already uses `name`.
    fn name_in_use(&self, name: &str, exclude: Option<RepositoryId>) -> RepoResult<bool>;
    fn update_repository(
        &self,
        id: RepositoryId,
        patch: &RepositoryPatch,
    ) -> RepoResult<Repository>;
    fn delete_repository(&self, id: RepositoryId) -> RepoResult<()>;
}

/// SQLite-backed repository store.
pub struct SqliteRepositoryStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRepositoryStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn load_required(&self, id: RepositoryId) -> RepoResult<Repository> {
        self.get_repository(id)?
            .ok_or_else(|| RepoError::not_found("repository", id))
    }
}

impl RepositoryStore for SqliteRepositoryStore<'_> {
    fn create_repository(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> RepoResult<Repository> {
        let id = Uuid::new_v4();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        if name_in_use_in(&tx, name, None)? {
            return Err(duplicate_name(name));
        }
        tx.execute(
            "INSERT INTO repositories (id, name, description) VALUES (?1, ?2, ?3);",
            params![id.to_string(), name, description],
        )?;
        insert_initial_version(&tx, id)?;
        tx.commit()?;

        self.load_required(id)
    }

    fn get_repository(&self, id: RepositoryId) -> RepoResult<Option<Repository>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{REPOSITORY_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_repository_row(row)?));
        }
        Ok(None)
    }

    fn list_repositories(&self, query: &RepositoryListQuery) -> RepoResult<Vec<Repository>> {
        let mut sql = format!("{REPOSITORY_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(name) = query.name.as_ref() {
            sql.push_str(" AND name = ?");
            bind_values.push(Value::Text(name.clone()));
        }

        if !query.names_in.is_empty() {
            let placeholders = vec!["?"; query.names_in.len()].join(", ");
            sql.push_str(&format!(" AND name IN ({placeholders})"));
            bind_values.extend(query.names_in.iter().cloned().map(Value::Text));
        }

        if let Some(since) = query.content_added_since {
            sql.push_str(" AND last_content_added > ?");
            bind_values.push(Value::Integer(since));
        }

        sql.push_str(" ORDER BY name ASC");
        sql.push_str(" LIMIT ?");
        bind_values.push(Value::Integer(i64::from(normalize_repository_limit(
            query.limit,
        ))));
        if query.offset > 0 {
            sql.push_str(" OFFSET ?");
            bind_values.push(Value::Integer(i64::from(query.offset)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut repositories = Vec::new();
        while let Some(row) = rows.next()? {
            repositories.push(parse_repository_row(row)?);
        }
        Ok(repositories)
    }

    fn name_in_use(&self, name: &str, exclude: Option<RepositoryId>) -> RepoResult<bool> {
        name_in_use_in(self.conn, name, exclude)
    }

    fn update_repository(
        &self,
        id: RepositoryId,
        patch: &RepositoryPatch,
    ) -> RepoResult<Repository> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        if let Some(name) = patch.name.as_deref() {
            if name_in_use_in(&tx, name, Some(id))? {
                return Err(duplicate_name(name));
            }
        }

        let changed = tx.execute(
            "UPDATE repositories
             SET
                name = COALESCE(?2, name),
                description = CASE WHEN ?3 = 1 THEN ?4 ELSE description END
             WHERE id = ?1;",
            params![
                id.to_string(),
                patch.name.as_deref(),
                bool_to_int(patch.description.is_some()),
                patch.description.clone().flatten(),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("repository", id));
        }
        tx.commit()?;

        self.load_required(id)
    }

    fn delete_repository(&self, id: RepositoryId) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut owners = vec![OwnerRef::repository(id)];
        owners.extend(
            collect_ids(
                &tx,
                "SELECT id FROM repository_versions WHERE repository_id = ?1;",
                id,
                "repository_versions.id",
            )?
            .into_iter()
            .map(OwnerRef::repository_version),
        );
        owners.extend(
            collect_ids(
                &tx,
                "SELECT p.id
                 FROM publications p
                 INNER JOIN repository_versions v ON v.id = p.repository_version_id
                 WHERE v.repository_id = ?1;",
                id,
                "publications.id",
            )?
            .into_iter()
            .map(|publication_id| OwnerRef::new(OwnerType::Publication, publication_id)),
        );

        let changed = tx.execute("DELETE FROM repositories WHERE id = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("repository", id));
        }

        for owner in &owners {
            purge_owner(&tx, owner)?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Normalizes list limit according to repository listing contract.
pub fn normalize_repository_limit(limit: Option<u32>) -> u32 {
    match limit {
        Some(0) | None => REPOSITORIES_DEFAULT_LIMIT,
        Some(value) if value > REPOSITORIES_LIMIT_MAX => REPOSITORIES_LIMIT_MAX,
        Some(value) => value,
    }
}

fn name_in_use_in(conn: &Connection, name: &str, exclude: Option<RepositoryId>) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM repositories
            WHERE name = ?1 AND (?2 IS NULL OR id <> ?2)
        );",
        params![name, exclude.map(|value| value.to_string())],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn collect_ids(
    conn: &Connection,
    sql: &str,
    repository_id: RepositoryId,
    column: &str,
) -> RepoResult<Vec<Uuid>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([repository_id.to_string()])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let text: String = row.get(0)?;
        ids.push(parse_uuid(&text, column)?);
    }
    Ok(ids)
}

fn duplicate_name(name: &str) -> RepoError {
    RepoError::Validation(format!("repository name `{name}` is already in use"))
}

fn parse_repository_row(row: &Row<'_>) -> RepoResult<Repository> {
    let id_text: String = row.get("id")?;
    Ok(Repository {
        id: parse_uuid(&id_text, "repositories.id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        last_content_added: row.get("last_content_added")?,
        next_version: row.get("next_version")?,
        created_at: row.get("created_at")?,
    })
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_repository_limit;

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(normalize_repository_limit(None), 10);
        assert_eq!(normalize_repository_limit(Some(0)), 10);
        assert_eq!(normalize_repository_limit(Some(7)), 7);
        assert_eq!(normalize_repository_limit(Some(5000)), 100);
    }
}
