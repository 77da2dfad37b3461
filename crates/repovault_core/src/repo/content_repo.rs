//! Content unit catalogue persistence.
//!
//! # Invariants
//! - Content units are insert-only; rows are never updated.
//! - `content_type` is stored normalized (lowercase tag).

use crate::model::content::{normalize_content_type, ContentId, ContentSet, ContentUnit};
use crate::repo::{parse_uuid, RepoError, RepoResult};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

/// Repository interface for the content catalogue.
pub trait ContentRepository {
    /// Registers one new content unit of the given type.
    fn create_content(&self, content_type: &str) -> RepoResult<ContentUnit>;
    fn get_content(&self, id: ContentId) -> RepoResult<Option<ContentUnit>>;
    /// Returns the ids in `ids` that have no content row, in id order.
    fn missing_content(&self, ids: &ContentSet) -> RepoResult<Vec<ContentId>>;
}

/// SQLite-backed content catalogue.
pub struct SqliteContentRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteContentRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ContentRepository for SqliteContentRepository<'_> {
    fn create_content(&self, content_type: &str) -> RepoResult<ContentUnit> {
        let content_type = normalize_content_type(content_type).ok_or_else(|| {
            RepoError::Validation(format!("invalid content type `{content_type}`"))
        })?;
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO content_units (id, content_type) VALUES (?1, ?2);",
            params![id.to_string(), content_type],
        )?;
        self.get_content(id)?
            .ok_or_else(|| RepoError::not_found("content", id))
    }

    fn get_content(&self, id: ContentId) -> RepoResult<Option<ContentUnit>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, content_type, created_at FROM content_units WHERE id = ?1;",
        )?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_content_row(row)?));
        }
        Ok(None)
    }

    fn missing_content(&self, ids: &ContentSet) -> RepoResult<Vec<ContentId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT EXISTS(SELECT 1 FROM content_units WHERE id = ?1);")?;
        let mut missing = Vec::new();
        for id in ids {
            let exists: i64 = stmt.query_row([id.to_string()], |row| row.get(0))?;
            if exists == 0 {
                missing.push(*id);
            }
        }
        Ok(missing)
    }
}

fn parse_content_row(row: &Row<'_>) -> RepoResult<ContentUnit> {
    let id_text: String = row.get("id")?;
    Ok(ContentUnit {
        id: parse_uuid(&id_text, "content_units.id")?,
        content_type: row.get("content_type")?,
        created_at: row.get("created_at")?,
    })
}
