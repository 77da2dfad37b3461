//! Repository version persistence and the version state machine.
//!
//! # Responsibility
//! - Allocate version numbers and drive `building -> complete|failed`.
//! - Compute content, `added` and `removed` views against the predecessor.
//! - Guard version deletion.
//!
//! # Invariants
//! - Number allocation and the `building` row are committed together; the
//!   counter is never rolled back, so failed numbers stay burned.
//! - Membership and the `complete` flag are committed in one transaction.
//! - Only `complete` versions are visible to read paths.
//! - A build that is dropped or unwinds before completing is marked failed;
//!   builds abandoned by a dead process are failed by the next
//!   `begin_version` on the same repository.
//! - Callers run mutations inside the repository's reservation; no other
//!   lost-update protection is attempted here.

use crate::model::content::{ContentId, ContentSet};
use crate::model::owner::OwnerRef;
use crate::model::repository::RepositoryId;
use crate::model::version::{
    added as diff_added, removed as diff_removed, RepositoryVersion, VersionId, VersionState,
    INITIAL_VERSION_NUMBER,
};
use crate::repo::content_repo::{ContentRepository, SqliteContentRepository};
use crate::repo::kv_repo::purge_owner;
use crate::repo::{parse_uuid, RepoError, RepoResult};
use log::{error, info, warn};
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};
use uuid::Uuid;

const VERSION_SELECT_SQL: &str = "SELECT
    id,
    repository_id,
    number,
    state,
    created_at
FROM repository_versions";

const CONTENT_PAGE_DEFAULT_LIMIT: u32 = 100;
const CONTENT_PAGE_LIMIT_MAX: u32 = 1000;

/// Which content listing of a version to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentView {
    /// Everything in the version.
    All,
    /// In this version, not in the predecessor.
    Added,
    /// In the predecessor, not in this version.
    Removed,
}

/// Pagination window for content listings, ordered by content id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentPage {
    /// Defaults to 100 and clamps to 1000.
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Repository interface for repository versions.
pub trait VersionRepository {
    /// Loads one complete version by number.
    fn get_version(
        &self,
        repository_id: RepositoryId,
        number: i64,
    ) -> RepoResult<Option<RepositoryVersion>>;
    /// Highest-numbered complete version.
    fn latest_version(&self, repository_id: RepositoryId)
        -> RepoResult<Option<RepositoryVersion>>;
    /// Complete versions in ascending number order.
    fn list_versions(&self, repository_id: RepositoryId) -> RepoResult<Vec<RepositoryVersion>>;
    /// Nearest complete version with a smaller number.
    fn predecessor(&self, version: &RepositoryVersion) -> RepoResult<Option<RepositoryVersion>>;
    fn content(&self, version: &RepositoryVersion) -> RepoResult<ContentSet>;
    fn added(&self, version: &RepositoryVersion) -> RepoResult<ContentSet>;
    fn removed(&self, version: &RepositoryVersion) -> RepoResult<ContentSet>;
    /// Paginated listing of one content view.
    fn list_content(
        &self,
        version: &RepositoryVersion,
        view: ContentView,
        page: &ContentPage,
    ) -> RepoResult<Vec<ContentId>>;
    /// Allocates the next number and inserts a `building` version.
    fn begin_version(&self, repository_id: RepositoryId) -> RepoResult<RepositoryVersion>;
    /// Persists membership and flips `building` to `complete` atomically.
    fn complete_version(
        &self,
        version: &RepositoryVersion,
        content: &ContentSet,
        content_added: bool,
    ) -> RepoResult<RepositoryVersion>;
    /// Marks a `building` version as failed.
    fn fail_version(&self, version: &RepositoryVersion) -> RepoResult<()>;
    /// Validates and builds `(latest - remove) + add` as a new version.
    fn create_version(
        &self,
        repository_id: RepositoryId,
        add: &ContentSet,
        remove: &ContentSet,
    ) -> RepoResult<RepositoryVersion>;
    /// Deletes one non-initial, non-latest, unpublished version.
    fn delete_version(&self, repository_id: RepositoryId, number: i64) -> RepoResult<()>;
}

/// SQLite-backed version repository.
pub struct SqliteVersionRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteVersionRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Starts a build that is failed automatically unless completed.
    pub fn start_build(&self, repository_id: RepositoryId) -> RepoResult<VersionBuild<'conn>> {
        let version = self.begin_version(repository_id)?;
        Ok(VersionBuild {
            conn: self.conn,
            version,
            armed: true,
        })
    }

    fn load_by_id(&self, id: VersionId) -> RepoResult<RepositoryVersion> {
        let mut stmt = self
            .conn
            .prepare(&format!("{VERSION_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        match rows.next()? {
            Some(row) => parse_version_row(row),
            None => Err(RepoError::not_found("repository version", id)),
        }
    }
}

impl VersionRepository for SqliteVersionRepository<'_> {
    fn get_version(
        &self,
        repository_id: RepositoryId,
        number: i64,
    ) -> RepoResult<Option<RepositoryVersion>> {
        find_complete_version(self.conn, repository_id, number)
    }

    fn latest_version(
        &self,
        repository_id: RepositoryId,
    ) -> RepoResult<Option<RepositoryVersion>> {
        latest_complete_version(self.conn, repository_id)
    }

    fn list_versions(&self, repository_id: RepositoryId) -> RepoResult<Vec<RepositoryVersion>> {
        let mut stmt = self.conn.prepare(&format!(
            "{VERSION_SELECT_SQL}
             WHERE repository_id = ?1 AND state = 'complete'
             ORDER BY number ASC;"
        ))?;
        let mut rows = stmt.query([repository_id.to_string()])?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next()? {
            versions.push(parse_version_row(row)?);
        }
        Ok(versions)
    }

    fn predecessor(&self, version: &RepositoryVersion) -> RepoResult<Option<RepositoryVersion>> {
        let mut stmt = self.conn.prepare(&format!(
            "{VERSION_SELECT_SQL}
             WHERE repository_id = ?1 AND state = 'complete' AND number < ?2
             ORDER BY number DESC
             LIMIT 1;"
        ))?;
        let mut rows = stmt.query(params![version.repository_id.to_string(), version.number])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_version_row(row)?));
        }
        Ok(None)
    }

    fn content(&self, version: &RepositoryVersion) -> RepoResult<ContentSet> {
        load_content_set(self.conn, version.id)
    }

    fn added(&self, version: &RepositoryVersion) -> RepoResult<ContentSet> {
        let current = self.content(version)?;
        let previous = match self.predecessor(version)? {
            Some(predecessor) => Some(self.content(&predecessor)?),
            None => None,
        };
        Ok(diff_added(&current, previous.as_ref()))
    }

    fn removed(&self, version: &RepositoryVersion) -> RepoResult<ContentSet> {
        let current = self.content(version)?;
        let previous = match self.predecessor(version)? {
            Some(predecessor) => Some(self.content(&predecessor)?),
            None => None,
        };
        Ok(diff_removed(&current, previous.as_ref()))
    }

    fn list_content(
        &self,
        version: &RepositoryVersion,
        view: ContentView,
        page: &ContentPage,
    ) -> RepoResult<Vec<ContentId>> {
        let predecessor_id = match view {
            ContentView::All => None,
            ContentView::Added | ContentView::Removed => self
                .predecessor(version)?
                .map(|predecessor| predecessor.id.to_string()),
        };

        // `version_id = NULL` matches nothing, which gives the right answer
        // for version 0: everything added, nothing removed.
        let (left, right) = match view {
            ContentView::All => (Some(version.id.to_string()), None),
            ContentView::Added => (Some(version.id.to_string()), predecessor_id),
            ContentView::Removed => (predecessor_id, Some(version.id.to_string())),
        };

        let mut stmt = self.conn.prepare(
            "SELECT content_id FROM version_content WHERE version_id = ?1
             EXCEPT
             SELECT content_id FROM version_content WHERE version_id = ?2
             ORDER BY content_id ASC
             LIMIT ?3 OFFSET ?4;",
        )?;
        let mut rows = stmt.query(params![
            left,
            right,
            normalize_content_limit(page.limit),
            page.offset
        ])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            ids.push(parse_uuid(&text, "version_content.content_id")?);
        }
        Ok(ids)
    }

    fn begin_version(&self, repository_id: RepositoryId) -> RepoResult<RepositoryVersion> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let next: Option<i64> = {
            let mut stmt = tx.prepare("SELECT next_version FROM repositories WHERE id = ?1;")?;
            let mut rows = stmt.query([repository_id.to_string()])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let number = next.ok_or_else(|| RepoError::not_found("repository", repository_id))?;

        // Builds run under the repository reservation, so any row still
        // building here belongs to a worker that died.
        let abandoned = tx.execute(
            "UPDATE repository_versions
             SET state = 'failed'
             WHERE repository_id = ?1 AND state = 'building';",
            [repository_id.to_string()],
        )?;
        if abandoned > 0 {
            warn!(
                "event=version_fail module=version status=ok repository_id={} abandoned={}",
                repository_id, abandoned
            );
        }

        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO repository_versions (id, repository_id, number, state)
             VALUES (?1, ?2, ?3, 'building');",
            params![id.to_string(), repository_id.to_string(), number],
        )?;
        tx.execute(
            "UPDATE repositories SET next_version = next_version + 1 WHERE id = ?1;",
            [repository_id.to_string()],
        )?;
        tx.commit()?;

        info!(
            "event=version_begin module=version status=ok repository_id={} number={}",
            repository_id, number
        );
        self.load_by_id(id)
    }

    fn complete_version(
        &self,
        version: &RepositoryVersion,
        content: &ContentSet,
        content_added: bool,
    ) -> RepoResult<RepositoryVersion> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO version_content (version_id, content_id) VALUES (?1, ?2);",
            )?;
            let version_id = version.id.to_string();
            for content_id in content {
                insert.execute(params![version_id, content_id.to_string()])?;
            }
        }

        if content_added {
            tx.execute(
                "UPDATE repositories
                 SET last_content_added = (strftime('%s', 'now') * 1000)
                 WHERE id = ?1;",
                [version.repository_id.to_string()],
            )?;
        }

        let changed = tx.execute(
            "UPDATE repository_versions
             SET state = 'complete'
             WHERE id = ?1 AND state = 'building';",
            [version.id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::Conflict(format!(
                "repository version {} is not building",
                version.id
            )));
        }
        tx.commit()?;

        info!(
            "event=version_complete module=version status=ok repository_id={} number={} content_count={}",
            version.repository_id,
            version.number,
            content.len()
        );
        self.load_by_id(version.id)
    }

    fn fail_version(&self, version: &RepositoryVersion) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM version_content WHERE version_id = ?1;",
            [version.id.to_string()],
        )?;
        let changed = tx.execute(
            "UPDATE repository_versions
             SET state = 'failed'
             WHERE id = ?1 AND state = 'building';",
            [version.id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::Conflict(format!(
                "repository version {} is not building",
                version.id
            )));
        }
        tx.commit()?;
        Ok(())
    }

    fn create_version(
        &self,
        repository_id: RepositoryId,
        add: &ContentSet,
        remove: &ContentSet,
    ) -> RepoResult<RepositoryVersion> {
        let latest = self.latest_version(repository_id)?.ok_or_else(|| {
            RepoError::not_found("repository", repository_id)
        })?;

        let missing = SqliteContentRepository::new(self.conn).missing_content(add)?;
        if !missing.is_empty() {
            return Err(RepoError::Validation(format!(
                "content does not exist: {}",
                join_ids(missing.iter())
            )));
        }

        let base = self.content(&latest)?;
        let absent = remove.difference(&base);
        if !absent.is_empty() {
            return Err(RepoError::Validation(format!(
                "content is not in repository version {}: {}",
                latest.number,
                join_ids(absent.iter())
            )));
        }

        let next_content = base.apply(add, remove);
        let content_added = !next_content.difference(&base).is_empty();

        self.start_build(repository_id)?
            .complete(&next_content, content_added)
    }

    fn delete_version(&self, repository_id: RepositoryId, number: i64) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let version = find_complete_version(&tx, repository_id, number)?.ok_or_else(|| {
            RepoError::not_found("repository version", format!("{repository_id}/{number}"))
        })?;
        ensure_version_deletable(&tx, &version)?;

        tx.execute(
            "DELETE FROM repository_versions WHERE id = ?1;",
            [version.id.to_string()],
        )?;
        purge_owner(&tx, &OwnerRef::repository_version(version.id))?;
        tx.commit()?;

        info!(
            "event=version_delete module=version status=ok repository_id={} number={}",
            repository_id, number
        );
        Ok(())
    }
}

/// Rejects deletion of the initial, latest, only, or published version.
/// A `building` version owned by the caller.
///
/// Dropping it without a successful [`VersionBuild::complete`] (including
/// during a panic) marks the version failed.
pub struct VersionBuild<'conn> {
    conn: &'conn Connection,
    version: RepositoryVersion,
    armed: bool,
}

impl VersionBuild<'_> {
    pub fn version(&self) -> &RepositoryVersion {
        &self.version
    }

    /// Persists membership and flips the version to `complete`.
    pub fn complete(
        mut self,
        content: &ContentSet,
        content_added: bool,
    ) -> RepoResult<RepositoryVersion> {
        let repo = SqliteVersionRepository::new(self.conn);
        match repo.complete_version(&self.version, content, content_added) {
            Ok(complete) => {
                self.armed = false;
                Ok(complete)
            }
            Err(err) => {
                error!(
                    "event=version_complete module=version status=error repository_id={} number={} error={}",
                    self.version.repository_id, self.version.number, err
                );
                Err(err)
            }
        }
    }
}

impl Drop for VersionBuild<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let repo = SqliteVersionRepository::new(self.conn);
        if let Err(err) = repo.fail_version(&self.version) {
            error!(
                "event=version_fail module=version status=error repository_id={} number={} error={}",
                self.version.repository_id, self.version.number, err
            );
        }
    }
}

pub fn ensure_version_deletable(conn: &Connection, version: &RepositoryVersion) -> RepoResult<()> {
    if version.number == INITIAL_VERSION_NUMBER {
        return Err(RepoError::Conflict(
            "the initial repository version cannot be deleted".to_string(),
        ));
    }

    let remaining: i64 = conn.query_row(
        "SELECT COUNT(*) FROM repository_versions
         WHERE repository_id = ?1 AND state = 'complete';",
        [version.repository_id.to_string()],
        |row| row.get(0),
    )?;
    if remaining <= 1 {
        return Err(RepoError::Conflict(
            "the only remaining repository version cannot be deleted".to_string(),
        ));
    }

    if let Some(latest) = latest_complete_version(conn, version.repository_id)? {
        if latest.id == version.id {
            return Err(RepoError::Conflict(format!(
                "repository version {} is the latest version",
                version.number
            )));
        }
    }

    let published: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM publications WHERE repository_version_id = ?1);",
        [version.id.to_string()],
        |row| row.get(0),
    )?;
    if published == 1 {
        return Err(RepoError::Conflict(format!(
            "repository version {} is referenced by a publication",
            version.number
        )));
    }

    Ok(())
}

/// Inserts the empty, complete version 0 for a freshly created repository.
pub(crate) fn insert_initial_version(
    conn: &Connection,
    repository_id: RepositoryId,
) -> RepoResult<VersionId> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO repository_versions (id, repository_id, number, state)
         VALUES (?1, ?2, ?3, 'complete');",
        params![id.to_string(), repository_id.to_string(), INITIAL_VERSION_NUMBER],
    )?;
    conn.execute(
        "UPDATE repositories SET next_version = ?2 WHERE id = ?1;",
        params![repository_id.to_string(), INITIAL_VERSION_NUMBER + 1],
    )?;
    Ok(id)
}

/// Normalizes content page limit.
pub fn normalize_content_limit(limit: Option<u32>) -> u32 {
    match limit {
        Some(0) | None => CONTENT_PAGE_DEFAULT_LIMIT,
        Some(value) if value > CONTENT_PAGE_LIMIT_MAX => CONTENT_PAGE_LIMIT_MAX,
        Some(value) => value,
    }
}

fn find_complete_version(
    conn: &Connection,
    repository_id: RepositoryId,
    number: i64,
) -> RepoResult<Option<RepositoryVersion>> {
    let mut stmt = conn.prepare(&format!(
        "{VERSION_SELECT_SQL}
         WHERE repository_id = ?1 AND number = ?2 AND state = 'complete';"
    ))?;
    let mut rows = stmt.query(params![repository_id.to_string(), number])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_version_row(row)?));
    }
    Ok(None)
}

fn latest_complete_version(
    conn: &Connection,
    repository_id: RepositoryId,
) -> RepoResult<Option<RepositoryVersion>> {
    let mut stmt = conn.prepare(&format!(
        "{VERSION_SELECT_SQL}
         WHERE repository_id = ?1 AND state = 'complete'
         ORDER BY number DESC
         LIMIT 1;"
    ))?;
    let mut rows = stmt.query([repository_id.to_string()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_version_row(row)?));
    }
    Ok(None)
}

fn load_content_set(conn: &Connection, version_id: VersionId) -> RepoResult<ContentSet> {
    let mut stmt = conn.prepare(
        "SELECT content_id FROM version_content WHERE version_id = ?1 ORDER BY content_id;",
    )?;
    let mut rows = stmt.query([version_id.to_string()])?;
    let mut content = ContentSet::new();
    while let Some(row) = rows.next()? {
        let text: String = row.get(0)?;
        content.insert(parse_uuid(&text, "version_content.content_id")?);
    }
    Ok(content)
}

fn parse_version_row(row: &Row<'_>) -> RepoResult<RepositoryVersion> {
    let id_text: String = row.get("id")?;
    let repository_text: String = row.get("repository_id")?;
    let state_text: String = row.get("state")?;
    let state = VersionState::from_db(&state_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid version state `{state_text}` in repository_versions.state"
        ))
    })?;

    Ok(RepositoryVersion {
        id: parse_uuid(&id_text, "repository_versions.id")?,
        repository_id: parse_uuid(&repository_text, "repository_versions.repository_id")?,
        number: row.get("number")?,
        state,
        created_at: row.get("created_at")?,
    })
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a ContentId>) -> String {
    ids.map(ContentId::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::normalize_content_limit;

    #[test]
    fn content_limit_defaults_and_clamps() {
        assert_eq!(normalize_content_limit(None), 100);
        assert_eq!(normalize_content_limit(Some(25)), 25);
        assert_eq!(normalize_content_limit(Some(100_000)), 1000);
    }
}
