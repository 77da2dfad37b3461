//! Generic key/value attachments over SQLite.
//!
//! # Responsibility
//! - Expose a mapping interface (`KeyValueMap`) over rows owned by any entity.
//! - Translate every mapping operation to a point or bulk query.
//!
//! # Invariants
//! - `(owner, key)` is unique per store kind.
//! - Nothing loads the whole mapping at once; iteration pages by key.
//! - Values are never logged.

use crate::model::owner::OwnerRef;
use crate::repo::{RepoError, RepoResult};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::VecDeque;

const PAGE_SIZE: u32 = 256;

/// Which of the three attachment stores a mapping targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Operator-authored configuration.
    Config,
    /// User-authored free-form notes.
    Notes,
    /// System-internal scratch data.
    Scratchpad,
}

impl StoreKind {
    pub const ALL: [StoreKind; 3] = [Self::Config, Self::Notes, Self::Scratchpad];

    fn table(self) -> &'static str {
        match self {
            Self::Config => "kv_config",
            Self::Notes => "kv_notes",
            Self::Scratchpad => "kv_scratchpad",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Notes => "notes",
            Self::Scratchpad => "scratchpad",
        }
    }
}

/// Lazy result stream yielded by mapping iteration.
pub type KeyValueStream<'a, T> = Box<dyn Iterator<Item = RepoResult<T>> + 'a>;

/// Mutable-mapping contract over one owner's attachments.
pub trait KeyValueMap {
    /// Returns the value for `key`, or `NotFound`.
    fn get(&self, key: &str) -> RepoResult<String>;
    /// Inserts or overwrites the value for `key`.
    fn set(&self, key: &str, value: &str) -> RepoResult<()>;
    /// Removes `key`, or fails with `NotFound`.
    fn delete(&self, key: &str) -> RepoResult<()>;
    fn contains(&self, key: &str) -> RepoResult<bool>;
    fn len(&self) -> RepoResult<usize>;
    fn is_empty(&self) -> RepoResult<bool> {
        Ok(self.len()? == 0)
    }
    /// Keys in ascending order, read from the store as iteration proceeds.
    fn keys(&self) -> KeyValueStream<'_, String>;
    fn values(&self) -> KeyValueStream<'_, String>;
    fn items(&self) -> KeyValueStream<'_, (String, String)>;
    /// Deletes every entry and returns how many were removed.
    fn clear(&self) -> RepoResult<usize>;
}

/// SQLite-backed mapping bound to one store kind and owner.
pub struct SqliteKeyValueMap<'conn> {
    conn: &'conn Connection,
    kind: StoreKind,
    owner: OwnerRef,
}

impl<'conn> SqliteKeyValueMap<'conn> {
    pub fn new(conn: &'conn Connection, kind: StoreKind, owner: OwnerRef) -> Self {
        Self { conn, kind, owner }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn owner(&self) -> OwnerRef {
        self.owner
    }

    fn pages(&self) -> KeyValuePages<'conn> {
        KeyValuePages {
            conn: self.conn,
            table: self.kind.table(),
            owner: self.owner,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl KeyValueMap for SqliteKeyValueMap<'_> {
    fn get(&self, key: &str) -> RepoResult<String> {
        let value = self
            .conn
            .query_row(
                &format!(
                    "SELECT value FROM {}
                     WHERE owner_type = ?1 AND owner_id = ?2 AND key = ?3;",
                    self.kind.table()
                ),
                params![self.owner.owner_type.as_tag(), self.owner.owner_id.to_string(), key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        value.ok_or_else(|| RepoError::not_found("key", key))
    }

    fn set(&self, key: &str, value: &str) -> RepoResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (owner_type, owner_id, key, value)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (owner_type, owner_id, key)
                 DO UPDATE SET value = excluded.value;",
                self.kind.table()
            ),
            params![
                self.owner.owner_type.as_tag(),
                self.owner.owner_id.to_string(),
                key,
                value
            ],
        )?;
        debug!(
            "event=kv_set module=kv status=ok store={} owner={}",
            self.kind.as_str(),
            self.owner
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> RepoResult<()> {
        let changed = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE owner_type = ?1 AND owner_id = ?2 AND key = ?3;",
                self.kind.table()
            ),
            params![self.owner.owner_type.as_tag(), self.owner.owner_id.to_string(), key],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("key", key));
        }
        Ok(())
    }

    fn contains(&self, key: &str) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            &format!(
                "SELECT EXISTS(
                    SELECT 1 FROM {}
                    WHERE owner_type = ?1 AND owner_id = ?2 AND key = ?3
                );",
                self.kind.table()
            ),
            params![self.owner.owner_type.as_tag(), self.owner.owner_id.to_string(), key],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn len(&self) -> RepoResult<usize> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE owner_type = ?1 AND owner_id = ?2;",
                self.kind.table()
            ),
            params![self.owner.owner_type.as_tag(), self.owner.owner_id.to_string()],
            |row| row.get(0),
        )?;
        usize::try_from(count)
            .map_err(|_| RepoError::InvalidData(format!("negative row count {count}")))
    }

    fn keys(&self) -> KeyValueStream<'_, String> {
        Box::new(self.pages().map(|entry| entry.map(|(key, _)| key)))
    }

    fn values(&self) -> KeyValueStream<'_, String> {
        Box::new(self.pages().map(|entry| entry.map(|(_, value)| value)))
    }

    fn items(&self) -> KeyValueStream<'_, (String, String)> {
        Box::new(self.pages())
    }

    fn clear(&self) -> RepoResult<usize> {
        let removed = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE owner_type = ?1 AND owner_id = ?2;",
                self.kind.table()
            ),
            params![self.owner.owner_type.as_tag(), self.owner.owner_id.to_string()],
        )?;
        Ok(removed)
    }
}

/// Keyset-paginated cursor over one owner's rows.
///
/// Each page is a fresh query starting after the last key seen, so the cursor
/// observes writes made between pages and never holds a statement open.
struct KeyValuePages<'conn> {
    conn: &'conn Connection,
    table: &'static str,
    owner: OwnerRef,
    after: Option<String>,
    buffer: VecDeque<(String, String)>,
    exhausted: bool,
}

impl KeyValuePages<'_> {
    fn fetch_page(&mut self) -> RepoResult<()> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT key, value FROM {}
             WHERE owner_type = ?1
               AND owner_id = ?2
               AND (?3 IS NULL OR key > ?3)
             ORDER BY key ASC
             LIMIT ?4;",
            self.table
        ))?;
        let mut rows = stmt.query(params![
            self.owner.owner_type.as_tag(),
            self.owner.owner_id.to_string(),
            self.after.as_deref(),
            PAGE_SIZE,
        ])?;
        let mut fetched = 0u32;
        while let Some(row) = rows.next()? {
            self.buffer.push_back((row.get(0)?, row.get(1)?));
            fetched += 1;
        }
        if fetched < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((key, _)) = self.buffer.back() {
            self.after = Some(key.clone());
        }
        Ok(())
    }
}

impl Iterator for KeyValuePages<'_> {
    type Item = RepoResult<(String, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Deletes every attachment of `owner` across all store kinds.
pub fn purge_owner(conn: &Connection, owner: &OwnerRef) -> RepoResult<usize> {
    let mut removed = 0;
    for kind in StoreKind::ALL {
        removed += conn.execute(
            &format!(
                "DELETE FROM {} WHERE owner_type = ?1 AND owner_id = ?2;",
                kind.table()
            ),
            params![owner.owner_type.as_tag(), owner.owner_id.to_string()],
        )?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::{KeyValueMap, SqliteKeyValueMap, StoreKind, PAGE_SIZE};
    use crate::db::open_db_in_memory;
    use crate::model::owner::OwnerRef;
    use uuid::Uuid;

    #[test]
    fn iteration_spans_multiple_pages_in_key_order() {
        let conn = open_db_in_memory().unwrap();
        let map = SqliteKeyValueMap::new(
            &conn,
            StoreKind::Scratchpad,
            OwnerRef::repository(Uuid::new_v4()),
        );
        let total = PAGE_SIZE as usize * 2 + 3;
        for idx in 0..total {
            map.set(&format!("k{idx:05}"), "v").unwrap();
        }

        let keys: Vec<String> = map.keys().collect::<Result<_, _>>().unwrap();
        assert_eq!(keys.len(), total);
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn iteration_observes_writes_made_between_pages() {
        let conn = open_db_in_memory().unwrap();
        let map = SqliteKeyValueMap::new(
            &conn,
            StoreKind::Config,
            OwnerRef::repository(Uuid::new_v4()),
        );
        for idx in 0..PAGE_SIZE {
            map.set(&format!("a{idx:05}"), "v").unwrap();
        }

        let mut keys = map.keys();
        assert_eq!(keys.next().unwrap().unwrap(), "a00000");
        map.set("zz-late", "v").unwrap();
        let rest: Vec<String> = keys.collect::<Result<_, _>>().unwrap();
        assert_eq!(rest.last().map(String::as_str), Some("zz-late"));
    }
}
