//! Content reference resolution.
//!
//! Clients name content by href. The resolver turns an href into a content
//! id and confirms the unit exists with the type the href claims.

use crate::model::content::ContentId;
use crate::repo::content_repo::{ContentRepository, SqliteContentRepository};
use crate::repo::RepoError;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

static CONTENT_HREF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[a-z][a-z0-9+.-]*://[^/]+)?/(?:api/v3/)?content/(?P<type>[a-z][a-z0-9_]*)/(?P<id>[0-9a-fA-F-]{36})/?$",
    )
    .expect("valid content href regex")
});

/// Resolution errors.
#[derive(Debug)]
pub enum ResolveError {
    /// Href is malformed or points at no matching content unit.
    InvalidReference(String),
    Repo(RepoError),
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidReference(href) => write!(f, "invalid reference: {href}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::InvalidReference(_) => None,
        }
    }
}

impl From<RepoError> for ResolveError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Maps a client-supplied reference to a content id.
pub trait ContentResolver {
    fn resolve_content_ref(&self, href: &str) -> Result<ContentId, ResolveError>;
}

/// Resolves `[scheme://host]/[api/v3/]content/<type>/<uuid>/` hrefs against
/// the content catalogue.
pub struct HrefContentResolver<'conn> {
    conn: &'conn Connection,
}

impl<'conn> HrefContentResolver<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ContentResolver for HrefContentResolver<'_> {
    fn resolve_content_ref(&self, href: &str) -> Result<ContentId, ResolveError> {
        let (content_type, id) =
            parse_content_href(href).ok_or_else(|| ResolveError::InvalidReference(href.to_string()))?;
        let unit = SqliteContentRepository::new(self.conn)
            .get_content(id)?
            .ok_or_else(|| ResolveError::InvalidReference(href.to_string()))?;
        if unit.content_type != content_type {
            return Err(ResolveError::InvalidReference(href.to_string()));
        }
        Ok(unit.id)
    }
}

/// Splits a content href into `(content type, id)` without touching storage.
pub fn parse_content_href(href: &str) -> Option<(String, Uuid)> {
    let captures = CONTENT_HREF_RE.captures(href.trim())?;
    let content_type = captures.name("type")?.as_str().to_string();
    let id = Uuid::parse_str(captures.name("id")?.as_str()).ok()?;
    Some((content_type, id))
}

/// Canonical href for a content unit.
pub fn content_href(content_type: &str, id: ContentId) -> String {
    format!("/api/v3/content/{content_type}/{id}/")
}

#[cfg(test)]
mod tests {
    use super::{content_href, parse_content_href};
    use uuid::Uuid;

    #[test]
    fn parses_relative_and_absolute_hrefs() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse_content_href(&content_href("file", id)),
            Some(("file".to_string(), id))
        );
        assert_eq!(
            parse_content_href(&format!("https://repo.example.com/content/rpm_package/{id}")),
            Some(("rpm_package".to_string(), id))
        );
    }

    #[test]
    fn rejects_foreign_paths() {
        let id = Uuid::new_v4();
        assert_eq!(parse_content_href(&format!("/api/v3/repositories/{id}/")), None);
        assert_eq!(parse_content_href("/api/v3/content/file/not-a-uuid/"), None);
        assert_eq!(parse_content_href("content/file/x"), None);
    }
}
