use repovault_core::db::open_db_in_memory;
use repovault_core::repo::content_repo::{ContentRepository, SqliteContentRepository};
use repovault_core::repo::publication_repo::{PublicationRepository, SqlitePublicationRepository};
use repovault_core::repo::repository_repo::{RepositoryStore, SqliteRepositoryStore};
use repovault_core::repo::version_repo::{
    ContentPage, ContentView, SqliteVersionRepository, VersionRepository,
};
use repovault_core::{ContentId, ContentSet, RepoError, Repository, VersionState};
use rusqlite::Connection;
use std::panic::{catch_unwind, AssertUnwindSafe};

fn setup() -> Connection {
    open_db_in_memory().unwrap()
}

fn create_repository(conn: &Connection, name: &str) -> Repository {
    SqliteRepositoryStore::new(conn)
        .create_repository(name, None)
        .unwrap()
}

fn register(conn: &Connection, count: usize) -> Vec<ContentId> {
    let catalogue = SqliteContentRepository::new(conn);
    (0..count)
        .map(|_| catalogue.create_content("file").unwrap().id)
        .collect()
}

fn set(ids: &[ContentId]) -> ContentSet {
    ids.iter().copied().collect()
}

#[test]
fn new_repository_starts_with_empty_complete_version_zero() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);

    let initial = versions.latest_version(repository.id).unwrap().unwrap();
    assert_eq!(initial.number, 0);
    assert_eq!(initial.state, VersionState::Complete);
    assert!(versions.content(&initial).unwrap().is_empty());
    assert!(versions.added(&initial).unwrap().is_empty());
    assert!(versions.removed(&initial).unwrap().is_empty());
    assert_eq!(repository.next_version, 1);
}

#[test]
fn versions_track_content_and_diffs_against_predecessor() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 3);
    let (c1, c2, c3) = (ids[0], ids[1], ids[2]);

    let v1 = versions
        .create_version(repository.id, &set(&[c1, c2]), &ContentSet::new())
        .unwrap();
    assert_eq!(v1.number, 1);
    assert_eq!(versions.content(&v1).unwrap(), set(&[c1, c2]));
    assert_eq!(versions.added(&v1).unwrap(), set(&[c1, c2]));
    assert!(versions.removed(&v1).unwrap().is_empty());

    let v2 = versions
        .create_version(repository.id, &set(&[c3]), &set(&[c1]))
        .unwrap();
    assert_eq!(v2.number, 2);
    assert_eq!(versions.content(&v2).unwrap(), set(&[c2, c3]));
    assert_eq!(versions.added(&v2).unwrap(), set(&[c3]));
    assert_eq!(versions.removed(&v2).unwrap(), set(&[c1]));

    // Earlier versions are immutable snapshots.
    assert_eq!(versions.content(&v1).unwrap(), set(&[c1, c2]));
    let numbers: Vec<i64> = versions
        .list_versions(repository.id)
        .unwrap()
        .iter()
        .map(|version| version.number)
        .collect();
    assert_eq!(numbers, vec![0, 1, 2]);
}

#[test]
fn adding_present_content_yields_empty_diff() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 1);

    versions
        .create_version(repository.id, &set(&ids), &ContentSet::new())
        .unwrap();
    let again = versions
        .create_version(repository.id, &set(&ids), &ContentSet::new())
        .unwrap();
    assert!(versions.added(&again).unwrap().is_empty());
    assert!(versions.removed(&again).unwrap().is_empty());
}

#[test]
fn create_version_rejects_unknown_content_and_absent_removals() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let known = register(&conn, 1);
    let ghost = uuid::Uuid::new_v4();

    let err = versions
        .create_version(repository.id, &set(&[ghost]), &ContentSet::new())
        .unwrap_err();
    match err {
        RepoError::Validation(message) => assert!(message.contains(&ghost.to_string())),
        other => panic!("unexpected error: {other}"),
    }

    let err = versions
        .create_version(repository.id, &ContentSet::new(), &set(&known))
        .unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)));

    // Rejected requests allocate nothing.
    let repository = SqliteRepositoryStore::new(&conn)
        .get_repository(repository.id)
        .unwrap()
        .unwrap();
    assert_eq!(repository.next_version, 1);
}

#[test]
fn last_content_added_moves_only_when_content_is_added() {
    let conn = setup();
    let store = SqliteRepositoryStore::new(&conn);
    let repository = create_repository(&conn, "repo-a");
    assert_eq!(repository.last_content_added, None);
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 1);

    versions
        .create_version(repository.id, &set(&ids), &ContentSet::new())
        .unwrap();
    let after_add = store.get_repository(repository.id).unwrap().unwrap();
    assert!(after_add.last_content_added.is_some());

    conn.execute(
        "UPDATE repositories SET last_content_added = 1 WHERE id = ?1;",
        [repository.id.to_string()],
    )
    .unwrap();
    versions
        .create_version(repository.id, &ContentSet::new(), &set(&ids))
        .unwrap();
    let after_remove = store.get_repository(repository.id).unwrap().unwrap();
    assert_eq!(after_remove.last_content_added, Some(1));
}

#[test]
fn failed_version_burns_its_number_and_stays_invisible() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 1);

    let building = versions.begin_version(repository.id).unwrap();
    assert_eq!(building.number, 1);
    assert_eq!(building.state, VersionState::Building);
    assert!(versions.get_version(repository.id, 1).unwrap().is_none());
    versions.fail_version(&building).unwrap();

    let next = versions
        .create_version(repository.id, &set(&ids), &ContentSet::new())
        .unwrap();
    assert_eq!(next.number, 2);
    assert!(versions.get_version(repository.id, 1).unwrap().is_none());
    assert_eq!(versions.predecessor(&next).unwrap().unwrap().number, 0);
    assert_eq!(versions.list_versions(repository.id).unwrap().len(), 2);
}

fn version_state(conn: &Connection, repository: &Repository, number: i64) -> String {
    conn.query_row(
        "SELECT state FROM repository_versions WHERE repository_id = ?1 AND number = ?2;",
        rusqlite::params![repository.id.to_string(), number],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn build_interrupted_by_panic_is_marked_failed() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 1);

    let unwound = catch_unwind(AssertUnwindSafe(|| {
        let build = versions.start_build(repository.id).unwrap();
        assert_eq!(build.version().number, 1);
        panic!("handler died mid-build");
    }));
    assert!(unwound.is_err());
    assert_eq!(version_state(&conn, &repository, 1), "failed");

    let next = versions
        .create_version(repository.id, &set(&ids), &ContentSet::new())
        .unwrap();
    assert_eq!(next.number, 2);
    assert_eq!(versions.predecessor(&next).unwrap().unwrap().number, 0);
}

#[test]
fn dropped_build_is_failed_and_completed_build_is_kept() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 1);

    drop(versions.start_build(repository.id).unwrap());
    assert_eq!(version_state(&conn, &repository, 1), "failed");

    let complete = versions
        .start_build(repository.id)
        .unwrap()
        .complete(&set(&ids), true)
        .unwrap();
    assert_eq!(complete.number, 2);
    assert_eq!(version_state(&conn, &repository, 2), "complete");
}

#[test]
fn abandoned_building_version_is_failed_by_next_build() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);

    // Left behind by a process that died without unwinding.
    versions.begin_version(repository.id).unwrap();
    let next = versions.begin_version(repository.id).unwrap();

    assert_eq!(next.number, 2);
    assert_eq!(version_state(&conn, &repository, 1), "failed");
    assert_eq!(version_state(&conn, &repository, 2), "building");
}

#[test]
fn completing_a_failed_version_is_a_conflict() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);

    let building = versions.begin_version(repository.id).unwrap();
    versions.fail_version(&building).unwrap();
    let err = versions
        .complete_version(&building, &ContentSet::new(), false)
        .unwrap_err();
    assert!(matches!(err, RepoError::Conflict(_)));
}

#[test]
fn deleting_a_middle_version_relinks_the_successor() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 3);
    let (c1, c2, c3) = (ids[0], ids[1], ids[2]);

    versions
        .create_version(repository.id, &set(&[c1, c2]), &ContentSet::new())
        .unwrap();
    let v2 = versions
        .create_version(repository.id, &set(&[c3]), &set(&[c1]))
        .unwrap();

    versions.delete_version(repository.id, 1).unwrap();

    assert!(versions.get_version(repository.id, 1).unwrap().is_none());
    assert_eq!(versions.predecessor(&v2).unwrap().unwrap().number, 0);
    assert_eq!(versions.added(&v2).unwrap(), set(&[c2, c3]));
    assert!(versions.removed(&v2).unwrap().is_empty());

    let v3 = versions
        .create_version(repository.id, &ContentSet::new(), &set(&[c2]))
        .unwrap();
    assert_eq!(v3.number, 3);
}

#[test]
fn delete_rejects_initial_latest_and_published_versions() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 2);

    let only = versions.delete_version(repository.id, 0).unwrap_err();
    assert!(matches!(only, RepoError::Conflict(_)));

    let v1 = versions
        .create_version(repository.id, &set(&ids[..1]), &ContentSet::new())
        .unwrap();
    versions
        .create_version(repository.id, &set(&ids[1..]), &ContentSet::new())
        .unwrap();

    let initial = versions.delete_version(repository.id, 0).unwrap_err();
    assert!(matches!(initial, RepoError::Conflict(_)));
    let latest = versions.delete_version(repository.id, 2).unwrap_err();
    assert!(matches!(latest, RepoError::Conflict(_)));

    SqlitePublicationRepository::new(&conn)
        .create_publication(v1.id)
        .unwrap();
    let published = versions.delete_version(repository.id, 1).unwrap_err();
    match published {
        RepoError::Conflict(message) => assert!(message.contains("publication")),
        other => panic!("unexpected error: {other}"),
    }

    let missing = versions.delete_version(repository.id, 42).unwrap_err();
    assert!(missing.is_not_found());
}

#[test]
fn content_views_paginate_in_id_order() {
    let conn = setup();
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 5);

    let v1 = versions
        .create_version(repository.id, &set(&ids), &ContentSet::new())
        .unwrap();
    let sorted: Vec<ContentId> = set(&ids).into_iter().collect();

    let page = versions
        .list_content(
            &v1,
            ContentView::All,
            &ContentPage {
                limit: Some(2),
                offset: 1,
            },
        )
        .unwrap();
    assert_eq!(page, sorted[1..3].to_vec());

    let added = versions
        .list_content(&v1, ContentView::Added, &ContentPage::default())
        .unwrap();
    assert_eq!(added, sorted);
    let removed = versions
        .list_content(&v1, ContentView::Removed, &ContentPage::default())
        .unwrap();
    assert!(removed.is_empty());

    let v2 = versions
        .create_version(repository.id, &ContentSet::new(), &set(&sorted[..2]))
        .unwrap();
    let removed = versions
        .list_content(&v2, ContentView::Removed, &ContentPage::default())
        .unwrap();
    assert_eq!(removed, sorted[..2].to_vec());
}

#[test]
fn deleting_a_repository_cascades_to_versions_and_attachments() {
    let conn = setup();
    let store = SqliteRepositoryStore::new(&conn);
    let repository = create_repository(&conn, "repo-a");
    let versions = SqliteVersionRepository::new(&conn);
    let ids = register(&conn, 1);
    let v1 = versions
        .create_version(repository.id, &set(&ids), &ContentSet::new())
        .unwrap();
    SqlitePublicationRepository::new(&conn)
        .create_publication(v1.id)
        .unwrap();
    conn.execute(
        "INSERT INTO kv_notes (owner_type, owner_id, key, value)
         VALUES ('repository_version', ?1, 'k', 'v');",
        [v1.id.to_string()],
    )
    .unwrap();

    store.delete_repository(repository.id).unwrap();

    assert!(store.get_repository(repository.id).unwrap().is_none());
    for table in ["repository_versions", "version_content", "publications", "kv_notes"] {
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0, "{table} still has rows");
    }
    // Content units outlive repositories.
    assert!(SqliteContentRepository::new(&conn)
        .get_content(ids[0])
        .unwrap()
        .is_some());
}
