mod support;

use std::fs;
use std::sync::Arc;

use rusqlite::{params, Connection};
use serde_json::Map;
use sak::hasher::TaskKey;
use sak::log::record::{FIELD_KEY_DATA, FIELD_NAMESPACE, FIELD_STATUS};
use sak::{NamespaceHandle, TaskStatus};

use support::{Echo, EchoKind, TestStore, STORAGE};

fn raw_index(store: &TestStore) -> Connection {
    Connection::open(store.index_path()).unwrap()
}

#[test]
fn sync_mirrors_every_logged_key() {
    let mut store = TestStore::init();
    let (echo, _) = store.register_echo();

    let mut expected = Vec::new();
    for a in 0..10 {
        expected.push(store.write_log_key("echo", &Echo::new(a, "s")));
    }
    assert_eq!(echo.count_tasks().unwrap(), 0);

    let report = store.context().sync(STORAGE).unwrap();
    assert_eq!(report.changed, 10);
    assert_eq!(report.mirrored, 10);
    assert_eq!(report.unhealed, 0);

    let mut keys = echo.all_keys().unwrap();
    keys.sort();
    expected.sort();
    assert_eq!(keys, expected);

    let conn = raw_index(&store);
    for a in 0..10 {
        let fingerprint = TaskKey::from_params(&Echo::new(a, "s")).unwrap().fingerprint().to_string();
        let (status, hash): (String, Option<String>) = conn
            .query_row(
                "SELECT status, metadata_hash FROM sak_tasks WHERE key_hash = ?1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "PENDING");
        assert_eq!(hash, store.storage().log().content_hash(&fingerprint).unwrap());
        assert!(hash.is_some());

        let (col_a, col_b): (i64, String) = conn
            .query_row(
                "SELECT a, b FROM echo WHERE key_hash = ?1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((col_a, col_b.as_str()), (a, "s"));
    }

    let task = echo.get_task(&expected[3]).unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Pending);
}

#[test]
fn second_sync_only_sees_new_changes() {
    let mut store = TestStore::init();
    let (echo, _) = store.register_echo();

    store.write_log_key("echo", &Echo::new(1, "a"));
    let first = store.context().sync(STORAGE).unwrap();
    assert_eq!(first.changed, 1);
    assert_eq!(store.storage().last_synced_revision().unwrap(), first.to);

    let idle = store.context().sync(STORAGE).unwrap();
    assert_eq!(idle.changed, 0);

    let mut task = echo.task(Echo::new(2, "b")).unwrap();
    task.run(Map::new()).unwrap();
    let next = store.context().sync(STORAGE).unwrap();
    assert_eq!(next.changed, 1);
    assert_eq!(next.from, first.to);
    assert_eq!(echo.count_tasks().unwrap(), 2);
}

#[test]
fn rebuild_replays_whole_log() {
    let mut store = TestStore::init();
    store.register_echo();

    for a in 0..3 {
        store.write_log_key("echo", &Echo::new(a, "r"));
    }
    store.context().sync(STORAGE).unwrap();
    store.storage().rebuild().unwrap();

    let report = store.context().sync(STORAGE).unwrap();
    assert_eq!(report.from, None);
    assert_eq!(report.changed, 3);
}

#[test]
fn unregistered_namespace_is_skipped() {
    let mut store = TestStore::init();
    let (echo, _) = store.register_echo();

    store.write_log_key("elsewhere", &Echo::new(1, "u"));
    store.write_log_key("echo", &Echo::new(2, "u"));
    let report = store.context().sync(STORAGE).unwrap();
    assert_eq!(report.skipped_unknown, 1);
    assert_eq!(report.mirrored, 1);
    assert_eq!(echo.count_tasks().unwrap(), 1);
}

#[test]
fn missing_satellite_row_is_healed() {
    let mut store = TestStore::init();
    let (echo, _) = store.register_echo();

    let task = echo.task(Echo::new(1, "h")).unwrap();
    let fingerprint = task.fingerprint().to_string();
    store.context().sync(STORAGE).unwrap();

    let conn = raw_index(&store);
    conn.execute("DELETE FROM echo WHERE key_hash = ?1", params![fingerprint])
        .unwrap();
    drop(conn);

    let report = echo.resync_index().unwrap();
    assert_eq!(report.healed, 1);
    assert_eq!(report.unhealed, 0);

    let again = echo.resync_index().unwrap();
    assert_eq!(again.healed, 0);
    assert!(echo.get_task(&fingerprint).unwrap().is_some());
}

#[test]
fn dropped_log_key_is_removed_on_sync() {
    let mut store = TestStore::init();
    let (echo, _) = store.register_echo();

    let keep = echo.task(Echo::new(1, "k")).unwrap();
    let gone = echo.task(Echo::new(2, "k")).unwrap();
    store.context().sync(STORAGE).unwrap();
    assert_eq!(echo.count_tasks().unwrap(), 2);

    // another process removed the key from the log only
    store.storage().log().drop_key(gone.fingerprint()).unwrap();

    let report = store.context().sync(STORAGE).unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(echo.all_keys().unwrap(), vec![keep.fingerprint().to_string()]);
}

#[test]
fn corrupt_log_entries_are_skipped() {
    let mut store = TestStore::init();
    let (echo, _) = store.register_echo();

    let bad_status = "a".repeat(64);
    store.write_raw_fields(
        &bad_status,
        &[(FIELD_NAMESPACE, "\"echo\""), (FIELD_STATUS, "\"EXPLODED\"")],
    );
    let bad_params = "b".repeat(64);
    store.write_raw_fields(
        &bad_params,
        &[
            (FIELD_NAMESPACE, "\"echo\""),
            (FIELD_STATUS, "\"PENDING\""),
            (FIELD_KEY_DATA, "{\"unrelated\":true}"),
        ],
    );
    let good = store.write_log_key("echo", &Echo::new(1, "ok"));

    let report = store.context().sync(STORAGE).unwrap();
    assert_eq!(report.changed, 3);
    assert_eq!(report.skipped_corrupt, 2);
    assert_eq!(report.mirrored, 1);
    assert_eq!(echo.all_keys().unwrap(), vec![good]);
    assert_eq!(store.storage().last_synced_revision().unwrap(), report.to);
}

#[test]
fn deleted_index_is_rebuilt_from_log() {
    let mut store = TestStore::init();
    let (echo, _) = store.register_echo();

    for a in 0..5 {
        echo.task(Echo::new(a, "d")).unwrap();
    }
    store.context().sync(STORAGE).unwrap();
    store.storage().index().remove().unwrap();
    assert!(!store.index_path().exists());

    let report = store.context().sync(STORAGE).unwrap();
    assert_eq!(report.from, None);
    assert_eq!(report.mirrored, 5);
    assert_eq!(echo.count_tasks().unwrap(), 5);
}

#[test]
fn corrupt_index_file_is_recreated() {
    let mut store = TestStore::init();
    let (echo, _) = store.register_echo();
    for a in 0..3 {
        echo.task(Echo::new(a, "c")).unwrap();
    }
    store.context().sync(STORAGE).unwrap();

    let mut other = store.reopen();
    let reopened: Arc<dyn NamespaceHandle> = other
        .register_namespace(STORAGE, EchoKind::new())
        .unwrap();

    store.storage().index().remove().unwrap();
    fs::write(store.index_path(), b"definitely not a database").unwrap();

    let report = other.sync(STORAGE).unwrap();
    assert_eq!(report.from, None);
    assert_eq!(report.mirrored, 3);
    assert_eq!(report.unhealed, 0);
    assert_eq!(reopened.count_tasks().unwrap(), 3);
}
