use super::*;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use punchcard_core::{collect_files, UpdaterConfig};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "punchcard-snapshot-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("must create parent");
    fs::write(path, contents).expect("must write file");
}

fn seed_install(root: &Path) {
    write(root, "backend/database/timeclock.sqlite", "rows-v1");
    write(root, "backend/.env", "APP_KEY=secret");
    write(root, "backend/config/app.json", "{\"tz\":\"UTC\"}");
    write(root, "backend/src/server.js", "listen(8080)");
    write(root, "backend/uploads/badge.png", "png");
    write(root, "frontend/index.html", "<h1>v1</h1>");
    write(root, "frontend/assets/app.js", "render()");
}

fn test_config(root: &Path, max_retained: usize) -> UpdaterConfig {
    let mut config = UpdaterConfig::from_toml_str(&format!(
        r#"
installed_version = "2.0.0"
install_root = "{}"
config_files = ["backend/config/app.json"]
critical_paths = ["backend/.env", "backend/uploads", "backend/certs"]

[registry]
owner = "acme"
repository = "timeclock"
"#,
        root.display()
    ))
    .expect("config must parse");
    config.backups.max_retained = max_retained;
    config
}

fn store(root: &Path, max_retained: usize) -> SnapshotStore {
    SnapshotStore::from_config(&test_config(root, max_retained)).expect("store must build")
}

fn live_tree(root: &Path) -> BTreeMap<PathBuf, String> {
    let mut tree = BTreeMap::new();
    for rel in collect_files(root).expect("must walk tree") {
        if rel.starts_with(".punchcard") {
            continue;
        }
        let contents = fs::read_to_string(root.join(&rel)).expect("must read file");
        tree.insert(rel, contents);
    }
    tree
}

#[test]
fn create_captures_every_entry_kind() {
    let root = test_root();
    seed_install(&root);
    let store = store(&root, 5);

    let summary = store.create_snapshot("before 2.1.0").expect("create must succeed");
    assert_eq!(summary.description, "before 2.1.0");
    assert_eq!(summary.app_version.as_deref(), Some("2.0.0"));

    let manifest = store.verify_snapshot(&summary.id).expect("must verify");
    let kinds = manifest
        .entries
        .iter()
        .map(|entry| (entry.kind, entry.stored.as_str()))
        .collect::<Vec<_>>();
    assert!(kinds.contains(&(EntryKind::DataStore, "data/timeclock.sqlite")));
    assert!(kinds.contains(&(EntryKind::Critical, "critical/backend/.env")));
    assert!(kinds.contains(&(EntryKind::Critical, "critical/backend/uploads")));
    assert!(kinds.contains(&(EntryKind::Config, "config/backend/config/app.json")));
    assert!(kinds.contains(&(EntryKind::AppRoot, "app/backend")));
    assert!(kinds.contains(&(EntryKind::AppRoot, "app/frontend")));

    let dir = store.layout().backup_dir(&summary.id);
    assert!(dir.join("app/backend/src/server.js").is_file());
    assert!(!dir.join("app/backend/.env").exists());
    assert!(!dir.join("app/backend/uploads").exists());
    assert!(!dir.join("app/backend/database/timeclock.sqlite").exists());
    assert!(!manifest.files.iter().any(|file| file.path == MANIFEST_FILE));
    assert_eq!(
        manifest.total_size,
        manifest.files.iter().map(|file| file.size).sum::<u64>()
    );

    let _ = fs::remove_dir_all(root);
}

#[test]
fn retention_keeps_most_recent_snapshots() {
    let root = test_root();
    seed_install(&root);
    let store = store(&root, 2);

    let a = store.create_snapshot("A").expect("A");
    let b = store.create_snapshot("B").expect("B");
    let c = store.create_snapshot("C").expect("C");

    let ids = store
        .list_snapshots()
        .expect("must list")
        .into_iter()
        .map(|summary| summary.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![c.id.clone(), b.id.clone()]);
    assert!(!store.layout().backup_dir(&a.id).exists());

    let _ = fs::remove_dir_all(root);
}

#[test]
fn retention_bound_holds_after_every_create() {
    for max_retained in 1..=4 {
        let root = test_root();
        seed_install(&root);
        let store = store(&root, max_retained);
        let mut created = Vec::new();

        for n in 0..max_retained + 3 {
            created.push(store.create_snapshot(&format!("create {n}")).expect("create").id);

            let listed = store
                .list_snapshots()
                .expect("must list")
                .into_iter()
                .map(|summary| summary.id)
                .collect::<Vec<_>>();
            let expected = created
                .iter()
                .rev()
                .take(max_retained)
                .cloned()
                .collect::<Vec<_>>();
            assert!(listed.len() <= max_retained);
            assert_eq!(listed, expected, "max {max_retained}, after create {n}");
        }

        let _ = fs::remove_dir_all(root);
    }
}

#[test]
fn pinned_snapshot_survives_eviction_and_delete_while_run_active() {
    let root = test_root();
    seed_install(&root);
    let store = store(&root, 1);
    let layout = store.layout().clone();

    let target = store.create_snapshot("before update").expect("target");
    store.pin(&target.id).expect("must pin");
    fs::create_dir_all(layout.run_dir()).expect("run dir");
    fs::write(layout.run_active_path(), "run-1\n").expect("marker");

    let manual = store.create_snapshot("manual backup").expect("manual");
    assert!(layout.backup_dir(&target.id).is_dir());
    assert!(layout.backup_dir(&manual.id).is_dir());

    let err = store
        .delete_snapshot(&target.id)
        .expect_err("rollback target must not be deleted");
    assert_eq!(err.kind(), "conflict_error");
    assert!(layout.backup_dir(&target.id).is_dir());

    fs::remove_file(layout.run_active_path()).expect("marker");
    assert_eq!(store.pinned_snapshot(), None);
    assert!(store.delete_snapshot(&target.id).expect("delete"));

    store.unpin(&target.id).expect("must unpin");
    assert!(!layout.pinned_snapshot_path().exists());

    let _ = fs::remove_dir_all(root);
}

#[test]
fn restore_returns_live_tree_to_snapshot_state() {
    let root = test_root();
    seed_install(&root);
    let store = store(&root, 5);
    let before = live_tree(&root);
    let summary = store.create_snapshot("pre-update").expect("must create");

    write(&root, "backend/database/timeclock.sqlite", "rows-v2");
    write(&root, "backend/.env", "APP_KEY=rotated");
    write(&root, "backend/config/app.json", "{\"tz\":\"CET\"}");
    write(&root, "backend/src/server.js", "listen(9090)");
    write(&root, "backend/src/new_route.js", "route()");
    write(&root, "frontend/index.html", "<h1>v2</h1>");
    fs::remove_file(root.join("frontend/assets/app.js")).expect("must remove");

    let report = store.restore_snapshot(&summary.id).expect("restore must succeed");
    assert_eq!(report.snapshot_id, summary.id);
    assert_eq!(live_tree(&root), before);

    let _ = fs::remove_dir_all(root);
}

#[test]
fn restore_of_damaged_snapshot_fails_without_touching_live_tree() {
    let root = test_root();
    seed_install(&root);
    let store = store(&root, 5);
    let summary = store.create_snapshot("pre-update").expect("must create");

    write(&root, "backend/database/timeclock.sqlite", "rows-v2");
    let after_update = live_tree(&root);

    let stored_data = store
        .layout()
        .backup_dir(&summary.id)
        .join("data/timeclock.sqlite");
    fs::write(&stored_data, "truncated").expect("must corrupt snapshot");

    let err = store
        .restore_snapshot(&summary.id)
        .expect_err("damaged snapshot must not restore");
    assert_eq!(err.kind(), "integrity_error");
    assert_eq!(live_tree(&root), after_update);

    let err = store
        .restore_snapshot("20990101T000000000000Z-0000-deadbeef")
        .expect_err("unknown snapshot must not restore");
    assert_eq!(err.kind(), "integrity_error");

    let _ = fs::remove_dir_all(root);
}

#[test]
fn missing_data_store_aborts_without_partial_snapshot() {
    let root = test_root();
    seed_install(&root);
    fs::remove_file(root.join("backend/database/timeclock.sqlite")).expect("must remove");
    let store = store(&root, 5);

    let err = store
        .create_snapshot("pre-update")
        .expect_err("create must fail");
    assert_eq!(err.kind(), "backup_error");

    let leftovers = fs::read_dir(store.layout().backups_dir())
        .expect("backups dir exists")
        .count();
    assert_eq!(leftovers, 0);

    let _ = fs::remove_dir_all(root);
}

#[test]
fn missing_critical_path_is_skipped() {
    let root = test_root();
    seed_install(&root);
    let store = store(&root, 5);

    let summary = store.create_snapshot("no certs yet").expect("must create");
    let manifest = store.verify_snapshot(&summary.id).expect("must verify");
    assert!(!manifest
        .entries
        .iter()
        .any(|entry| entry.source == "backend/certs"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn delete_is_idempotent() {
    let root = test_root();
    seed_install(&root);
    let store = store(&root, 5);
    let summary = store.create_snapshot("temp").expect("must create");

    assert!(store.delete_snapshot(&summary.id).expect("first delete"));
    assert!(!store.delete_snapshot(&summary.id).expect("second delete"));
    assert!(store.list_snapshots().expect("must list").is_empty());

    let err = store
        .delete_snapshot("../outside")
        .expect_err("path-like ids are rejected");
    assert_eq!(err.kind(), "backup_error");

    let _ = fs::remove_dir_all(root);
}

#[test]
fn list_skips_invalid_directories_and_sorts_newest_first() {
    let root = test_root();
    seed_install(&root);
    let store = store(&root, 5);

    let first = store.create_snapshot("first").expect("first");
    let second = store.create_snapshot("second").expect("second");
    fs::create_dir_all(store.layout().backups_dir().join("half-written"))
        .expect("must create stray dir");
    fs::write(store.layout().backups_dir().join("notes.txt"), "x").expect("must write stray file");

    let listed = store.list_snapshots().expect("must list");
    let ids = listed.iter().map(|s| s.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    assert!(listed[0].created_at >= listed[1].created_at);

    let _ = fs::remove_dir_all(root);
}

#[test]
fn snapshot_ids_are_unique_and_path_safe() {
    let now = chrono::Utc::now();
    let first = new_snapshot_id(now);
    let second = new_snapshot_id(now);
    assert_ne!(first, second);
    assert!(first.starts_with(&now.format("%Y%m%dT%H%M%S").to_string()));
    assert!(!first.contains('/'));
}
