use super::*;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::anyhow;
use chrono::Utc;
use punchcard_core::{
    collect_files, CriticalPathSet, InstallLayout, ReleaseDescriptor, UpdaterConfig,
};
use punchcard_snapshot::SnapshotStore;
use rusqlite::Connection;
use semver::Version;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "punchcard-installer-tests-{}-{}-{}",
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

fn create_data_store(path: &Path) {
    fs::create_dir_all(path.parent().expect("parent")).expect("must create db dir");
    let conn = Connection::open(path).expect("must open db");
    conn.execute_batch(
        "CREATE TABLE punches (id INTEGER PRIMARY KEY, employee TEXT NOT NULL);
         INSERT INTO punches (employee) VALUES ('ada');",
    )
    .expect("must seed db");
}

const TARGETS: [&str; 10] = [
    "backend/src/m01.js",
    "backend/src/m02.js",
    "backend/src/m03.js",
    "backend/src/m04.js",
    "backend/src/m05.js",
    "frontend/p01.html",
    "frontend/p02.html",
    "frontend/p03.html",
    "frontend/p04.html",
    "frontend/p05.html",
];

struct Fixture {
    root: PathBuf,
    install: PathBuf,
    config: UpdaterConfig,
}

impl Fixture {
    fn new() -> Self {
        let root = test_root();
        let install = root.join("install");
        for target in TARGETS {
            write(&install, target, &format!("v1 {target}"));
        }
        write(&install, "backend/.env", "APP_KEY=secret");
        create_data_store(&install.join("backend/database/timeclock.sqlite"));

        let mut config = UpdaterConfig::from_toml_str(&format!(
            r#"
installed_version = "2.0.0"
install_root = "{}"
critical_paths = ["backend/.env"]

[registry]
owner = "acme"
repository = "timeclock"
"#,
            install.display()
        ))
        .expect("config must parse");
        config.transfer.min_artifact_bytes = 64;

        Self {
            root,
            install,
            config,
        }
    }

    fn layout(&self) -> InstallLayout {
        self.config.layout()
    }

    /// Builds `release.tar.gz` from a payload tree rooted at `payload/`.
    fn release_artifact(&self, files: &[(&str, &str)]) -> PathBuf {
        let payload = self.root.join("payload");
        for (rel, contents) in files {
            write(&payload, rel, contents);
        }
        let artifact = self.root.join("release.tar.gz");
        let status = Command::new("tar")
            .arg("-czf")
            .arg(&artifact)
            .arg("-C")
            .arg(&payload)
            .arg(".")
            .status()
            .expect("tar must run");
        assert!(status.success(), "tar must build fixture artifact");
        artifact
    }

    fn v2_artifact(&self) -> PathBuf {
        let mut files = TARGETS
            .iter()
            .map(|target| (*target, format!("v2 {target}")))
            .collect::<Vec<_>>();
        files.push(("backend/.env", "APP_KEY=from-release".to_string()));
        let borrowed = files
            .iter()
            .map(|(rel, contents)| (*rel, contents.as_str()))
            .collect::<Vec<_>>();
        self.release_artifact(&borrowed)
    }

    fn pipeline(&self, artifact: &Path) -> UpdatePipeline {
        UpdatePipeline::new(&self.config, Box::new(LocalFetcher::new(artifact)))
            .expect("pipeline must build")
    }

    fn live_tree(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        collect_files(&self.install)
            .expect("must walk live tree")
            .into_iter()
            .filter(|rel| !rel.starts_with(".punchcard"))
            .map(|rel| {
                let contents = fs::read(self.install.join(&rel)).expect("must read file");
                (rel, contents)
            })
            .collect()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn release(tag: &str) -> ReleaseDescriptor {
    ReleaseDescriptor {
        tag: tag.to_string(),
        name: format!("Timeclock {tag}"),
        notes: String::new(),
        published_at: None,
        artifact_url: format!("https://example.test/timeclock-{tag}.tar.gz"),
        artifact_size: None,
        artifact_sha256: None,
    }
}

struct LocalFetcher {
    source: PathBuf,
}

impl LocalFetcher {
    fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
        }
    }
}

impl ArtifactFetcher for LocalFetcher {
    fn fetch(&self, _url: &str, dst: &Path) -> anyhow::Result<u64> {
        Ok(fs::copy(&self.source, dst)?)
    }
}

/// Signals when a download starts and waits for permission to finish.
struct GatedFetcher {
    inner: LocalFetcher,
    started: Mutex<mpsc::Sender<()>>,
    proceed: Mutex<mpsc::Receiver<()>>,
}

impl ArtifactFetcher for GatedFetcher {
    fn fetch(&self, url: &str, dst: &Path) -> anyhow::Result<u64> {
        self.started
            .lock()
            .expect("started lock")
            .send(())
            .expect("test must listen");
        self.proceed
            .lock()
            .expect("proceed lock")
            .recv()
            .expect("test must release the download");
        self.inner.fetch(url, dst)
    }
}

/// Takes a manual backup while the run downloads, then loses the connection.
struct ManualBackupFetcher {
    store: SnapshotStore,
}

impl ArtifactFetcher for ManualBackupFetcher {
    fn fetch(&self, _url: &str, _dst: &Path) -> anyhow::Result<u64> {
        self.store.create_snapshot("manual backup")?;
        Err(anyhow!("connection reset"))
    }
}

/// Damages every stored snapshot mid-run, then loses the connection.
struct SnapshotDamagingFetcher {
    backups_dir: PathBuf,
}

impl ArtifactFetcher for SnapshotDamagingFetcher {
    fn fetch(&self, _url: &str, _dst: &Path) -> anyhow::Result<u64> {
        for entry in fs::read_dir(&self.backups_dir)? {
            fs::remove_file(entry?.path().join("manifest.json"))?;
        }
        Err(anyhow!("connection reset"))
    }
}

struct FailingProbe;

impl StoreProbe for FailingProbe {
    fn probe(&self, _data_store: &Path) -> anyhow::Result<()> {
        Err(anyhow!("database is locked"))
    }
}

struct FailingMigration;

impl Migration for FailingMigration {
    fn id(&self) -> &str {
        "add_break_columns"
    }

    fn run(&self, conn: &Connection, _ctx: &MigrationContext<'_>) -> anyhow::Result<()> {
        conn.execute_batch("ALTER TABLE missing_table ADD COLUMN break_minutes INTEGER;")?;
        Ok(())
    }
}

fn stages_of(report: &RunReport) -> Vec<PipelineStage> {
    report.stages.iter().map(|record| record.stage).collect()
}

fn history_versions(data_store: &Path) -> Vec<String> {
    let conn = Connection::open(data_store).expect("must open db");
    let mut stmt = conn
        .prepare("SELECT version FROM punchcard_update_history ORDER BY id")
        .expect("history table must exist");
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .expect("must query history");
    rows.map(|row| row.expect("row")).collect()
}

#[test]
fn successful_install_applies_release_and_protects_critical_paths() {
    let fixture = Fixture::new();
    let artifact = fixture.v2_artifact();
    let pipeline = fixture.pipeline(&artifact);

    let report = pipeline
        .install(&release("v2.1.0"), true)
        .expect("run must start");

    assert!(report.succeeded(), "{}", report.summary());
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        stages_of(&report),
        vec![
            PipelineStage::Snapshotting,
            PipelineStage::Downloading,
            PipelineStage::VerifyingArtifact,
            PipelineStage::Extracting,
            PipelineStage::Applying,
            PipelineStage::Migrating,
            PipelineStage::VerifyingSystem,
            PipelineStage::Completed,
        ]
    );
    assert_eq!(report.files_applied, TARGETS.len());
    assert_eq!(report.target_version, Version::new(2, 1, 0));
    assert!(report.artifact_sha256.as_deref().is_some_and(|sha| sha.len() == 64));
    assert!(report.migration_warnings.is_empty());

    for target in TARGETS {
        assert_eq!(
            fs::read_to_string(fixture.install.join(target)).expect("target"),
            format!("v2 {target}")
        );
    }
    assert_eq!(
        fs::read_to_string(fixture.install.join("backend/.env")).expect("env"),
        "APP_KEY=secret"
    );

    let data_store = fixture.config.data_store_path();
    assert_eq!(history_versions(&data_store), vec!["2.1.0".to_string()]);
    assert_eq!(
        fixture.config.effective_installed_version().expect("version"),
        Version::new(2, 1, 0)
    );

    let layout = fixture.layout();
    let snapshot_id = report.snapshot_id.clone().expect("snapshot recorded");
    assert!(layout.backup_dir(&snapshot_id).is_dir());
    assert!(!layout.run_tmp_dir(&report.run_id).exists());

    let status = pipeline.status().expect("status");
    assert!(!status.active);
    let current = status.current.expect("status file written");
    assert_eq!(current.stage, PipelineStage::Completed);
    assert_eq!(current.run_id, report.run_id);
    assert_eq!(current.snapshot_id, Some(snapshot_id));
}

#[test]
fn apply_failure_rolls_back_every_target_file() {
    let fixture = Fixture::new();
    fs::remove_file(fixture.install.join("backend/src/m04.js")).expect("must remove");
    write(&fixture.install, "backend/src/m04.js/keep.txt", "blocks the fourth file");
    let before = fixture.live_tree();

    let artifact = fixture.v2_artifact();
    let pipeline = fixture.pipeline(&artifact);
    let report = pipeline
        .install(&release("2.1.0"), true)
        .expect("run must start");

    match &report.outcome {
        RunOutcome::RolledBack { stage, cause } => {
            assert_eq!(*stage, PipelineStage::Applying);
            assert_eq!(cause.kind, "apply_error");
            assert!(cause.message.contains("applied 3 of"), "{}", cause.message);
        }
        other => panic!("expected rollback, got {other:?}"),
    }
    assert!(stages_of(&report).contains(&PipelineStage::RollingBack));
    assert_eq!(report.final_stage(), PipelineStage::Failed);
    assert_eq!(fixture.live_tree(), before);
    assert_eq!(
        fixture.config.effective_installed_version().expect("version"),
        Version::new(2, 0, 0)
    );
    assert!(!fixture.layout().run_tmp_dir(&report.run_id).exists());

    let current = pipeline
        .status()
        .expect("status")
        .current
        .expect("status file");
    assert_eq!(current.stage, PipelineStage::Failed);
    assert!(current.last_error.is_some());
}

#[test]
fn payload_outside_publishing_roots_is_never_applied() {
    let fixture = Fixture::new();
    write(&fixture.install, "VERSION", "2.0.0");
    fs::remove_file(fixture.install.join("backend/src/m04.js")).expect("must remove");
    write(&fixture.install, "backend/src/m04.js/keep.txt", "blocks the fourth file");
    let before = fixture.live_tree();

    let mut files = TARGETS
        .iter()
        .map(|target| (*target, format!("v2 {target}")))
        .collect::<Vec<_>>();
    files.push(("VERSION", "2.1.0".to_string()));
    let borrowed = files
        .iter()
        .map(|(rel, contents)| (*rel, contents.as_str()))
        .collect::<Vec<_>>();
    let artifact = fixture.release_artifact(&borrowed);

    let report = fixture
        .pipeline(&artifact)
        .install(&release("2.1.0"), true)
        .expect("run must start");
    match &report.outcome {
        RunOutcome::RolledBack { stage, cause } => {
            assert_eq!(*stage, PipelineStage::Applying);
            assert!(cause.message.contains("applied 3 of 11"), "{}", cause.message);
        }
        other => panic!("expected rollback, got {other:?}"),
    }
    assert_eq!(fixture.live_tree(), before);
    assert_eq!(
        fs::read_to_string(fixture.install.join("VERSION")).expect("version file"),
        "2.0.0"
    );

    fs::remove_dir_all(fixture.install.join("backend/src/m04.js")).expect("must unblock");
    write(&fixture.install, "backend/src/m04.js", "v1 backend/src/m04.js");
    let report = fixture
        .pipeline(&artifact)
        .install(&release("2.1.0"), true)
        .expect("run must start");
    assert!(report.succeeded(), "{}", report.summary());
    assert_eq!(report.files_applied, TARGETS.len());
    assert_eq!(
        fs::read_to_string(fixture.install.join("VERSION")).expect("version file"),
        "2.0.0"
    );
}

#[test]
fn manual_backup_during_run_cannot_evict_rollback_target() {
    let mut fixture = Fixture::new();
    fixture.config.backups.max_retained = 1;
    let before = fixture.live_tree();
    let fetcher = ManualBackupFetcher {
        store: SnapshotStore::from_config(&fixture.config).expect("store must build"),
    };
    let pipeline =
        UpdatePipeline::new(&fixture.config, Box::new(fetcher)).expect("pipeline must build");

    let report = pipeline
        .install(&release("2.1.0"), true)
        .expect("run must start");
    match &report.outcome {
        RunOutcome::RolledBack { stage, cause } => {
            assert_eq!(*stage, PipelineStage::Downloading);
            assert_eq!(cause.kind, "registry_error");
            assert!(cause.message.contains("connection reset"));
        }
        other => panic!("expected rollback, got {other:?}"),
    }
    assert_eq!(fixture.live_tree(), before);

    let layout = fixture.layout();
    let snapshot_id = report.snapshot_id.clone().expect("snapshot recorded");
    assert!(layout.backup_dir(&snapshot_id).is_dir());
    assert!(!layout.pinned_snapshot_path().exists());
}

#[test]
fn damaged_snapshot_ends_run_with_rollback_failure() {
    let fixture = Fixture::new();
    let fetcher = SnapshotDamagingFetcher {
        backups_dir: fixture.layout().backups_dir(),
    };
    let pipeline =
        UpdatePipeline::new(&fixture.config, Box::new(fetcher)).expect("pipeline must build");

    let report = pipeline
        .install(&release("2.1.0"), true)
        .expect("run must start");
    match &report.outcome {
        RunOutcome::RollbackFailed {
            stage,
            cause,
            rollback_error,
        } => {
            assert_eq!(*stage, PipelineStage::Downloading);
            assert_eq!(cause.kind, "registry_error");
            assert_eq!(rollback_error.kind, "rollback_error");
        }
        other => panic!("expected rollback failure, got {other:?}"),
    }
    assert!(!report.succeeded());
    assert_eq!(report.final_stage(), PipelineStage::Failed);
    assert!(stages_of(&report).contains(&PipelineStage::RollingBack));
    assert!(report.summary().contains("manual intervention required"));

    let status = pipeline.status().expect("status");
    assert!(!status.active);
    let current = status.current.expect("status file");
    assert_eq!(current.stage, PipelineStage::Failed);
    assert!(current
        .last_error
        .is_some_and(|error| error.contains("rollback error")));
}

#[test]
fn corrupt_artifact_never_touches_live_files() {
    let fixture = Fixture::new();
    let before = fixture.live_tree();

    let garbage = fixture.root.join("garbage.tar.gz");
    fs::write(&garbage, "this is not an archive ".repeat(16)).expect("must write garbage");
    let report = fixture
        .pipeline(&garbage)
        .install(&release("2.1.0"), true)
        .expect("run must start");
    assert!(matches!(
        report.outcome,
        RunOutcome::RolledBack {
            stage: PipelineStage::VerifyingArtifact,
            ..
        }
    ));
    assert_eq!(fixture.live_tree(), before);

    let artifact = fixture.v2_artifact();
    let bytes = fs::read(&artifact).expect("artifact bytes");
    let truncated = fixture.root.join("truncated.tar.gz");
    fs::write(&truncated, &bytes[..bytes.len() / 2]).expect("must write truncated");
    let report = fixture
        .pipeline(&truncated)
        .install(&release("2.1.0"), true)
        .expect("run must start");
    match &report.outcome {
        RunOutcome::RolledBack { stage, cause } => {
            assert_eq!(*stage, PipelineStage::VerifyingArtifact);
            assert_eq!(cause.kind, "integrity_error");
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }
    assert_eq!(fixture.live_tree(), before);
}

#[test]
fn digest_mismatch_is_an_integrity_failure() {
    let fixture = Fixture::new();
    let before = fixture.live_tree();
    let artifact = fixture.v2_artifact();

    let mut descriptor = release("2.1.0");
    descriptor.artifact_sha256 = Some("0".repeat(64));
    let report = fixture
        .pipeline(&artifact)
        .install(&descriptor, true)
        .expect("run must start");

    let cause = report.outcome.cause().expect("failure cause");
    assert_eq!(cause.kind, "integrity_error");
    assert!(cause.message.contains("sha256 mismatch"));
    assert_eq!(fixture.live_tree(), before);
}

#[test]
fn artifact_without_publishing_roots_is_rejected() {
    let fixture = Fixture::new();
    let before = fixture.live_tree();
    let artifact = fixture.release_artifact(&[
        ("docs/README.md", "# Timeclock"),
        ("docs/CHANGELOG.md", "## 2.1.0"),
    ]);

    let report = fixture
        .pipeline(&artifact)
        .install(&release("2.1.0"), true)
        .expect("run must start");
    match &report.outcome {
        RunOutcome::RolledBack { stage, cause } => {
            assert_eq!(*stage, PipelineStage::Extracting);
            assert!(cause.message.contains("publishing roots"));
        }
        other => panic!("expected structural mismatch, got {other:?}"),
    }
    assert_eq!(fixture.live_tree(), before);
}

#[test]
fn wrapped_source_archive_is_unwrapped() {
    let fixture = Fixture::new();
    let artifact = fixture.release_artifact(&[
        ("timeclock-2.1.0/frontend/p01.html", "wrapped page"),
        ("timeclock-2.1.0/backend/src/m01.js", "wrapped module"),
    ]);

    let report = fixture
        .pipeline(&artifact)
        .install(&release("2.1.0"), true)
        .expect("run must start");
    assert!(report.succeeded(), "{}", report.summary());
    assert_eq!(report.files_applied, 2);
    assert_eq!(
        fs::read_to_string(fixture.install.join("frontend/p01.html")).expect("page"),
        "wrapped page"
    );
}

#[test]
fn snapshot_failure_aborts_before_any_change() {
    let fixture = Fixture::new();
    fs::remove_file(fixture.config.data_store_path()).expect("must remove data store");
    let before = fixture.live_tree();
    let artifact = fixture.v2_artifact();

    let pipeline = fixture.pipeline(&artifact);
    let report = pipeline
        .install(&release("2.1.0"), true)
        .expect("run must start");
    match &report.outcome {
        RunOutcome::Aborted { cause } => assert_eq!(cause.kind, "backup_error"),
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(
        stages_of(&report),
        vec![PipelineStage::Snapshotting, PipelineStage::Failed]
    );
    assert!(report.snapshot_id.is_none());
    assert_eq!(fixture.live_tree(), before);
    assert!(!pipeline.status().expect("status").active);
}

#[test]
fn failed_system_verification_rolls_back() {
    let fixture = Fixture::new();
    let before = fixture.live_tree();
    let artifact = fixture.v2_artifact();

    let pipeline = fixture
        .pipeline(&artifact)
        .with_migrations(MigrationSet::new())
        .with_probe(Box::new(FailingProbe));
    let report = pipeline
        .install(&release("2.1.0"), true)
        .expect("run must start");

    match &report.outcome {
        RunOutcome::RolledBack { stage, cause } => {
            assert_eq!(*stage, PipelineStage::VerifyingSystem);
            assert!(cause.message.contains("database is locked"));
        }
        other => panic!("expected rollback, got {other:?}"),
    }
    assert_eq!(fixture.live_tree(), before);
}

#[test]
fn failing_migration_is_logged_and_not_fatal() {
    let fixture = Fixture::new();
    let artifact = fixture.v2_artifact();

    let pipeline = fixture
        .pipeline(&artifact)
        .with_migrations(MigrationSet::builtin().with(FailingMigration));
    let report = pipeline
        .install(&release("2.1.0"), true)
        .expect("run must start");

    assert!(report.succeeded(), "{}", report.summary());
    assert_eq!(report.migration_warnings.len(), 1);
    assert_eq!(report.migration_warnings[0].migration, "add_break_columns");
    assert_eq!(
        history_versions(&fixture.config.data_store_path()),
        vec!["2.1.0".to_string()]
    );

    let today = Utc::now().date_naive();
    let entries = punchcard_core::OpsLog::new(fixture.layout())
        .read_day(today)
        .expect("ops log");
    assert!(entries.iter().any(|entry| {
        entry.operation == "pipeline.migrate"
            && entry.level == punchcard_core::OpsLevel::Warn
            && entry.message.contains("add_break_columns")
    }));
}

#[test]
fn disabled_rollback_reports_rollback_skipped() {
    let mut fixture = Fixture::new();
    fixture.config.features.rollback = false;
    fs::remove_file(fixture.install.join("backend/src/m04.js")).expect("must remove");
    write(&fixture.install, "backend/src/m04.js/keep.txt", "blocks the fourth file");

    let artifact = fixture.v2_artifact();
    let report = fixture
        .pipeline(&artifact)
        .install(&release("2.1.0"), true)
        .expect("run must start");

    assert!(matches!(
        report.outcome,
        RunOutcome::RollbackSkipped {
            stage: PipelineStage::Applying,
            ..
        }
    ));
    assert!(report.summary().contains("rollback skipped"));
    assert!(!stages_of(&report).contains(&PipelineStage::RollingBack));
    assert_eq!(
        fs::read_to_string(fixture.install.join("backend/src/m01.js")).expect("m01"),
        "v2 backend/src/m01.js"
    );
}

#[test]
fn unconfirmed_install_is_refused_when_confirmation_required() {
    let fixture = Fixture::new();
    let artifact = fixture.v2_artifact();
    let pipeline = fixture.pipeline(&artifact);

    let err = pipeline
        .install(&release("2.1.0"), false)
        .expect_err("confirmation is required");
    assert_eq!(err.kind(), "config_error");
    assert!(pipeline
        .snapshots()
        .list_snapshots()
        .expect("list")
        .is_empty());
}

#[test]
fn second_install_during_active_run_is_a_conflict() {
    let fixture = Fixture::new();
    let artifact = fixture.v2_artifact();
    let (started_tx, started_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    let fetcher = GatedFetcher {
        inner: LocalFetcher::new(&artifact),
        started: Mutex::new(started_tx),
        proceed: Mutex::new(proceed_rx),
    };
    let pipeline = Arc::new(
        UpdatePipeline::new(&fixture.config, Box::new(fetcher)).expect("pipeline must build"),
    );

    let worker = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || pipeline.install(&release("2.1.0"), true))
    };
    started_rx.recv().expect("first run must reach download");

    let err = pipeline
        .install(&release("2.1.0"), true)
        .expect_err("same-process second run must conflict");
    assert_eq!(err.kind(), "conflict_error");

    let other_process = fixture.pipeline(&artifact);
    let err = other_process
        .install(&release("2.1.0"), true)
        .expect_err("marker must block a second pipeline");
    assert_eq!(err.kind(), "conflict_error");

    let status = pipeline.status().expect("status");
    assert!(status.active);
    assert_eq!(
        status.current.expect("status file").stage,
        PipelineStage::Downloading
    );

    proceed_tx.send(()).expect("worker must be waiting");
    let report = worker
        .join()
        .expect("worker must not panic")
        .expect("first run must start");
    assert!(report.succeeded(), "{}", report.summary());
    assert!(!pipeline.status().expect("status").active);
}

#[test]
fn stale_marker_from_finished_run_is_cleared() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    let now = Utc::now();
    let finished = RunState {
        run_id: "run-20261016T230000Z-0badf00d".to_string(),
        stage: PipelineStage::Completed,
        target_version: "2.0.0".to_string(),
        started_at: now,
        updated_at: now,
        snapshot_id: None,
        last_error: None,
    };
    write_run_state(&layout, &finished).expect("must seed status");
    fs::create_dir_all(layout.run_dir()).expect("run dir");
    fs::write(layout.run_active_path(), format!("{}\n", finished.run_id)).expect("marker");

    let guard = RunGuard::acquire(&layout, "run-next").expect("stale marker must be cleared");
    assert_eq!(guard.run_id(), "run-next");
    assert_eq!(
        read_active_marker(&layout).expect("marker"),
        Some("run-next".to_string())
    );
    guard.release().expect("must release");
    assert_eq!(read_active_marker(&layout).expect("marker"), None);

    let in_flight = RunState {
        run_id: "run-20261017T010000Z-00c0ffee".to_string(),
        stage: PipelineStage::Applying,
        ..finished
    };
    write_run_state(&layout, &in_flight).expect("must seed status");
    fs::write(layout.run_active_path(), format!("{}\n", in_flight.run_id)).expect("marker");
    let err = RunGuard::acquire(&layout, "run-late").expect_err("live marker must conflict");
    assert_eq!(err.kind(), "conflict_error");
    assert!(err.message().contains(&in_flight.run_id));
}

#[test]
fn maintenance_marker_is_stale_once_its_process_is_gone() {
    let fixture = Fixture::new();
    let layout = fixture.layout();
    fs::create_dir_all(layout.run_dir()).expect("run dir");

    fs::write(
        layout.run_active_path(),
        format!("restore-run-1\n{}\n", std::process::id()),
    )
    .expect("marker");
    let err = RunGuard::acquire(&layout, "run-next").expect_err("live holder must conflict");
    assert_eq!(err.kind(), "conflict_error");

    if !Path::new("/proc/self").exists() {
        return;
    }
    fs::write(layout.run_active_path(), "restore-run-2\n4294967294\n").expect("marker");
    let guard = RunGuard::acquire(&layout, "run-next").expect("dead holder must be cleared");
    assert_eq!(
        read_active_marker(&layout).expect("marker"),
        Some("run-next".to_string())
    );
    guard.release().expect("must release");
}

#[test]
fn archive_kind_is_detected_from_magic_bytes() {
    assert_eq!(
        detect_archive_kind(b"PK\x03\x04rest"),
        Some(ArchiveKind::Zip)
    );
    assert_eq!(
        detect_archive_kind(&[0x1f, 0x8b, 0x08, 0x00]),
        Some(ArchiveKind::TarGz)
    );
    assert_eq!(detect_archive_kind(b"<html>"), None);
    assert_eq!(detect_archive_kind(b""), None);
}

#[test]
fn undersized_artifact_is_rejected() {
    let root = test_root();
    let artifact = root.join("tiny.tar.gz");
    fs::write(&artifact, [0x1f, 0x8b, 0x08, 0x00]).expect("must write");

    let err = inspect_artifact(
        &artifact,
        &ArtifactExpectations {
            min_bytes: 1024,
            size: None,
            sha256: None,
        },
    )
    .expect_err("tiny artifact must fail");
    assert!(err.to_string().contains("below the 1024 byte minimum"));

    let err = inspect_artifact(
        &artifact,
        &ArtifactExpectations {
            min_bytes: 1,
            size: Some(52_341),
            sha256: None,
        },
    )
    .expect_err("size mismatch must fail");
    assert!(err.to_string().contains("declares 52341"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn protected_paths_cover_critical_data_store_and_state_dir() {
    let layout = InstallLayout::new("/srv/timeclock", "/srv/timeclock/.punchcard");
    let critical = CriticalPathSet::new(["backend/.env", "backend/storage/keys"]).expect("set");
    let protected = ProtectedPaths::new(
        &layout,
        critical,
        Path::new("/srv/timeclock/backend/database/timeclock.sqlite"),
    );

    assert!(protected.covers(Path::new("backend/.env")));
    assert!(protected.covers(Path::new("backend/storage/keys/app.pem")));
    assert!(protected.covers(Path::new("backend/database/timeclock.sqlite")));
    assert!(protected.covers(Path::new(".punchcard/backups/x/manifest.json")));
    assert!(!protected.covers(Path::new("backend/storage/keys-old/app.pem")));
    assert!(!protected.covers(Path::new("backend/src/server.js")));
}
