use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, TryLockError};

use chrono::{DateTime, Utc};
use punchcard_core::{
    remove_path_if_exists, write_installed_marker, InstallLayout, OpsLog, ReleaseDescriptor,
    UpdateError, UpdateResult, UpdaterConfig,
};
use punchcard_snapshot::SnapshotStore;
use semver::Version;
use tracing::{info, warn};

use crate::apply::{apply_tree, ProtectedPaths};
use crate::archive::{extract_artifact, inspect_artifact, locate_payload_root, ArtifactExpectations};
use crate::fetch::{ArtifactFetcher, HttpFetcher};
use crate::migrate::{MigrationContext, MigrationSet, MigrationWarning};
use crate::run_state::{read_active_marker, read_run_state, write_run_state, RunGuard};
use crate::types::{
    FailureCause, PipelineStage, PipelineStatus, RunOutcome, RunReport, RunState, StageRecord,
};
use crate::verify::{verify_system, SqliteProbe, StoreProbe};

const ARTIFACT_FILE: &str = "artifact.download";
const EXTRACT_DIR: &str = "extract";

pub struct UpdatePipeline {
    config: UpdaterConfig,
    layout: InstallLayout,
    data_store: PathBuf,
    app_roots: Vec<PathBuf>,
    protected: ProtectedPaths,
    snapshots: SnapshotStore,
    fetcher: Box<dyn ArtifactFetcher>,
    probe: Box<dyn StoreProbe>,
    migrations: MigrationSet,
    log: OpsLog,
    run_lock: Mutex<()>,
}

struct StageFailure {
    stage: PipelineStage,
    error: UpdateError,
}

impl StageFailure {
    fn new(stage: PipelineStage, error: UpdateError) -> Self {
        Self { stage, error }
    }
}

/// Mutable bookkeeping for one run; every transition is mirrored to the
/// status file.
struct Run<'a> {
    layout: &'a InstallLayout,
    state: RunState,
    stages: Vec<StageRecord>,
    files_applied: usize,
    artifact_sha256: Option<String>,
    migration_warnings: Vec<MigrationWarning>,
}

impl Run<'_> {
    fn enter(&mut self, stage: PipelineStage) {
        let now = Utc::now();
        self.state.stage = stage;
        self.state.updated_at = now;
        self.stages.push(StageRecord {
            stage,
            entered_at: now,
        });
        info!(
            run_id = %self.state.run_id,
            stage = stage.as_str(),
            snapshot_id = self.state.snapshot_id.as_deref().unwrap_or("-"),
            "pipeline stage"
        );
        if let Err(err) = write_run_state(self.layout, &self.state) {
            warn!(run_id = %self.state.run_id, "failed to write run status: {err:#}");
        }
    }
}

impl UpdatePipeline {
    pub fn new(config: &UpdaterConfig, fetcher: Box<dyn ArtifactFetcher>) -> UpdateResult<Self> {
        config
            .effective_installed_version()
            .map_err(UpdateError::config)?;
        let critical = config.critical_path_set().map_err(UpdateError::config)?;
        let app_roots = config.app_root_paths().map_err(UpdateError::config)?;
        let layout = config.layout();
        let data_store = config.data_store_path();

        Ok(Self {
            protected: ProtectedPaths::new(&layout, critical, &data_store),
            snapshots: SnapshotStore::from_config(config)?,
            log: OpsLog::new(layout.clone()),
            config: config.clone(),
            layout,
            data_store,
            app_roots,
            fetcher,
            probe: Box::new(SqliteProbe),
            migrations: MigrationSet::builtin(),
            run_lock: Mutex::new(()),
        })
    }

    pub fn from_config(config: &UpdaterConfig) -> UpdateResult<Self> {
        let fetcher =
            HttpFetcher::new(&config.registry, &config.transfer).map_err(UpdateError::config)?;
        Self::new(config, Box::new(fetcher))
    }

    pub fn with_probe(mut self, probe: Box<dyn StoreProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_migrations(mut self, migrations: MigrationSet) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn status(&self) -> UpdateResult<PipelineStatus> {
        pipeline_status(&self.layout)
    }

    /// Runs one update end to end. Only a refused start (missing
    /// confirmation, conflict) is an `Err`; every stage failure is reported
    /// through the returned outcome.
    pub fn install(&self, release: &ReleaseDescriptor, confirmed: bool) -> UpdateResult<RunReport> {
        if self.config.features.require_confirmation && !confirmed {
            return Err(UpdateError::Config(
                "installing an update requires confirmation while require_confirmation is enabled"
                    .to_string(),
            ));
        }
        let from_version = self
            .config
            .effective_installed_version()
            .map_err(UpdateError::config)?;
        let target_version = release.version().map_err(UpdateError::registry)?;

        let _lock = match self.run_lock.try_lock() {
            Ok(lock) => lock,
            Err(TryLockError::WouldBlock) => {
                let err = UpdateError::Conflict(
                    "an update run is already in progress in this process".to_string(),
                );
                self.log.warn("pipeline.install", err.to_string());
                return Err(err);
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let run_id = new_run_id(Utc::now());
        let guard = RunGuard::acquire(&self.layout, &run_id).map_err(|err| {
            self.log.warn("pipeline.install", err.to_string());
            err
        })?;

        self.log.info(
            "pipeline.install",
            format!(
                "run {run_id} started: {from_version} -> {target_version} from {}",
                release.artifact_url
            ),
        );
        let report = self.execute(&run_id, release, &from_version, &target_version);
        if report.succeeded() {
            self.log.info("pipeline.install", report.summary());
        } else {
            self.log.error("pipeline.install", report.summary());
        }

        if let Err(err) = guard.release() {
            self.log.warn(
                "pipeline.install",
                format!("run {run_id} could not release its marker: {err:#}"),
            );
        }
        Ok(report)
    }

    fn execute(
        &self,
        run_id: &str,
        release: &ReleaseDescriptor,
        from_version: &Version,
        target_version: &Version,
    ) -> RunReport {
        let started_at = Utc::now();
        let mut run = Run {
            layout: &self.layout,
            state: RunState {
                run_id: run_id.to_string(),
                stage: PipelineStage::Idle,
                target_version: target_version.to_string(),
                started_at,
                updated_at: started_at,
                snapshot_id: None,
                last_error: None,
            },
            stages: Vec::new(),
            files_applied: 0,
            artifact_sha256: None,
            migration_warnings: Vec::new(),
        };

        run.enter(PipelineStage::Snapshotting);
        let expected_critical = self.present_critical_paths();
        let description = format!("before update {from_version} -> {target_version}");
        let outcome = match self.snapshots.create_snapshot(&description) {
            Err(err) => {
                run.state.last_error = Some(err.to_string());
                run.enter(PipelineStage::Failed);
                RunOutcome::Aborted {
                    cause: FailureCause::from(&err),
                }
            }
            Ok(snapshot) => {
                run.state.snapshot_id = Some(snapshot.id.clone());
                if let Err(err) = self.snapshots.pin(&snapshot.id) {
                    self.log.warn(
                        "pipeline.install",
                        format!("failed to pin rollback snapshot {}: {err}", snapshot.id),
                    );
                }
                let tmp = self.layout.run_tmp_dir(run_id);
                let result = self.run_stages(
                    &mut run,
                    release,
                    from_version,
                    target_version,
                    &tmp,
                    &expected_critical,
                );
                self.cleanup(run_id, &tmp);

                let outcome = match result {
                    Ok(()) => {
                        if let Err(err) = write_installed_marker(&self.layout, target_version) {
                            self.log.warn(
                                "pipeline.install",
                                format!("failed to record installed version: {err:#}"),
                            );
                        }
                        run.enter(PipelineStage::Completed);
                        RunOutcome::Completed
                    }
                    Err(failure) => self.roll_back(&mut run, &snapshot.id, failure),
                };
                if let Err(err) = self.snapshots.unpin(&snapshot.id) {
                    self.log.warn(
                        "pipeline.install",
                        format!("failed to unpin snapshot {}: {err}", snapshot.id),
                    );
                }
                outcome
            }
        };

        RunReport {
            run_id: run_id.to_string(),
            from_version: from_version.clone(),
            target_version: target_version.clone(),
            outcome,
            snapshot_id: run.state.snapshot_id.clone(),
            stages: run.stages,
            files_applied: run.files_applied,
            artifact_sha256: run.artifact_sha256,
            migration_warnings: run.migration_warnings,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn run_stages(
        &self,
        run: &mut Run<'_>,
        release: &ReleaseDescriptor,
        from_version: &Version,
        target_version: &Version,
        tmp: &Path,
        expected_critical: &[PathBuf],
    ) -> Result<(), StageFailure> {
        run.enter(PipelineStage::Downloading);
        let artifact_path = tmp.join(ARTIFACT_FILE);
        fs::create_dir_all(tmp)
            .map_err(|err| {
                anyhow::Error::new(err).context(format!("failed to create {}", tmp.display()))
            })
            .and_then(|()| self.fetcher.fetch(&release.artifact_url, &artifact_path))
            .map_err(|err| StageFailure::new(PipelineStage::Downloading, UpdateError::registry(err)))?;

        run.enter(PipelineStage::VerifyingArtifact);
        let expectations = ArtifactExpectations {
            min_bytes: self.config.transfer.min_artifact_bytes,
            size: release.artifact_size,
            sha256: release.artifact_sha256.as_deref(),
        };
        let facts = inspect_artifact(&artifact_path, &expectations).map_err(|err| {
            StageFailure::new(PipelineStage::VerifyingArtifact, UpdateError::integrity(err))
        })?;
        run.artifact_sha256 = Some(facts.sha256.clone());
        self.log.info(
            "pipeline.verify",
            format!(
                "artifact verified: {} archive, {} bytes, {} entries, sha256 {}",
                facts.kind.as_str(),
                facts.size,
                facts.entries,
                facts.sha256
            ),
        );

        run.enter(PipelineStage::Extracting);
        let extract_dir = tmp.join(EXTRACT_DIR);
        let payload_root = extract_artifact(&artifact_path, facts.kind, &extract_dir)
            .and_then(|()| locate_payload_root(&extract_dir, &self.app_roots))
            .map_err(|err| {
                StageFailure::new(PipelineStage::Extracting, UpdateError::integrity(err))
            })?;

        run.enter(PipelineStage::Applying);
        let applied = apply_tree(&payload_root, &self.layout, &self.protected, &self.app_roots)
            .map_err(|err| StageFailure::new(PipelineStage::Applying, UpdateError::apply(err)))?;
        run.files_applied = applied.written;
        if !applied.outside_roots.is_empty() {
            self.log.warn(
                "pipeline.apply",
                format!(
                    "ignored {} payload path(s) outside the publishing roots: {}",
                    applied.outside_roots.len(),
                    applied.outside_roots.join(", ")
                ),
            );
        }
        if !applied.skipped.is_empty() {
            self.log.info(
                "pipeline.apply",
                format!(
                    "left {} protected path(s) untouched: {}",
                    applied.skipped.len(),
                    applied.skipped.join(", ")
                ),
            );
        }

        run.enter(PipelineStage::Migrating);
        let ctx = MigrationContext {
            run_id: &run.state.run_id,
            from_version,
            to_version: target_version,
            applied_at: Utc::now(),
        };
        let warnings = self.migrations.run_all(&self.data_store, &ctx, &self.log);
        run.migration_warnings = warnings;

        run.enter(PipelineStage::VerifyingSystem);
        verify_system(
            self.probe.as_ref(),
            &self.data_store,
            &self.layout,
            expected_critical,
        )
        .map_err(|err| {
            StageFailure::new(
                PipelineStage::VerifyingSystem,
                UpdateError::integrity(err.context("system verification failed")),
            )
        })?;
        Ok(())
    }

    fn roll_back(&self, run: &mut Run<'_>, snapshot_id: &str, failure: StageFailure) -> RunOutcome {
        let StageFailure { stage, error } = failure;
        run.state.last_error = Some(error.to_string());
        self.log.error(
            "pipeline.install",
            format!(
                "run {} failed while {}: {error}",
                run.state.run_id,
                stage.as_str()
            ),
        );
        let cause = FailureCause::from(&error);

        if !self.config.features.rollback {
            self.log.warn(
                "pipeline.rollback",
                format!(
                    "rollback skipped for run {}: disabled in configuration; snapshot {snapshot_id} is available for a manual restore",
                    run.state.run_id
                ),
            );
            run.enter(PipelineStage::Failed);
            return RunOutcome::RollbackSkipped { stage, cause };
        }

        run.enter(PipelineStage::RollingBack);
        match self.snapshots.restore_snapshot(snapshot_id) {
            Ok(report) => {
                self.log.info(
                    "pipeline.rollback",
                    format!(
                        "run {} restored snapshot {} ({} entries)",
                        run.state.run_id, report.snapshot_id, report.restored_entries
                    ),
                );
                run.enter(PipelineStage::Failed);
                RunOutcome::RolledBack { stage, cause }
            }
            Err(err) => {
                let rollback_error = match err {
                    UpdateError::Rollback(_) => err,
                    other => UpdateError::Rollback(other.message().to_string()),
                };
                run.state.last_error = Some(format!("{error}; {rollback_error}"));
                self.log.error("pipeline.rollback", rollback_error.to_string());
                run.enter(PipelineStage::Failed);
                RunOutcome::RollbackFailed {
                    stage,
                    cause,
                    rollback_error: FailureCause::from(&rollback_error),
                }
            }
        }
    }

    fn present_critical_paths(&self) -> Vec<PathBuf> {
        self.protected
            .critical()
            .entries()
            .filter(|rel| self.layout.live_path(rel).exists())
            .map(Path::to_path_buf)
            .collect()
    }

    fn cleanup(&self, run_id: &str, tmp: &Path) {
        if let Err(err) = remove_path_if_exists(tmp) {
            self.log.warn(
                "pipeline.cleanup",
                format!("run {run_id} left temporary files behind: {err:#}"),
            );
        }
    }
}

pub fn pipeline_status(layout: &InstallLayout) -> UpdateResult<PipelineStatus> {
    let active = read_active_marker(layout)
        .map_err(UpdateError::apply)?
        .is_some();
    let current = read_run_state(layout).map_err(UpdateError::apply)?;
    Ok(PipelineStatus { active, current })
}

pub fn new_run_id(now: DateTime<Utc>) -> String {
    format!(
        "run-{}-{:08x}",
        now.format("%Y%m%dT%H%M%SZ"),
        rand::random::<u32>()
    )
}
