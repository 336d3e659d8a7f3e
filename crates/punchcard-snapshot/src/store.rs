use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use punchcard_core::{
    collect_files, copy_dir_filtered, copy_dir_recursive, normalize_relative_path, path_size,
    remove_path_if_exists, replace_file_staged, CriticalPathSet, InstallLayout, OpsLog,
    UpdateError, UpdateResult, UpdaterConfig,
};
use serde::Serialize;
use tracing::debug;

use crate::manifest::{
    manifest_path_string, read_manifest, write_manifest, EntryKind, ManifestEntry, ManifestFile,
    SnapshotManifest, MANIFEST_FORMAT,
};

static SNAPSHOT_SEQUENCE: AtomicU32 = AtomicU32::new(0);
const ALLOCATE_ATTEMPTS: usize = 8;

/// What goes into every snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSource {
    pub data_store: PathBuf,
    pub critical: CriticalPathSet,
    pub config_files: Vec<PathBuf>,
    pub app_roots: Vec<PathBuf>,
    pub include_app_roots: bool,
    pub installed_version: Option<String>,
}

impl SnapshotSource {
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        Ok(Self {
            data_store: config.data_store_path(),
            critical: config.critical_path_set()?,
            config_files: config.config_file_paths()?,
            app_roots: config.app_root_paths()?,
            include_app_roots: config.backups.include_app_roots,
            installed_version: Some(config.effective_installed_version()?.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub app_version: Option<String>,
    pub total_size: u64,
    pub file_count: usize,
}

impl From<&SnapshotManifest> for SnapshotSummary {
    fn from(manifest: &SnapshotManifest) -> Self {
        Self {
            id: manifest.id.clone(),
            created_at: manifest.created_at,
            description: manifest.description.clone(),
            app_version: manifest.app_version.clone(),
            total_size: manifest.total_size,
            file_count: manifest.files.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub restored_entries: usize,
    pub restored_files: usize,
}

pub struct SnapshotStore {
    layout: InstallLayout,
    source: SnapshotSource,
    max_retained: usize,
    log: OpsLog,
}

impl SnapshotStore {
    pub fn new(layout: InstallLayout, source: SnapshotSource, max_retained: usize) -> Self {
        Self {
            log: OpsLog::new(layout.clone()),
            layout,
            source,
            max_retained: max_retained.max(1),
        }
    }

    pub fn from_config(config: &UpdaterConfig) -> UpdateResult<Self> {
        let source = SnapshotSource::from_config(config).map_err(UpdateError::config)?;
        Ok(Self::new(config.layout(), source, config.backups.max_retained))
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn max_retained(&self) -> usize {
        self.max_retained
    }

    pub fn create_snapshot(&self, description: &str) -> UpdateResult<SnapshotSummary> {
        let (id, dir, created_at) = self.allocate().map_err(|err| {
            let err = UpdateError::backup(err);
            self.log.error("backup.create", err.to_string());
            err
        })?;

        let manifest = match self.populate(&id, &dir, created_at, description) {
            Ok(manifest) => manifest,
            Err(err) => {
                if let Err(cleanup_err) = fs::remove_dir_all(&dir) {
                    self.log.error(
                        "backup.create",
                        format!(
                            "failed to remove partial snapshot {}: {cleanup_err}",
                            dir.display()
                        ),
                    );
                }
                let err = UpdateError::backup(err.context(format!("snapshot '{id}' aborted")));
                self.log.error("backup.create", err.to_string());
                return Err(err);
            }
        };

        self.log.info(
            "backup.create",
            format!(
                "created snapshot {id} ({} files, {} bytes): {description}",
                manifest.files.len(),
                manifest.total_size
            ),
        );

        match self.evict() {
            Ok(evicted) if !evicted.is_empty() => self.log.info(
                "backup.evict",
                format!(
                    "evicted {} snapshot(s) beyond retention {}: {}",
                    evicted.len(),
                    self.max_retained,
                    evicted.join(", ")
                ),
            ),
            Ok(_) => {}
            Err(err) => self.log.error("backup.evict", err.to_string()),
        }

        Ok(SnapshotSummary::from(&manifest))
    }

    /// Valid snapshots only, newest first. Always re-read from disk.
    pub fn list_snapshots(&self) -> UpdateResult<Vec<SnapshotSummary>> {
        self.list_inner().map_err(UpdateError::backup)
    }

    pub fn verify_snapshot(&self, id: &str) -> UpdateResult<SnapshotManifest> {
        self.verify_inner(id).map_err(UpdateError::integrity)
    }

    pub fn restore_snapshot(&self, id: &str) -> UpdateResult<RestoreReport> {
        let manifest = self.verify_snapshot(id).map_err(|err| {
            self.log.error("backup.restore", err.to_string());
            err
        })?;

        match self.restore_from_manifest(&manifest) {
            Ok(report) => {
                self.log.info(
                    "backup.restore",
                    format!(
                        "restored snapshot {id}: {} entries, {} files",
                        report.restored_entries, report.restored_files
                    ),
                );
                Ok(report)
            }
            Err(err) => {
                let err = UpdateError::rollback(
                    err.context(format!("restore of snapshot '{id}' did not complete")),
                );
                self.log.error("backup.restore", err.to_string());
                Err(err)
            }
        }
    }

    /// Returns whether anything was removed; a missing id is not an error.
    /// The rollback target of an active run cannot be deleted.
    pub fn delete_snapshot(&self, id: &str) -> UpdateResult<bool> {
        if self.pinned_snapshot().as_deref() == Some(id) {
            let err = UpdateError::Conflict(format!(
                "snapshot '{id}' is the rollback target of the update run in progress"
            ));
            self.log.warn("backup.delete", err.to_string());
            return Err(err);
        }

        let result = validate_snapshot_id(id).and_then(|()| {
            let dir = self.layout.backup_dir(id);
            match fs::symlink_metadata(&dir) {
                Ok(_) => {
                    fs::remove_dir_all(&dir)
                        .with_context(|| format!("failed to remove snapshot {}", dir.display()))?;
                    Ok(true)
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(err) => {
                    Err(err).with_context(|| format!("failed to stat snapshot {}", dir.display()))
                }
            }
        });

        match result {
            Ok(removed) => {
                if removed {
                    self.log.info("backup.delete", format!("deleted snapshot {id}"));
                }
                Ok(removed)
            }
            Err(err) => {
                let err = UpdateError::backup(err);
                self.log.error("backup.delete", err.to_string());
                Err(err)
            }
        }
    }

    /// Deletes the oldest valid snapshots until at most `max_retained` remain.
    /// A pinned snapshot is kept even when it falls past the limit.
    pub fn evict(&self) -> UpdateResult<Vec<String>> {
        let snapshots = self.list_snapshots()?;
        let pinned = self.pinned_snapshot();
        let mut evicted = Vec::new();
        for snapshot in snapshots.into_iter().skip(self.max_retained) {
            if pinned.as_deref() == Some(snapshot.id.as_str()) {
                debug!(snapshot_id = %snapshot.id, "keeping pinned snapshot past retention");
                continue;
            }
            self.delete_snapshot(&snapshot.id)?;
            evicted.push(snapshot.id);
        }
        Ok(evicted)
    }

    /// Marks `id` as the rollback target of the run holding `run/active`.
    pub fn pin(&self, id: &str) -> UpdateResult<()> {
        validate_snapshot_id(id)
            .and_then(|()| {
                let path = self.layout.pinned_snapshot_path();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                let staged = path.with_extension("part");
                fs::write(&staged, format!("{id}\n"))
                    .with_context(|| format!("failed to write {}", staged.display()))?;
                fs::rename(&staged, &path)
                    .with_context(|| format!("failed to move {}", path.display()))
            })
            .map_err(UpdateError::backup)
    }

    /// Clears the pin if it still names `id`.
    pub fn unpin(&self, id: &str) -> UpdateResult<()> {
        match read_pin(&self.layout) {
            Ok(Some(pinned)) if pinned == id => {
                remove_path_if_exists(&self.layout.pinned_snapshot_path())
                    .map_err(UpdateError::backup)
            }
            Ok(_) => Ok(()),
            Err(err) => Err(UpdateError::backup(err)),
        }
    }

    /// The pinned snapshot, honoured only while a run marker exists so a pin
    /// left by a crashed process does not outlive it.
    pub fn pinned_snapshot(&self) -> Option<String> {
        if !self.layout.run_active_path().exists() {
            return None;
        }
        match read_pin(&self.layout) {
            Ok(pinned) => pinned,
            Err(err) => {
                self.log.warn(
                    "backup.pin",
                    format!("ignoring unreadable snapshot pin: {err:#}"),
                );
                None
            }
        }
    }

    fn allocate(&self) -> Result<(String, PathBuf, DateTime<Utc>)> {
        let backups_dir = self.layout.backups_dir();
        fs::create_dir_all(&backups_dir)
            .with_context(|| format!("failed to create {}", backups_dir.display()))?;

        for _ in 0..ALLOCATE_ATTEMPTS {
            let created_at = Utc::now();
            let id = new_snapshot_id(created_at);
            let dir = self.layout.backup_dir(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir, created_at)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to create snapshot directory {}", dir.display())
                    });
                }
            }
        }
        Err(anyhow!(
            "could not allocate a unique snapshot id after {ALLOCATE_ATTEMPTS} attempts"
        ))
    }

    fn populate(
        &self,
        id: &str,
        dir: &Path,
        created_at: DateTime<Utc>,
        description: &str,
    ) -> Result<SnapshotManifest> {
        let mut entries = Vec::new();

        let data_store = &self.source.data_store;
        let metadata = fs::metadata(data_store)
            .with_context(|| format!("data store is not readable: {}", data_store.display()))?;
        if !metadata.is_file() {
            return Err(anyhow!(
                "data store is not a regular file: {}",
                data_store.display()
            ));
        }
        let file_name = data_store
            .file_name()
            .ok_or_else(|| anyhow!("data store path has no file name: {}", data_store.display()))?;
        let stored = Path::new(EntryKind::DataStore.stored_dir()).join(file_name);
        copy_file_into(data_store, &dir.join(&stored))?;
        entries.push(ManifestEntry {
            kind: EntryKind::DataStore,
            source: manifest_path_string(data_store),
            stored: manifest_path_string(&stored),
            is_dir: false,
            size: metadata.len(),
        });

        for rel in self.source.critical.entries() {
            self.capture(dir, EntryKind::Critical, rel, &mut entries)?;
        }
        for rel in &self.source.config_files {
            self.capture(dir, EntryKind::Config, rel, &mut entries)?;
        }
        if self.source.include_app_roots {
            for rel in &self.source.app_roots {
                self.capture_app_root(dir, rel, &mut entries)?;
            }
        }

        let mut files = Vec::new();
        let mut total_size = 0_u64;
        for rel in collect_files(dir)? {
            let path = dir.join(&rel);
            let size = fs::metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
            total_size += size;
            files.push(ManifestFile {
                path: manifest_path_string(&rel),
                size,
            });
        }

        let manifest = SnapshotManifest {
            format: MANIFEST_FORMAT,
            id: id.to_string(),
            created_at,
            description: description.to_string(),
            app_version: self.source.installed_version.clone(),
            entries,
            files,
            total_size,
        };
        write_manifest(dir, &manifest)?;
        Ok(manifest)
    }

    fn capture(
        &self,
        dir: &Path,
        kind: EntryKind,
        rel: &Path,
        entries: &mut Vec<ManifestEntry>,
    ) -> Result<()> {
        let live = self.layout.live_path(rel);
        let metadata = match fs::symlink_metadata(&live) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.log.warn(
                    "backup.create",
                    format!(
                        "{} path {} does not exist, not captured",
                        kind.stored_dir(),
                        rel.display()
                    ),
                );
                return Ok(());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", live.display()));
            }
        };

        let stored = Path::new(kind.stored_dir()).join(rel);
        let target = dir.join(&stored);
        if metadata.is_dir() {
            copy_dir_recursive(&live, &target)?;
        } else {
            copy_file_into(&live, &target)?;
        }
        entries.push(ManifestEntry {
            kind,
            source: manifest_path_string(rel),
            stored: manifest_path_string(&stored),
            is_dir: metadata.is_dir(),
            size: path_size(&live)?,
        });
        Ok(())
    }

    fn capture_app_root(
        &self,
        dir: &Path,
        rel: &Path,
        entries: &mut Vec<ManifestEntry>,
    ) -> Result<()> {
        let live = self.layout.live_path(rel);
        if !live.is_dir() {
            self.log.warn(
                "backup.create",
                format!("app root {} does not exist, not captured", rel.display()),
            );
            return Ok(());
        }

        let stored = Path::new(EntryKind::AppRoot.stored_dir()).join(rel);
        let target = dir.join(&stored);
        copy_dir_filtered(&live, &target, &mut |inner| {
            self.is_protected(&rel.join(inner))
        })?;
        entries.push(ManifestEntry {
            kind: EntryKind::AppRoot,
            source: manifest_path_string(rel),
            stored: manifest_path_string(&stored),
            is_dir: true,
            size: path_size(&target)?,
        });
        Ok(())
    }

    /// Paths with their own snapshot entry or owned by the updater itself.
    fn is_protected(&self, rel: &Path) -> bool {
        if self.source.critical.matches(rel) {
            return true;
        }
        if self
            .source
            .config_files
            .iter()
            .any(|config| rel == config || rel.starts_with(config))
        {
            return true;
        }
        if let Ok(data_rel) = self.source.data_store.strip_prefix(self.layout.install_root()) {
            if rel == data_rel {
                return true;
            }
        }
        if let Ok(state_rel) = self.layout.state_dir().strip_prefix(self.layout.install_root()) {
            if rel.starts_with(state_rel) {
                return true;
            }
        }
        false
    }

    fn list_inner(&self) -> Result<Vec<SnapshotSummary>> {
        let backups_dir = self.layout.backups_dir();
        let read_dir = match fs::read_dir(&backups_dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", backups_dir.display()));
            }
        };

        let mut snapshots = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.verify_inner(&id) {
                Ok(manifest) => snapshots.push(SnapshotSummary::from(&manifest)),
                Err(err) => debug!(snapshot_id = %id, "skipping invalid snapshot: {err:#}"),
            }
        }

        snapshots.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(snapshots)
    }

    fn verify_inner(&self, id: &str) -> Result<SnapshotManifest> {
        validate_snapshot_id(id)?;
        let dir = self.layout.backup_dir(id);
        if !dir.is_dir() {
            return Err(anyhow!("snapshot '{id}' does not exist"));
        }

        let manifest =
            read_manifest(&dir)?.ok_or_else(|| anyhow!("snapshot '{id}' has no manifest"))?;
        if manifest.id != id {
            return Err(anyhow!(
                "snapshot '{id}' manifest names a different id '{}'",
                manifest.id
            ));
        }

        let data_entry = manifest
            .data_store_entry()
            .ok_or_else(|| anyhow!("snapshot '{id}' manifest has no data store entry"))?;
        if !dir.join(&data_entry.stored).is_file() {
            return Err(anyhow!(
                "snapshot '{id}' is missing its data store copy {}",
                data_entry.stored
            ));
        }

        for entry in &manifest.entries {
            if !dir.join(&entry.stored).exists() {
                return Err(anyhow!(
                    "snapshot '{id}' is missing entry {}",
                    entry.stored
                ));
            }
        }

        for file in &manifest.files {
            let path = dir.join(&file.path);
            let metadata = fs::metadata(&path)
                .with_context(|| format!("snapshot '{id}' is missing file {}", file.path))?;
            if !metadata.is_file() || metadata.len() != file.size {
                return Err(anyhow!(
                    "snapshot '{id}' file {} does not match its recorded size {}",
                    file.path,
                    file.size
                ));
            }
        }

        Ok(manifest)
    }

    fn restore_from_manifest(&self, manifest: &SnapshotManifest) -> Result<RestoreReport> {
        let dir = self.layout.backup_dir(&manifest.id);
        let mut restored_entries = 0;

        for entry in manifest.entries_of(EntryKind::AppRoot) {
            let rel = normalize_relative_path(&entry.source)?;
            self.restore_app_root(&dir.join(&entry.stored), &rel)?;
            restored_entries += 1;
        }

        if let Some(entry) = manifest.data_store_entry() {
            replace_file_staged(&dir.join(&entry.stored), &self.source.data_store)?;
            restored_entries += 1;
        }

        for kind in [EntryKind::Critical, EntryKind::Config] {
            for entry in manifest.entries_of(kind) {
                let rel = normalize_relative_path(&entry.source)?;
                let live = self.layout.live_path(&rel);
                let stored = dir.join(&entry.stored);
                if entry.is_dir {
                    remove_path_if_exists(&live)?;
                    copy_dir_recursive(&stored, &live)?;
                } else {
                    replace_file_staged(&stored, &live)?;
                }
                restored_entries += 1;
            }
        }

        Ok(RestoreReport {
            snapshot_id: manifest.id.clone(),
            restored_entries,
            restored_files: manifest.files.len(),
        })
    }

    fn restore_app_root(&self, stored: &Path, rel: &Path) -> Result<()> {
        let live = self.layout.live_path(rel);
        if live.is_dir() {
            self.clear_unprotected(rel, &live, &live)?;
        } else {
            remove_path_if_exists(&live)?;
        }
        copy_dir_recursive(stored, &live)
    }

    /// Removes everything under an app root that the snapshot owns, leaving
    /// protected paths in place for their own restore step.
    fn clear_unprotected(&self, root_rel: &Path, live_root: &Path, current: &Path) -> Result<()> {
        for entry in
            fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let inner = path
                .strip_prefix(live_root)
                .with_context(|| format!("failed to relativize {}", path.display()))?;
            if self.is_protected(&root_rel.join(inner)) {
                continue;
            }

            if entry.file_type()?.is_dir() {
                self.clear_unprotected(root_rel, live_root, &path)?;
                let is_empty = fs::read_dir(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?
                    .next()
                    .is_none();
                if is_empty {
                    fs::remove_dir(&path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
            } else {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }
}

fn read_pin(layout: &InstallLayout) -> Result<Option<String>> {
    let path = layout.pinned_snapshot_path();
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let id = raw.trim();
            Ok((!id.is_empty()).then(|| id.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

pub fn new_snapshot_id(created_at: DateTime<Utc>) -> String {
    let sequence = SNAPSHOT_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10_000;
    format!(
        "{}-{sequence:04}-{:08x}",
        created_at.format("%Y%m%dT%H%M%S%6fZ"),
        rand::random::<u32>()
    )
}

fn validate_snapshot_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.');
    if !valid {
        return Err(anyhow!("invalid snapshot id '{id}'"));
    }
    Ok(())
}

fn copy_file_into(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}
