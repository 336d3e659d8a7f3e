use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_FORMAT: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    DataStore,
    AppRoot,
    Critical,
    Config,
}

impl EntryKind {
    pub fn stored_dir(self) -> &'static str {
        match self {
            Self::DataStore => "data",
            Self::AppRoot => "app",
            Self::Critical => "critical",
            Self::Config => "config",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: EntryKind,
    /// Live location, relative to the install root except for the data store.
    pub source: String,
    /// Location inside the snapshot directory.
    pub stored: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub format: u32,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub app_version: Option<String>,
    pub entries: Vec<ManifestEntry>,
    pub files: Vec<ManifestFile>,
    pub total_size: u64,
}

impl SnapshotManifest {
    pub fn entries_of(&self, kind: EntryKind) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    pub fn data_store_entry(&self) -> Option<&ManifestEntry> {
        self.entries_of(EntryKind::DataStore).next()
    }
}

pub fn write_manifest(snapshot_dir: &Path, manifest: &SnapshotManifest) -> Result<PathBuf> {
    let path = snapshot_dir.join(MANIFEST_FILE);
    let staged = snapshot_dir.join(format!("{MANIFEST_FILE}.part"));
    let payload =
        serde_json::to_vec_pretty(manifest).context("failed to encode snapshot manifest")?;

    fs::write(&staged, payload)
        .with_context(|| format!("failed to write snapshot manifest: {}", staged.display()))?;
    fs::rename(&staged, &path)
        .with_context(|| format!("failed to move snapshot manifest: {}", path.display()))?;
    Ok(path)
}

pub fn read_manifest(snapshot_dir: &Path) -> Result<Option<SnapshotManifest>> {
    let path = snapshot_dir.join(MANIFEST_FILE);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read snapshot manifest: {}", path.display()));
        }
    };

    let manifest: SnapshotManifest = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse snapshot manifest: {}", path.display()))?;
    if manifest.format != MANIFEST_FORMAT {
        return Err(anyhow!(
            "unsupported snapshot manifest format {} (expected {MANIFEST_FORMAT})",
            manifest.format
        ));
    }
    Ok(Some(manifest))
}

pub fn manifest_path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
