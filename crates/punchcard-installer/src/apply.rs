use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use punchcard_core::{collect_files, replace_file_staged, CriticalPathSet, InstallLayout};
use serde::Serialize;
use tracing::debug;

/// Live paths an update never writes: the critical path set, the data store,
/// and the updater's own state directory.
#[derive(Debug, Clone)]
pub struct ProtectedPaths {
    critical: CriticalPathSet,
    data_store: Option<PathBuf>,
    state_dir: Option<PathBuf>,
}

impl ProtectedPaths {
    pub fn new(layout: &InstallLayout, critical: CriticalPathSet, data_store: &Path) -> Self {
        let root = layout.install_root();
        Self {
            critical,
            data_store: data_store.strip_prefix(root).ok().map(Path::to_path_buf),
            state_dir: layout
                .state_dir()
                .strip_prefix(root)
                .ok()
                .map(Path::to_path_buf),
        }
    }

    pub fn critical(&self) -> &CriticalPathSet {
        &self.critical
    }

    pub fn covers(&self, rel: &Path) -> bool {
        self.critical.matches(rel)
            || self.data_store.as_deref() == Some(rel)
            || self
                .state_dir
                .as_deref()
                .is_some_and(|state| rel.starts_with(state))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub written: usize,
    pub skipped: Vec<String>,
    /// Payload files outside every publishing root. Snapshots only capture
    /// the publishing roots, so these are never written.
    pub outside_roots: Vec<String>,
}

/// Copies every regular file under `payload_root` that lies inside one of
/// `app_roots` over the live tree in sorted order. Symlinks in the payload
/// are ignored.
pub fn apply_tree(
    payload_root: &Path,
    layout: &InstallLayout,
    protected: &ProtectedPaths,
    app_roots: &[PathBuf],
) -> Result<ApplySummary> {
    let files = collect_files(payload_root)?;
    let total = files.len();
    let mut summary = ApplySummary::default();

    for rel in files {
        if !app_roots.iter().any(|root| rel.starts_with(root)) {
            debug!(path = %rel.display(), "skipping path outside publishing roots");
            summary.outside_roots.push(display_rel(&rel));
            continue;
        }
        if protected.covers(&rel) {
            debug!(path = %rel.display(), "skipping protected path");
            summary.skipped.push(display_rel(&rel));
            continue;
        }

        let src = payload_root.join(&rel);
        let dst = layout.live_path(&rel);
        replace_file_staged(&src, &dst).with_context(|| {
            format!(
                "applied {} of {total} files before failing on {}",
                summary.written,
                rel.display()
            )
        })?;
        summary.written += 1;
    }
    Ok(summary)
}

fn display_rel(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}
