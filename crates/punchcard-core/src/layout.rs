use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    install_root: PathBuf,
    state_dir: PathBuf,
}

impl InstallLayout {
    pub fn new(install_root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn live_path(&self, rel: &Path) -> PathBuf {
        self.install_root.join(rel)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    pub fn backup_dir(&self, snapshot_id: &str) -> PathBuf {
        self.backups_dir().join(snapshot_id)
    }

    pub fn backup_manifest_path(&self, snapshot_id: &str) -> PathBuf {
        self.backup_dir(snapshot_id).join("manifest.json")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir.join("tmp")
    }

    pub fn run_tmp_dir(&self, run_id: &str) -> PathBuf {
        self.tmp_dir().join(run_id)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn log_path(&self, day: NaiveDate) -> PathBuf {
        self.logs_dir().join(format!("punchcard-{}.log", day.format("%Y-%m-%d")))
    }

    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.join("run")
    }

    pub fn run_active_path(&self) -> PathBuf {
        self.run_dir().join("active")
    }

    pub fn run_status_path(&self) -> PathBuf {
        self.run_dir().join("status.json")
    }

    pub fn pinned_snapshot_path(&self) -> PathBuf {
        self.run_dir().join("pinned_snapshot")
    }

    pub fn last_check_path(&self) -> PathBuf {
        self.state_dir.join("last_check")
    }

    pub fn installed_version_path(&self) -> PathBuf {
        self.state_dir.join("installed_version")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.state_dir.clone(),
            self.backups_dir(),
            self.tmp_dir(),
            self.logs_dir(),
            self.run_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
