use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::critical::{normalize_relative_path, CriticalPathSet};
use crate::error::{UpdateError, UpdateResult};
use crate::layout::InstallLayout;
use crate::version::{parse_version_tag, read_installed_marker};

pub const TOKEN_ENV_VAR: &str = "PUNCHCARD_REGISTRY_TOKEN";
pub const DEFAULT_CONFIG_FILE: &str = "punchcard.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    pub installed_version: String,
    pub install_root: PathBuf,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_data_store")]
    pub data_store: PathBuf,
    #[serde(default)]
    pub config_files: Vec<String>,
    #[serde(default)]
    pub critical_paths: Vec<String>,
    #[serde(default = "default_app_roots")]
    pub app_roots: Vec<String>,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub backups: BackupConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub owner: String,
    pub repository: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfig {
    #[serde(default = "default_check_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub include_prereleases: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
    #[serde(default = "default_true")]
    pub include_app_roots: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_artifact_bytes")]
    pub min_artifact_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default = "default_true")]
    pub rollback: bool,
    #[serde(default = "default_true")]
    pub require_confirmation: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_check_interval_secs(),
            include_prereleases: false,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_retained: default_max_retained(),
            include_app_roots: true,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            min_artifact_bytes: default_min_artifact_bytes(),
        }
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            auto_update: false,
            rollback: true,
            require_confirmation: true,
        }
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl UpdaterConfig {
    pub fn load(path: &Path) -> UpdateResult<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))
            .map_err(UpdateError::config)?;
        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
            .map_err(UpdateError::config)?;

        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            if !token.trim().is_empty() {
                config.registry.token = Some(token.trim().to_string());
            }
        }

        if config.install_root.is_relative() {
            if let Some(parent) = path.parent() {
                config.install_root = parent.join(&config.install_root);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid updater configuration")
    }

    pub fn validate(&self) -> UpdateResult<()> {
        self.validate_inner().map_err(UpdateError::config)
    }

    fn validate_inner(&self) -> Result<()> {
        self.installed_version()?;

        if self.registry.owner.trim().is_empty() || self.registry.repository.trim().is_empty() {
            return Err(anyhow!("registry owner and repository must both be set"));
        }
        if self.backups.max_retained == 0 {
            return Err(anyhow!("backups.max_retained must be at least 1"));
        }
        if self.transfer.timeout_secs == 0 {
            return Err(anyhow!("transfer.timeout_secs must be greater than zero"));
        }
        if self.transfer.max_attempts == 0 {
            return Err(anyhow!("transfer.max_attempts must be at least 1"));
        }
        if self.app_roots.is_empty() {
            return Err(anyhow!("app_roots must name at least one publishing root"));
        }

        self.critical_path_set()?;
        self.config_file_paths()?;
        self.app_root_paths()?;

        if !self.install_root.is_dir() {
            return Err(anyhow!(
                "install root does not exist or is not a directory: {}",
                self.install_root.display()
            ));
        }
        Ok(())
    }

    pub fn installed_version(&self) -> Result<Version> {
        parse_version_tag(&self.installed_version)
            .context("installed_version is not a valid semantic version")
    }

    /// The configured version, superseded by the marker a completed update
    /// leaves in the state directory when that marker is newer.
    pub fn effective_installed_version(&self) -> Result<Version> {
        let configured = self.installed_version()?;
        match read_installed_marker(&self.layout())? {
            Some(recorded) if recorded > configured => Ok(recorded),
            _ => Ok(configured),
        }
    }

    pub fn critical_path_set(&self) -> Result<CriticalPathSet> {
        CriticalPathSet::new(&self.critical_paths).context("invalid critical_paths entry")
    }

    pub fn config_file_paths(&self) -> Result<Vec<PathBuf>> {
        self.config_files
            .iter()
            .map(|raw| normalize_relative_path(raw).context("invalid config_files entry"))
            .collect()
    }

    pub fn app_root_paths(&self) -> Result<Vec<PathBuf>> {
        self.app_roots
            .iter()
            .map(|raw| normalize_relative_path(raw).context("invalid app_roots entry"))
            .collect()
    }

    pub fn data_store_path(&self) -> PathBuf {
        if self.data_store.is_absolute() {
            self.data_store.clone()
        } else {
            self.install_root.join(&self.data_store)
        }
    }

    pub fn state_dir_path(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.install_root.join(dir),
            None => self.install_root.join(".punchcard"),
        }
    }

    pub fn layout(&self) -> InstallLayout {
        InstallLayout::new(self.install_root.clone(), self.state_dir_path())
    }
}

fn default_data_store() -> PathBuf {
    PathBuf::from("backend/database/timeclock.sqlite")
}

fn default_app_roots() -> Vec<String> {
    vec!["frontend".to_string(), "backend".to_string()]
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_check_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_retained() -> usize {
    5
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_artifact_bytes() -> u64 {
    1024
}

fn default_true() -> bool {
    true
}
