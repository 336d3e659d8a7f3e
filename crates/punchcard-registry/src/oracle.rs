use chrono::{DateTime, Duration, Utc};
use punchcard_core::{
    is_update_available, FeatureFlags, InstallLayout, OpsLog, ReleaseDescriptor, UpdateError,
    UpdateResult, UpdaterConfig,
};
use semver::Version;
use serde::Serialize;

use crate::check_state::{read_last_check, write_last_check};
use crate::feed::{latest_release_endpoint, GitHubReleaseFeed, ReleaseFeed};

const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateCheck {
    pub update_available: bool,
    /// False when the call was throttled and the registry was not contacted.
    pub checked: bool,
    pub current_version: Version,
    pub latest_version: Option<Version>,
    pub release: Option<ReleaseDescriptor>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub installed_version: Version,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_check_due_at: Option<DateTime<Utc>>,
    pub check_interval_secs: u64,
    pub registry_endpoint: String,
    pub authenticated_registry: bool,
    pub max_retained_backups: usize,
    pub features: FeatureFlags,
}

pub struct VersionOracle {
    config: UpdaterConfig,
    layout: InstallLayout,
    installed: Version,
    feed: Box<dyn ReleaseFeed>,
    log: OpsLog,
}

impl VersionOracle {
    pub fn new(config: &UpdaterConfig, feed: Box<dyn ReleaseFeed>) -> UpdateResult<Self> {
        let installed = config
            .effective_installed_version()
            .map_err(UpdateError::config)?;
        let layout = config.layout();
        Ok(Self {
            config: config.clone(),
            log: OpsLog::new(layout.clone()),
            layout,
            installed,
            feed,
        })
    }

    pub fn from_config(config: &UpdaterConfig) -> UpdateResult<Self> {
        let feed = GitHubReleaseFeed::new(&config.registry, config.transfer.timeout())
            .map_err(UpdateError::config)?;
        Self::new(config, Box::new(feed))
    }

    pub fn check_for_updates(&self, force: bool) -> UpdateResult<UpdateCheck> {
        self.check_for_updates_at(force, Utc::now())
    }

    pub fn check_for_updates_at(
        &self,
        force: bool,
        now: DateTime<Utc>,
    ) -> UpdateResult<UpdateCheck> {
        let last_checked_at = self.last_checked_at();

        if !force {
            if let Some(last) = last_checked_at {
                if now.signed_duration_since(last) < self.interval() {
                    self.log.info(
                        "version.check",
                        format!("skipped: last check at {last} is within the check interval"),
                    );
                    return Ok(UpdateCheck {
                        update_available: false,
                        checked: false,
                        current_version: self.installed.clone(),
                        latest_version: None,
                        release: None,
                        last_checked_at: Some(last),
                    });
                }
            }
        }

        let published = match self.feed.latest_release() {
            Ok(published) => published,
            Err(err) => {
                let err = UpdateError::registry(err);
                self.log.error("version.check", err.to_string());
                return Err(err);
            }
        };
        let latest = published.descriptor.version().map_err(|err| {
            let err = UpdateError::registry(err);
            self.log.error("version.check", err.to_string());
            err
        })?;

        let offered = !published.draft
            && (self.config.check.include_prereleases
                || (!published.prerelease && latest.pre.is_empty()));
        let update_available = offered && is_update_available(&self.installed, &latest);

        if let Err(err) = write_last_check(&self.layout, now) {
            self.log.warn(
                "version.check",
                format!("failed to persist last check timestamp: {err:#}"),
            );
        }

        self.log.info(
            "version.check",
            format!(
                "installed={} latest={} update_available={}",
                self.installed, latest, update_available
            ),
        );

        Ok(UpdateCheck {
            update_available,
            checked: true,
            current_version: self.installed.clone(),
            latest_version: Some(latest),
            release: update_available.then_some(published.descriptor),
            last_checked_at: Some(now),
        })
    }

    pub fn system_info(&self) -> SystemInfo {
        let last_checked_at = self.last_checked_at();
        SystemInfo {
            installed_version: self.installed.clone(),
            next_check_due_at: last_checked_at.map(|last| last + self.interval()),
            last_checked_at,
            check_interval_secs: self.config.check.interval_secs,
            registry_endpoint: latest_release_endpoint(&self.config.registry),
            authenticated_registry: self.config.registry.token.is_some(),
            max_retained_backups: self.config.backups.max_retained,
            features: self.config.features,
        }
    }

    fn interval(&self) -> Duration {
        let secs = self.config.check.interval_secs.min(MAX_INTERVAL_SECS);
        Duration::seconds(secs as i64)
    }

    fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        match read_last_check(&self.layout) {
            Ok(last) => last,
            Err(err) => {
                self.log.warn(
                    "version.check",
                    format!("ignoring unreadable last check marker: {err:#}"),
                );
                None
            }
        }
    }
}
