use chrono::{DateTime, Utc};
use punchcard_core::UpdateError;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::migrate::MigrationWarning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Snapshotting,
    Downloading,
    VerifyingArtifact,
    Extracting,
    Applying,
    Migrating,
    VerifyingSystem,
    RollingBack,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Snapshotting => "snapshotting",
            Self::Downloading => "downloading",
            Self::VerifyingArtifact => "verifying_artifact",
            Self::Extracting => "extracting",
            Self::Applying => "applying",
            Self::Migrating => "migrating",
            Self::VerifyingSystem => "verifying_system",
            Self::RollingBack => "rolling_back",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Failed)
    }
}

/// What `<state>/run/status.json` holds between transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub stage: PipelineStage,
    pub target_version: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: PipelineStage,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureCause {
    pub kind: String,
    pub message: String,
}

impl From<&UpdateError> for FailureCause {
    fn from(err: &UpdateError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Snapshotting failed; nothing live was touched.
    Aborted { cause: FailureCause },
    RolledBack {
        stage: PipelineStage,
        cause: FailureCause,
    },
    /// Rollback is disabled in configuration.
    RollbackSkipped {
        stage: PipelineStage,
        cause: FailureCause,
    },
    RollbackFailed {
        stage: PipelineStage,
        cause: FailureCause,
        rollback_error: FailureCause,
    },
}

impl RunOutcome {
    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            Self::Completed => None,
            Self::Aborted { cause }
            | Self::RolledBack { cause, .. }
            | Self::RollbackSkipped { cause, .. }
            | Self::RollbackFailed { cause, .. } => Some(cause),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub from_version: Version,
    pub target_version: Version,
    pub outcome: RunOutcome,
    pub snapshot_id: Option<String>,
    pub stages: Vec<StageRecord>,
    pub files_applied: usize,
    pub artifact_sha256: Option<String>,
    pub migration_warnings: Vec<MigrationWarning>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }

    pub fn final_stage(&self) -> PipelineStage {
        self.stages
            .last()
            .map(|record| record.stage)
            .unwrap_or(PipelineStage::Idle)
    }

    pub fn summary(&self) -> String {
        match &self.outcome {
            RunOutcome::Completed => format!(
                "updated {} -> {} ({} files applied)",
                self.from_version, self.target_version, self.files_applied
            ),
            RunOutcome::Aborted { cause } => format!(
                "update to {} aborted before any change: {}",
                self.target_version, cause.message
            ),
            RunOutcome::RolledBack { stage, cause } => format!(
                "update to {} failed while {}; rolled back to snapshot {}: {}",
                self.target_version,
                stage.as_str(),
                self.snapshot_id.as_deref().unwrap_or("-"),
                cause.message
            ),
            RunOutcome::RollbackSkipped { stage, cause } => format!(
                "update to {} failed while {}; rollback skipped (disabled): {}",
                self.target_version,
                stage.as_str(),
                cause.message
            ),
            RunOutcome::RollbackFailed {
                stage,
                cause,
                rollback_error,
            } => format!(
                "update to {} failed while {} and rollback also failed, manual intervention required: {}; rollback: {}",
                self.target_version,
                stage.as_str(),
                cause.message,
                rollback_error.message
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    /// True while a run holds the active marker.
    pub active: bool,
    pub current: Option<RunState>,
}
