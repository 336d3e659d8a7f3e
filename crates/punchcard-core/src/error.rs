use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("registry error: {0}")]
    Registry(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("backup error: {0}")]
    Backup(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("apply error: {0}")]
    Apply(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("rollback error (manual intervention required): {0}")]
    Rollback(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl UpdateError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registry(_) => "registry_error",
            Self::Config(_) => "config_error",
            Self::Backup(_) => "backup_error",
            Self::Integrity(_) => "integrity_error",
            Self::Apply(_) => "apply_error",
            Self::Migration(_) => "migration_error",
            Self::Rollback(_) => "rollback_error",
            Self::Conflict(_) => "conflict_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Registry(message)
            | Self::Config(message)
            | Self::Backup(message)
            | Self::Integrity(message)
            | Self::Apply(message)
            | Self::Migration(message)
            | Self::Rollback(message)
            | Self::Conflict(message) => message,
        }
    }

    pub fn registry(err: anyhow::Error) -> Self {
        Self::Registry(format!("{err:#}"))
    }

    pub fn config(err: anyhow::Error) -> Self {
        Self::Config(format!("{err:#}"))
    }

    pub fn backup(err: anyhow::Error) -> Self {
        Self::Backup(format!("{err:#}"))
    }

    pub fn integrity(err: anyhow::Error) -> Self {
        Self::Integrity(format!("{err:#}"))
    }

    pub fn apply(err: anyhow::Error) -> Self {
        Self::Apply(format!("{err:#}"))
    }

    pub fn migration(err: anyhow::Error) -> Self {
        Self::Migration(format!("{err:#}"))
    }

    pub fn rollback(err: anyhow::Error) -> Self {
        Self::Rollback(format!("{err:#}"))
    }
}

pub type UpdateResult<T> = std::result::Result<T, UpdateError>;
