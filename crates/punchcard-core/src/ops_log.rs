//! Append-only operation log, one JSON object per line and one file per UTC
//! calendar day. Every entry is mirrored to `tracing`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::layout::InstallLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpsLevel {
    Info,
    Warn,
    Error,
}

impl OpsLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsEntry {
    pub ts: DateTime<Utc>,
    pub level: OpsLevel,
    pub operation: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct OpsLog {
    layout: InstallLayout,
}

impl OpsLog {
    pub fn new(layout: InstallLayout) -> Self {
        Self { layout }
    }

    pub fn info(&self, operation: &str, message: impl Into<String>) {
        self.record(OpsLevel::Info, operation, message.into());
    }

    pub fn warn(&self, operation: &str, message: impl Into<String>) {
        self.record(OpsLevel::Warn, operation, message.into());
    }

    pub fn error(&self, operation: &str, message: impl Into<String>) {
        self.record(OpsLevel::Error, operation, message.into());
    }

    pub fn record(&self, level: OpsLevel, operation: &str, message: String) {
        match level {
            OpsLevel::Info => info!(operation = %operation, "{message}"),
            OpsLevel::Warn => warn!(operation = %operation, "{message}"),
            OpsLevel::Error => error!(operation = %operation, "{message}"),
        }

        let entry = OpsEntry {
            ts: Utc::now(),
            level,
            operation: operation.to_string(),
            message,
        };
        if let Err(err) = self.append(&entry) {
            warn!(operation = %operation, "failed to write operation log entry: {err:#}");
        }
    }

    pub fn read_day(&self, day: chrono::NaiveDate) -> Result<Vec<OpsEntry>> {
        let path = self.layout.log_path(day);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read operation log: {}", path.display()));
            }
        };

        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<OpsEntry>(line).ok())
            .collect())
    }

    fn append(&self, entry: &OpsEntry) -> Result<PathBuf> {
        let path = self.layout.log_path(entry.ts.date_naive());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut line = serde_json::to_string(entry).context("failed to encode log entry")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open operation log: {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append operation log: {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush operation log: {}", path.display()))?;
        Ok(path)
    }
}
