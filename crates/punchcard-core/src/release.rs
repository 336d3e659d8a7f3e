use anyhow::Result;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::version::parse_version_tag;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub tag: String,
    pub name: String,
    pub notes: String,
    pub published_at: Option<DateTime<Utc>>,
    pub artifact_url: String,
    pub artifact_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_sha256: Option<String>,
}

impl ReleaseDescriptor {
    pub fn version(&self) -> Result<Version> {
        parse_version_tag(&self.tag)
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.tag
        } else {
            &self.name
        }
    }
}
