use std::fs;
use std::io;

use anyhow::{Context, Result};
use semver::Version;

use crate::layout::InstallLayout;

pub fn parse_version_tag(tag: &str) -> Result<Version> {
    let trimmed = tag.trim();
    let bare = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    Version::parse(bare).with_context(|| format!("invalid semantic version tag '{tag}'"))
}

pub fn is_update_available(installed: &Version, latest: &Version) -> bool {
    latest > installed
}

/// Version recorded by the last completed update, if any.
pub fn read_installed_marker(layout: &InstallLayout) -> Result<Option<Version>> {
    let path = layout.installed_version_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read installed version: {}", path.display()));
        }
    };

    if raw.trim().is_empty() {
        return Ok(None);
    }
    parse_version_tag(&raw).map(Some)
}

pub fn write_installed_marker(layout: &InstallLayout, version: &Version) -> Result<()> {
    let path = layout.installed_version_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let staged = path.with_extension("part");
    fs::write(&staged, format!("{version}\n"))
        .with_context(|| format!("failed to write installed version: {}", staged.display()))?;
    fs::rename(&staged, &path)
        .with_context(|| format!("failed to move installed version: {}", path.display()))?;
    Ok(())
}
