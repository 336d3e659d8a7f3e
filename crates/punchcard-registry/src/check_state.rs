use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use punchcard_core::InstallLayout;

pub fn read_last_check(layout: &InstallLayout) -> Result<Option<DateTime<Utc>>> {
    let path = layout.last_check_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read last check marker: {}", path.display()));
        }
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let parsed = DateTime::parse_from_rfc3339(trimmed)
        .map_err(|err| anyhow!("invalid last check timestamp '{trimmed}': {err}"))?;
    Ok(Some(parsed.with_timezone(&Utc)))
}

pub fn write_last_check(layout: &InstallLayout, checked_at: DateTime<Utc>) -> Result<PathBuf> {
    let path = layout.last_check_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let staged = path.with_extension("part");
    fs::write(
        &staged,
        format!("{}\n", checked_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
    )
    .with_context(|| format!("failed to write last check marker: {}", staged.display()))?;
    fs::rename(&staged, &path)
        .with_context(|| format!("failed to move last check marker: {}", path.display()))?;
    Ok(path)
}
