use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use punchcard_core::InstallLayout;
use rusqlite::{Connection, OpenFlags};

pub trait StoreProbe: Send + Sync {
    fn probe(&self, data_store: &Path) -> Result<()>;
}

/// Opens the store read-only and runs a trivial catalog query.
pub struct SqliteProbe;

impl StoreProbe for SqliteProbe {
    fn probe(&self, data_store: &Path) -> Result<()> {
        let conn = Connection::open_with_flags(
            data_store,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open data store {}", data_store.display()))?;
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .with_context(|| format!("data store {} did not answer", data_store.display()))?;
        Ok(())
    }
}

pub fn verify_system(
    probe: &dyn StoreProbe,
    data_store: &Path,
    layout: &InstallLayout,
    expected_critical: &[PathBuf],
) -> Result<()> {
    probe.probe(data_store)?;

    let missing = expected_critical
        .iter()
        .filter(|rel| !layout.live_path(rel).exists())
        .map(|rel| rel.display().to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(anyhow!(
            "critical paths missing after update: {}",
            missing.join(", ")
        ));
    }
    Ok(())
}
