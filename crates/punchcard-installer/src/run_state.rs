use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use punchcard_core::{InstallLayout, UpdateError, UpdateResult};
use tracing::warn;

use crate::types::RunState;

/// Cross-process claim on `<state>/run/active`. The marker holds the run id
/// and the owning process id. Dropping the guard releases the claim.
#[derive(Debug)]
pub struct RunGuard {
    path: PathBuf,
    run_id: String,
    released: bool,
}

impl RunGuard {
    pub fn acquire(layout: &InstallLayout, run_id: &str) -> UpdateResult<Self> {
        match claim_active_marker(layout, run_id) {
            Ok(path) => Ok(Self {
                path,
                run_id: run_id.to_string(),
                released: false,
            }),
            Err(ClaimError::Held(holder)) => {
                if marker_is_stale(layout, &holder) {
                    warn!(
                        run_id = %holder.run_id,
                        pid = holder.pid.unwrap_or_default(),
                        "clearing stale active run marker"
                    );
                    clear_active_marker(layout).map_err(UpdateError::apply)?;
                    return match claim_active_marker(layout, run_id) {
                        Ok(path) => Ok(Self {
                            path,
                            run_id: run_id.to_string(),
                            released: false,
                        }),
                        Err(ClaimError::Held(holder)) => Err(conflict(layout, &holder.run_id)),
                        Err(ClaimError::Io(err)) => Err(UpdateError::apply(err)),
                    };
                }
                Err(conflict(layout, &holder.run_id))
            }
            Err(ClaimError::Io(err)) => Err(UpdateError::apply(err)),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_marker(&self.path)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = remove_marker(&self.path) {
            warn!(run_id = %self.run_id, "failed to release active run marker: {err:#}");
        }
    }
}

enum ClaimError {
    Held(MarkerOwner),
    Io(anyhow::Error),
}

#[derive(Debug, Default)]
struct MarkerOwner {
    run_id: String,
    pid: Option<u32>,
}

fn claim_active_marker(layout: &InstallLayout, run_id: &str) -> Result<PathBuf, ClaimError> {
    let path = layout.run_active_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))
            .map_err(ClaimError::Io)?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let holder = read_marker_owner(layout)
                .ok()
                .flatten()
                .unwrap_or_default();
            return Err(ClaimError::Held(holder));
        }
        Err(err) => {
            return Err(ClaimError::Io(anyhow::Error::new(err).context(format!(
                "failed to claim active run marker: {}",
                path.display()
            ))));
        }
    };

    file.write_all(format!("{run_id}\n{}\n", std::process::id()).as_bytes())
        .and_then(|()| file.flush())
        .with_context(|| format!("failed to write active run marker: {}", path.display()))
        .map_err(ClaimError::Io)?;
    Ok(path)
}

pub fn read_active_marker(layout: &InstallLayout) -> Result<Option<String>> {
    Ok(read_marker_owner(layout)?.map(|owner| owner.run_id))
}

fn read_marker_owner(layout: &InstallLayout) -> Result<Option<MarkerOwner>> {
    let path = layout.run_active_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read active run marker: {}", path.display()));
        }
    };

    let mut lines = raw.lines().map(str::trim);
    let run_id = lines.next().unwrap_or_default();
    if run_id.is_empty() {
        return Ok(None);
    }
    Ok(Some(MarkerOwner {
        run_id: run_id.to_string(),
        pid: lines.next().and_then(|pid| pid.parse().ok()),
    }))
}

pub fn clear_active_marker(layout: &InstallLayout) -> Result<()> {
    remove_marker(&layout.run_active_path())
}

fn remove_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err)
            .with_context(|| format!("failed to clear active run marker: {}", path.display())),
    }
}

/// A pipeline run's marker is stale once the status file shows that run in a
/// terminal stage; a run that died mid-stage keeps its marker for manual
/// inspection. Any other holder (backup maintenance) is stale once its
/// process is gone.
fn marker_is_stale(layout: &InstallLayout, holder: &MarkerOwner) -> bool {
    match read_run_state(layout) {
        Ok(Some(state)) if state.run_id == holder.run_id => state.stage.is_terminal(),
        Ok(_) => holder.pid.is_some_and(|pid| !process_is_alive(pid)),
        Err(_) => false,
    }
}

/// Answers from `/proc` where it exists; elsewhere every process is assumed
/// alive.
fn process_is_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}

fn conflict(layout: &InstallLayout, holder: &str) -> UpdateError {
    let detail = if holder.is_empty() {
        String::new()
    } else {
        format!(" (run_id={holder})")
    };
    UpdateError::Conflict(format!(
        "an update run is already in progress{detail}; if no update is running, remove {}",
        layout.run_active_path().display()
    ))
}

pub fn write_run_state(layout: &InstallLayout, state: &RunState) -> Result<()> {
    let path = layout.run_status_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let staged = path.with_extension("json.part");
    let payload = serde_json::to_vec_pretty(state).context("failed to encode run status")?;
    fs::write(&staged, payload)
        .with_context(|| format!("failed to write run status: {}", staged.display()))?;
    fs::rename(&staged, &path)
        .with_context(|| format!("failed to move run status: {}", path.display()))?;
    Ok(())
}

pub fn read_run_state(layout: &InstallLayout) -> Result<Option<RunState>> {
    let path = layout.run_status_path();
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read run status: {}", path.display()));
        }
    };

    let state = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse run status: {}", path.display()))?;
    Ok(Some(state))
}
