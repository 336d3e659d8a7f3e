use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriticalPathSet {
    entries: BTreeSet<PathBuf>,
}

impl CriticalPathSet {
    pub fn new<I, S>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = BTreeSet::new();
        for raw in paths {
            entries.insert(normalize_relative_path(raw.as_ref())?);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact match or component-wise prefix match: `backend/keys` covers
    /// `backend/keys/app.pem` but not `backend/keys-old/app.pem`.
    pub fn matches(&self, rel: &Path) -> bool {
        let normalized = normalize_components(rel);
        self.entries
            .iter()
            .any(|entry| normalized == *entry || normalized.starts_with(entry))
    }
}

pub fn normalize_relative_path(raw: &str) -> Result<PathBuf> {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(anyhow!("relative path must not be empty"));
    }
    if unified.starts_with('/') {
        return Err(anyhow!("path '{raw}' must be relative to the install root"));
    }

    let mut out = PathBuf::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(anyhow!("path '{raw}' must not contain '..'"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("path '{raw}' must be relative to the install root"));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(anyhow!("path '{raw}' resolves to the install root itself"));
    }
    Ok(out)
}

fn normalize_components(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}
