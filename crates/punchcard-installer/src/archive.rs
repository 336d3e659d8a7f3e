use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use punchcard_security::{sha256_file_hex, verify_sha256_file};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactFacts {
    pub kind: ArchiveKind,
    pub size: u64,
    pub sha256: String,
    pub entries: usize,
}

pub struct ArtifactExpectations<'a> {
    pub min_bytes: u64,
    pub size: Option<u64>,
    pub sha256: Option<&'a str>,
}

pub fn detect_archive_kind(header: &[u8]) -> Option<ArchiveKind> {
    if header.starts_with(b"PK\x03\x04") {
        return Some(ArchiveKind::Zip);
    }
    if header.starts_with(&[0x1f, 0x8b]) {
        return Some(ArchiveKind::TarGz);
    }
    None
}

/// Checks everything that can be checked without extracting: size, digest,
/// container type, and that every listed entry stays inside the archive root.
pub fn inspect_artifact(path: &Path, expect: &ArtifactExpectations<'_>) -> Result<ArtifactFacts> {
    let size = fs::metadata(path)
        .with_context(|| format!("failed to stat artifact {}", path.display()))?
        .len();
    if size < expect.min_bytes {
        return Err(anyhow!(
            "artifact is {size} bytes, below the {} byte minimum",
            expect.min_bytes
        ));
    }
    if let Some(expected) = expect.size {
        if expected != size {
            return Err(anyhow!(
                "artifact is {size} bytes but the release declares {expected}"
            ));
        }
    }

    let mut header = [0_u8; 4];
    let read = File::open(path)
        .and_then(|mut file| file.read(&mut header))
        .with_context(|| format!("failed to read artifact header {}", path.display()))?;
    let kind = detect_archive_kind(&header[..read])
        .ok_or_else(|| anyhow!("artifact is neither a zip nor a gzip-compressed tar archive"))?;

    let sha256 = match expect.sha256 {
        Some(expected) => verify_sha256_file(path, expected)?,
        None => sha256_file_hex(path)?,
    };

    let entries = list_entries(path, kind)?;
    if entries.is_empty() {
        return Err(anyhow!("artifact archive is empty"));
    }
    for entry in &entries {
        ensure_contained(entry)?;
    }

    Ok(ArtifactFacts {
        kind,
        size,
        sha256,
        entries: entries.len(),
    })
}

pub fn extract_artifact(path: &Path, kind: ArchiveKind, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    match kind {
        ArchiveKind::TarGz => run_command(
            Command::new("tar")
                .arg("-xzf")
                .arg(path)
                .arg("-C")
                .arg(dst),
            "failed to extract tar archive",
        ),
        ArchiveKind::Zip => {
            let mut unzip_command = Command::new("unzip");
            unzip_command.arg("-q").arg("-o").arg(path).arg("-d").arg(dst);
            if run_command(&mut unzip_command, "failed to extract zip archive with unzip")
                .is_ok()
            {
                return Ok(());
            }
            run_command(
                Command::new("tar").arg("-xf").arg(path).arg("-C").arg(dst),
                "failed to extract zip archive with tar fallback",
            )
        }
    }
}

/// The directory holding every publishing root. Source archives wrap their
/// content in one top-level directory, which is descended into.
pub fn locate_payload_root(extract_dir: &Path, app_roots: &[PathBuf]) -> Result<PathBuf> {
    let has_roots = |dir: &Path| app_roots.iter().all(|root| dir.join(root).is_dir());
    if has_roots(extract_dir) {
        return Ok(extract_dir.to_path_buf());
    }

    let children = fs::read_dir(extract_dir)
        .with_context(|| format!("failed to read {}", extract_dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list {}", extract_dir.display()))?;
    if let [only] = children.as_slice() {
        let candidate = only.path();
        if only.file_type()?.is_dir() && has_roots(&candidate) {
            return Ok(candidate);
        }
    }

    let expected = app_roots
        .iter()
        .map(|root| root.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(anyhow!(
        "artifact does not contain the expected publishing roots ({expected})"
    ))
}

fn list_entries(path: &Path, kind: ArchiveKind) -> Result<Vec<String>> {
    let stdout = match kind {
        ArchiveKind::TarGz => run_command_output(
            Command::new("tar").arg("-tzf").arg(path),
            "artifact is not a readable tar archive",
        )?,
        ArchiveKind::Zip => run_command_output(
            Command::new("unzip").arg("-Z1").arg(path),
            "artifact is not a readable zip archive",
        )?,
    };
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn ensure_contained(entry: &str) -> Result<()> {
    let escapes = Path::new(entry).components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(anyhow!(
            "artifact entry '{entry}' points outside the archive root"
        ));
    }
    Ok(())
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    run_command_output(command, context_message).map(|_| ())
}

fn run_command_output(command: &mut Command, context_message: &str) -> Result<String> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
