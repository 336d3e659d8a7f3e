use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

pub fn remove_path_if_exists(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("failed to remove file {}", path.display()))
    }
}

/// Writes `src` next to `dst` first and renames it into place, so a reader
/// never observes a half-written `dst`.
pub fn replace_file_staged(src: &Path, dst: &Path) -> Result<u64> {
    let parent = dst
        .parent()
        .ok_or_else(|| anyhow!("destination has no parent: {}", dst.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let file_name = dst
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file");
    let staged = parent.join(format!(".{file_name}.punchcard-new"));
    let copied = fs::copy(src, &staged)
        .with_context(|| format!("failed to stage {} at {}", src.display(), staged.display()))?;

    if let Err(err) = fs::rename(&staged, dst) {
        let _ = fs::remove_file(&staged);
        return Err(err)
            .with_context(|| format!("failed to move staged file into place: {}", dst.display()));
    }
    Ok(copied)
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    copy_dir_filtered(src, dst, &mut |_| false)
}

/// Recursive copy that skips every entry for which `skip` returns true.
/// `skip` receives the path relative to `src`.
pub fn copy_dir_filtered(
    src: &Path,
    dst: &Path,
    skip: &mut dyn FnMut(&Path) -> bool,
) -> Result<()> {
    copy_dir_filtered_inner(src, src, dst, skip)
}

fn copy_dir_filtered_inner(
    root: &Path,
    current: &Path,
    dst: &Path,
    skip: &mut dyn FnMut(&Path) -> bool,
) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in
        fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let rel = src_path
            .strip_prefix(root)
            .with_context(|| format!("failed to relativize {}", src_path.display()))?;
        if skip(rel) {
            continue;
        }

        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)
            .with_context(|| format!("failed to stat {}", src_path.display()))?;
        if metadata.is_dir() {
            copy_dir_filtered_inner(root, &src_path, &dst_path, skip)?;
            continue;
        }

        #[cfg(unix)]
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&src_path)
                .with_context(|| format!("failed to read symlink {}", src_path.display()))?;
            std::os::unix::fs::symlink(&target, &dst_path).with_context(|| {
                format!(
                    "failed to create symlink {} -> {}",
                    dst_path.display(),
                    target.display()
                )
            })?;
            continue;
        }

        fs::copy(&src_path, &dst_path).with_context(|| {
            format!(
                "failed to copy {} to {}",
                src_path.display(),
                dst_path.display()
            )
        })?;
    }
    Ok(())
}

/// Regular files under `root`, relative to it, in sorted walk order.
pub fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files_inner(root, root, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files_inner(root: &Path, current: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(current)
        .with_context(|| format!("failed to read {}", current.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list {}", current.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files_inner(root, &path, files)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .with_context(|| format!("failed to relativize {}", path.display()))?;
            files.push(rel.to_path_buf());
        }
    }
    Ok(())
}

pub fn path_size(path: &Path) -> Result<u64> {
    let metadata =
        fs::symlink_metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0_u64;
    for rel in collect_files(path)? {
        let file = path.join(&rel);
        total += fs::metadata(&file)
            .with_context(|| format!("failed to stat {}", file.display()))?
            .len();
    }
    Ok(total)
}
