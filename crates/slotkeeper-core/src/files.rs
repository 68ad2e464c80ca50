//! File persistence helpers shared by recovery keys, header backups, and
//! crypttab edits.

use crate::error::{SlotkeeperError, SlotkeeperResult};
use chrono::Local;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Local timestamp usable in file names (`20261019-142501`).
pub fn timestamp_slug() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Flatten a device path into a file-name-safe token (`/dev/sda3` -> `dev_sda3`).
pub fn device_slug(device: &Path) -> String {
    let raw = device.to_string_lossy();
    let slug: String = raw
        .trim_start_matches('/')
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "device".to_string()
    } else {
        slug
    }
}

/// Create `dir` (and parents) with owner-only permissions when missing.
pub fn ensure_private_dir(dir: &Path) -> SlotkeeperResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    Ok(())
}

/// Atomically replace `path` with `contents`, applying `mode`.
///
/// The payload is staged in a temp file next to the destination and renamed
/// over it, so readers never observe a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> SlotkeeperResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))?;
    let _ = temp.as_file().sync_all();
    temp.persist(path)
        .map_err(|err| SlotkeeperError::Io(err.error))?;
    let _ = sync_parent_dir(parent);
    Ok(())
}

/// Move an existing file aside to `<path>.bak.<timestamp>`; returns the new name.
pub fn rotate_aside(path: &Path) -> SlotkeeperResult<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let target = unique_sibling(path, &format!("bak.{}", timestamp_slug()));
    fs::rename(path, &target)?;
    let _ = path.parent().map(sync_parent_dir);
    Ok(Some(target))
}

/// Copy `path` to `<path>.backup.<timestamp>` keeping its permissions.
pub fn backup_copy(path: &Path) -> SlotkeeperResult<PathBuf> {
    let target = unique_sibling(path, &format!("backup.{}", timestamp_slug()));
    fs::copy(path, &target)?;
    Ok(target)
}

fn unique_sibling(path: &Path, suffix: &str) -> PathBuf {
    let base = format!("{}.{suffix}", path.display());
    let mut candidate = PathBuf::from(&base);
    let mut counter = 1u32;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.{counter}"));
        counter += 1;
    }
    candidate
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}
