//! Header snapshots taken before every mutation.

use crate::error::SlotkeeperResult;
use crate::files::{device_slug, ensure_private_dir, timestamp_slug};
use slotkeeper_provider::luks::LuksHeader;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Directory of `luksDump` snapshots, one file per mutation.
#[derive(Debug, Clone)]
pub struct HeaderBackups {
    dir: PathBuf,
}

impl HeaderBackups {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `header.raw` to `<dir>/<device>-<timestamp>.luksdump` (mode 600).
    pub fn write(&self, device: &Path, header: &LuksHeader) -> SlotkeeperResult<PathBuf> {
        ensure_private_dir(&self.dir)?;
        let stem = format!("{}-{}", device_slug(device), timestamp_slug());

        for counter in 0u32..1000 {
            let name = if counter == 0 {
                format!("{stem}.luksdump")
            } else {
                format!("{stem}-{counter}.luksdump")
            };
            let path = self.dir.join(name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(mut file) => {
                    writeln!(file, "# slotkeeper header snapshot of {}", device.display())?;
                    file.write_all(header.raw.as_bytes())?;
                    file.sync_all()?;
                    return Ok(path);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("too many header backups named {stem} in {}", self.dir.display()),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotkeeper_provider::luks::LuksVersion;
    use std::fs;
    use tempfile::tempdir;

    fn header(raw: &str) -> LuksHeader {
        LuksHeader {
            version: LuksVersion::Luks2,
            uuid: None,
            keyslots: Vec::new(),
            tokens: Vec::new(),
            warnings: Vec::new(),
            raw: raw.into(),
        }
    }

    #[test]
    fn consecutive_backups_get_distinct_files() {
        let dir = tempdir().unwrap();
        let backups = HeaderBackups::new(dir.path().join("backups"));
        let device = Path::new("/dev/vda3");

        let first = backups.write(device, &header("Version: 2\n")).unwrap();
        let second = backups.write(device, &header("Version: 2\n")).unwrap();
        assert_ne!(first, second);
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("dev_vda3-"));
        assert!(fs::read_to_string(&second).unwrap().contains("Version: 2"));
    }
}
