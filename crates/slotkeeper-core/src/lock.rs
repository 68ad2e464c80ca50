//! Advisory per-device lock so only one slotkeeper process mutates a header.

use crate::error::{SlotkeeperError, SlotkeeperResult};
use crate::files::device_slug;
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Held lock on one device; released on drop.
#[derive(Debug)]
pub struct DeviceLock {
    path: PathBuf,
    device: PathBuf,
}

impl DeviceLock {
    /// Take `<lock_dir>/<device>.lock`, reclaiming it once if its owner is gone.
    pub fn acquire(lock_dir: &Path, device: &Path) -> SlotkeeperResult<Self> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{}.lock", device_slug(device)));

        for attempt in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    debug!("acquired {}", path.display());
                    return Ok(Self {
                        path,
                        device: device.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .map(|raw| raw.trim().to_string())
                        .unwrap_or_default();
                    if attempt == 0 && !pid_alive(&holder) {
                        warn!(
                            "reclaiming stale lock {} left by pid `{holder}`",
                            path.display()
                        );
                        fs::remove_file(&path)?;
                        continue;
                    }
                    return Err(SlotkeeperError::DeviceBusy {
                        device: device.to_path_buf(),
                        pid: holder,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(SlotkeeperError::DeviceBusy {
            device: device.to_path_buf(),
            pid: "unknown".into(),
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to release lock {}: {err}", self.path.display());
        }
    }
}

fn pid_alive(pid: &str) -> bool {
    pid.parse::<u32>()
        .map(|pid| Path::new("/proc").join(pid.to_string()).exists())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = tempdir().unwrap();
        let device = Path::new("/dev/vda3");

        let held = DeviceLock::acquire(dir.path(), device).unwrap();
        let err = DeviceLock::acquire(dir.path(), device).unwrap_err();
        assert!(matches!(err, SlotkeeperError::DeviceBusy { .. }));

        drop(held);
        DeviceLock::acquire(dir.path(), device).unwrap();
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let device = Path::new("/dev/vda3");
        fs::write(dir.path().join("dev_vda3.lock"), "4000000000\n").unwrap();

        let lock = DeviceLock::acquire(dir.path(), device).unwrap();
        assert_eq!(lock.device(), device);
    }

    #[test]
    fn distinct_devices_do_not_contend() {
        let dir = tempdir().unwrap();
        let _a = DeviceLock::acquire(dir.path(), Path::new("/dev/vda3")).unwrap();
        let _b = DeviceLock::acquire(dir.path(), Path::new("/dev/vdb1")).unwrap();
    }
}
