//! Locating the external binaries slotkeeper drives.

use slotkeeper_core::error::{SlotkeeperError, SlotkeeperResult};
use std::env;
use std::path::{Path, PathBuf};

const SYSTEM_BIN_DIRS: &[&str] = &["/usr/sbin", "/usr/bin", "/sbin", "/bin", "/usr/local/sbin"];

/// Package that ships a binary, used for install hints.
fn package_for(binary: &str) -> &'static str {
    match binary {
        "cryptsetup" => "cryptsetup",
        "clevis" => "clevis clevis-luks clevis-tpm2",
        "systemd-cryptenroll" => "systemd (>= 248)",
        "tpm2_pcrread" => "tpm2-tools",
        "lsblk" => "util-linux",
        "mokutil" => "mokutil",
        _ => "the package providing it",
    }
}

/// Resolve `binary`: explicit override first (must exist), then the usual
/// system directories, then `PATH`.
pub fn resolve_binary(binary: &str, configured: Option<&str>) -> SlotkeeperResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(SlotkeeperError::InvalidConfig(format!(
                "{binary} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for dir in SYSTEM_BIN_DIRS {
        let candidate = Path::new(dir).join(binary);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    find_in_path(binary).ok_or_else(|| SlotkeeperError::Prerequisite {
        message: format!("unable to locate {binary}; tried {SYSTEM_BIN_DIRS:?} and PATH"),
        remediation: Some(format!("install {}", package_for(binary))),
    })
}

/// Like [`resolve_binary`] but treats "not installed" as `None`. A broken
/// override is still an error.
pub fn optional_binary(binary: &str, configured: Option<&str>) -> SlotkeeperResult<Option<PathBuf>> {
    match resolve_binary(binary, configured) {
        Ok(path) => Ok(Some(path)),
        Err(SlotkeeperError::Prerequisite { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_override_is_a_config_error() {
        let err = resolve_binary("cryptsetup", Some("/nonexistent/cryptsetup")).unwrap_err();
        assert!(matches!(err, SlotkeeperError::InvalidConfig(_)));
        assert!(optional_binary("cryptsetup", Some("/nonexistent/cryptsetup")).is_err());
    }

    #[test]
    fn unknown_binary_is_a_prerequisite_with_hint() {
        let err = resolve_binary("slotkeeper-no-such-tool", None).unwrap_err();
        assert!(err.remediation().is_some());
        assert_eq!(optional_binary("slotkeeper-no-such-tool", None).unwrap(), None);
    }

    #[test]
    fn override_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("cryptsetup");
        std::fs::write(&fake, "#!/bin/sh\n").unwrap();
        let resolved = resolve_binary("cryptsetup", fake.to_str()).unwrap();
        assert_eq!(resolved, fake);
    }
}
