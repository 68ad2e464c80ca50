//! Recovery key generation, persistence, and discovery.
//!
//! A recovery key is a plain LUKS passphrase drawn from the URL-safe base64
//! alphabet, so it can be typed at an initramfs prompt and never needs shell
//! quoting. Files on disk are re-validated every time they are loaded.

use crate::config::SlotkeeperConfig;
use crate::error::{SlotkeeperError, SlotkeeperResult};
use crate::files::{ensure_private_dir, rotate_aside, write_atomic};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Local;
use log::warn;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use zeroize::Zeroizing;

pub const RECOVERY_FILE_NAME: &str = "recovery-key.txt";
const LEGACY_PREFIX: &str = ".luks-recovery-key-";
const KEY_BYTES: usize = 32;
const HEADER_PREFIX: &str = "LUKS Recovery Key for ";
const DATE_PREFIX: &str = "Generated on: ";
const VALUE_PREFIX: &str = "Recovery Key: ";

/// Fresh 256-bit recovery key, URL-safe base64 encoded.
pub fn generate_recovery_key() -> Zeroizing<String> {
    let mut raw = Zeroizing::new([0u8; KEY_BYTES]);
    OsRng.fill_bytes(raw.as_mut());
    Zeroizing::new(URL_SAFE.encode(raw.as_ref()))
}

/// Charset check applied to every key before it is used: `^[A-Za-z0-9_=-]+$`.
pub fn is_valid_recovery_key(value: &str) -> bool {
    static KEY_RE: OnceLock<Regex> = OnceLock::new();
    KEY_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_=-]+$").expect("valid recovery key regex"))
        .is_match(value)
}

/// A recovery key together with the file it lives in.
#[derive(Clone)]
pub struct RecoveryKeyRecord {
    pub device: String,
    pub created: String,
    pub value: Zeroizing<String>,
    pub path: PathBuf,
}

impl fmt::Debug for RecoveryKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryKeyRecord")
            .field("device", &self.device)
            .field("created", &self.created)
            .field("value", &"<redacted>")
            .field("path", &self.path)
            .finish()
    }
}

impl RecoveryKeyRecord {
    /// Build a record for `device`, refusing values outside the charset.
    pub fn new(device: &Path, value: Zeroizing<String>, path: PathBuf) -> SlotkeeperResult<Self> {
        if !is_valid_recovery_key(&value) {
            return Err(SlotkeeperError::InvalidRecoveryKey {
                path,
                reason: "value contains characters outside [A-Za-z0-9_=-]".into(),
            });
        }
        Ok(Self {
            device: device.display().to_string(),
            created: Local::now().format("%Y-%m-%d %H:%M:%S %z").to_string(),
            value,
            path,
        })
    }

    /// Three-line on-disk representation.
    pub fn render(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "{HEADER_PREFIX}{}\n{DATE_PREFIX}{}\n{VALUE_PREFIX}{}\n",
            self.device,
            self.created,
            self.value.as_str()
        ))
    }

    /// Write the record to `self.path` with mode 600.
    ///
    /// An existing file at that path is moved aside first; its new name is
    /// returned.
    pub fn write(&self) -> SlotkeeperResult<Option<PathBuf>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(parent)?;
        }
        let rotated = rotate_aside(&self.path)?;
        if let Some(old) = &rotated {
            warn!(
                "previous recovery key file moved to {} (not deleted)",
                old.display()
            );
        }
        write_atomic(&self.path, self.render().as_bytes(), 0o600)?;
        Ok(rotated)
    }

    /// Load and re-validate a recovery key file.
    pub fn load(path: &Path) -> SlotkeeperResult<Self> {
        let invalid = |reason: &str| SlotkeeperError::InvalidRecoveryKey {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let contents = Zeroizing::new(fs::read_to_string(path)?);
        if let Ok(meta) = fs::metadata(path) {
            if meta.permissions().mode() & 0o077 != 0 {
                warn!(
                    "recovery key file {} is readable by group/others; run chmod 600 on it",
                    path.display()
                );
            }
        }

        let mut device = None;
        let mut created = None;
        let mut value = None;
        for line in contents.lines() {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix(HEADER_PREFIX) {
                device = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix(DATE_PREFIX) {
                created = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix(VALUE_PREFIX) {
                value = Some(Zeroizing::new(rest.trim().to_string()));
            }
        }

        let value = value.ok_or_else(|| invalid("missing `Recovery Key:` line"))?;
        if value.is_empty() {
            return Err(invalid("recovery key value is empty"));
        }
        if !is_valid_recovery_key(&value) {
            return Err(invalid("value contains characters outside [A-Za-z0-9_=-]"));
        }

        Ok(Self {
            device: device.unwrap_or_default(),
            created: created.unwrap_or_default(),
            value,
            path: path.to_path_buf(),
        })
    }

    /// Whether the file names `device` (or names no device at all).
    pub fn applies_to(&self, device: &Path) -> bool {
        self.device.is_empty() || Path::new(&self.device) == device
    }

    /// Short SHA-256 fingerprint safe to print in reports.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.value.as_bytes());
        hex::encode(&digest[..6])
    }
}

/// Where setup writes a new recovery key.
pub fn default_recovery_path(config: &SlotkeeperConfig) -> PathBuf {
    Path::new(&config.recovery.directory).join(RECOVERY_FILE_NAME)
}

/// Recovery key files found on disk, split by whether they validated.
#[derive(Debug, Default)]
pub struct DiscoveredKeys {
    pub valid: Vec<RecoveryKeyRecord>,
    pub invalid: Vec<SlotkeeperError>,
}

/// Scan the configured directory and the legacy location for recovery keys.
pub fn discover_recovery_keys(config: &SlotkeeperConfig) -> DiscoveredKeys {
    let mut candidates = Vec::new();

    let primary = default_recovery_path(config);
    if primary.is_file() {
        candidates.push(primary);
    }

    if let Ok(entries) = fs::read_dir(&config.recovery.legacy_dir) {
        let mut legacy: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name.starts_with(LEGACY_PREFIX) && name.ends_with(".txt"))
                        .unwrap_or(false)
            })
            .collect();
        // Newest timestamp first.
        legacy.sort();
        legacy.reverse();
        candidates.extend(legacy);
    }

    let mut found = DiscoveredKeys::default();
    for path in candidates {
        match RecoveryKeyRecord::load(&path) {
            Ok(record) => found.valid.push(record),
            Err(err) => {
                warn!("ignoring recovery key file {}: {err}", path.display());
                found.invalid.push(err);
            }
        }
    }
    found
}
