//! Append-only audit trail for header mutations.

use crate::error::SlotkeeperResult;
use chrono::{DateTime, Local, SecondsFormat};
use log::warn;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Kind of mutation being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Backup,
    RemoveAttempt,
    RemoveSuccess,
    RemoveFailed,
    AddKey,
    AddKeyFailed,
    Wipe,
    WipeFailed,
    Enroll,
    EnrollFailed,
    ForceOverride,
    RecoveryKeyWritten,
    CrypttabUpdated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Backup => "BACKUP",
            AuditAction::RemoveAttempt => "REMOVE_ATTEMPT",
            AuditAction::RemoveSuccess => "REMOVE_SUCCESS",
            AuditAction::RemoveFailed => "REMOVE_FAILED",
            AuditAction::AddKey => "ADD_KEY",
            AuditAction::AddKeyFailed => "ADD_KEY_FAILED",
            AuditAction::Wipe => "WIPE_TPM2",
            AuditAction::WipeFailed => "WIPE_TPM2_FAILED",
            AuditAction::Enroll => "ENROLL",
            AuditAction::EnrollFailed => "ENROLL_FAILED",
            AuditAction::ForceOverride => "FORCE_OVERRIDE",
            AuditAction::RecoveryKeyWritten => "RECOVERY_KEY_WRITTEN",
            AuditAction::CrypttabUpdated => "CRYPTTAB_UPDATED",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the audit log.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Local>,
    pub action: AuditAction,
    pub device: PathBuf,
    pub slot: Option<u8>,
    pub outcome: String,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        device: &Path,
        slot: Option<u8>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Local::now(),
            action,
            device: device.to_path_buf(),
            slot,
            outcome: outcome.into(),
        }
    }

    /// `<rfc3339> <ACTION> device=<dev> slot=<n|-> outcome=<text>`
    pub fn render(&self) -> String {
        let slot = self
            .slot
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let outcome: String = self
            .outcome
            .chars()
            .map(|ch| if ch.is_control() { ' ' } else { ch })
            .collect();
        format!(
            "{} {} device={} slot={} outcome={}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.action,
            self.device.display(),
            slot,
            outcome.trim()
        )
    }
}

/// Handle on the audit log file. Entries are only ever appended.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry, failing if the log cannot be written.
    pub fn record(
        &self,
        action: AuditAction,
        device: &Path,
        slot: Option<u8>,
        outcome: impl Into<String>,
    ) -> SlotkeeperResult<()> {
        self.append(&AuditEntry::new(action, device, slot, outcome))
    }

    /// Append an entry after the fact; a write failure is logged, not raised,
    /// because the mutation it describes already happened.
    pub fn record_after(
        &self,
        action: AuditAction,
        device: &Path,
        slot: Option<u8>,
        outcome: impl Into<String>,
    ) {
        let entry = AuditEntry::new(action, device, slot, outcome);
        if let Err(err) = self.append(&entry) {
            warn!(
                "failed to append to audit log {}: {err}; entry was: {}",
                self.path.display(),
                entry.render()
            );
        }
    }

    fn append(&self, entry: &AuditEntry) -> SlotkeeperResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.path)?;
        writeln!(file, "{}", entry.render())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn appends_one_line_per_entry() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("logs").join("audit.log"));
        let device = Path::new("/dev/sda3");

        log.record(AuditAction::RemoveAttempt, device, Some(4), "duplicate tpm2")
            .unwrap();
        log.record_after(AuditAction::RemoveFailed, device, Some(4), "exit 1\nNo key available");

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("REMOVE_ATTEMPT device=/dev/sda3 slot=4 outcome=duplicate tpm2"));
        assert!(lines[1].ends_with("outcome=exit 1 No key available"));

        let mode = fs::metadata(log.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn reopening_keeps_previous_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        AuditLog::new(&path)
            .record(AuditAction::Backup, Path::new("/dev/vda2"), None, "ok")
            .unwrap();
        AuditLog::new(&path)
            .record(AuditAction::Enroll, Path::new("/dev/vda2"), Some(1), "ok")
            .unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("BACKUP device=/dev/vda2 slot=-"));
        assert!(contents.contains("ENROLL device=/dev/vda2 slot=1"));
    }
}
