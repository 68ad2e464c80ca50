//! Provider contract for LUKS header inspection and keyslot mutation.
//!
//! Backends shell out to `cryptsetup` plus one TPM2 enrollment framework and
//! hand back structured header data. Nothing here caches header state: every
//! read reflects the device as it is right now.

use crate::pcr::PcrSpec;
use crate::BackendKind;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// On-disk LUKS format revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuksVersion {
    Luks1,
    Luks2,
}

impl LuksVersion {
    /// Map the numeric `Version:` field from `luksDump`.
    pub fn from_number(value: u32) -> Option<Self> {
        match value {
            1 => Some(LuksVersion::Luks1),
            2 => Some(LuksVersion::Luks2),
            _ => None,
        }
    }

    /// Number of keyslots the format can hold.
    pub fn max_slots(&self) -> u8 {
        match self {
            LuksVersion::Luks1 => 8,
            LuksVersion::Luks2 => 32,
        }
    }
}

impl fmt::Display for LuksVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuksVersion::Luks1 => f.write_str("LUKS1"),
            LuksVersion::Luks2 => f.write_str("LUKS2"),
        }
    }
}

/// A block device that passed the LUKS header check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksDevice {
    pub path: PathBuf,
    pub version: LuksVersion,
    pub uuid: Option<String>,
}

/// One keyslot entry as reported by `luksDump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyslot {
    pub index: u8,
    pub enabled: bool,
    /// LUKS2 keyslot type (`luks2`, `reencrypt`, ...); `None` on LUKS1.
    pub slot_type: Option<String>,
    /// LUKS2 keyslot priority (`normal`, `prefer`, `ignore`).
    pub priority: Option<String>,
    /// LUKS2 `(unbound)` keyslot: holds a key that cannot open the data segment.
    pub unbound: bool,
}

/// LUKS2 token metadata linking keyslots to a non-passphrase unlock method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: u32,
    pub token_type: String,
    pub keyslots: Vec<u8>,
    /// Type-specific fields such as `tpm2-hash-pcrs` or the clevis `pin`.
    pub fields: BTreeMap<String, String>,
}

/// Parsed view of a LUKS header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksHeader {
    pub version: LuksVersion,
    pub uuid: Option<String>,
    pub keyslots: Vec<Keyslot>,
    pub tokens: Vec<Token>,
    /// Lines the parser could not place; non-empty means the header is only
    /// trustworthy for reporting.
    pub warnings: Vec<String>,
    /// Verbatim `luksDump` text, kept for header backups.
    pub raw: String,
}

impl LuksHeader {
    /// Indices of every enabled keyslot in ascending order.
    pub fn enabled_slots(&self) -> Vec<u8> {
        let mut slots: Vec<u8> = self
            .keyslots
            .iter()
            .filter(|slot| slot.enabled)
            .map(|slot| slot.index)
            .collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    pub fn is_enabled(&self, index: u8) -> bool {
        self.keyslots
            .iter()
            .any(|slot| slot.index == index && slot.enabled)
    }

    pub fn keyslot(&self, index: u8) -> Option<&Keyslot> {
        self.keyslots.iter().find(|slot| slot.index == index)
    }
}

/// Row from an enrollment listing (`systemd-cryptenroll DEV` or `clevis luks list`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentEntry {
    pub slot: u8,
    /// Method name as printed by the tool (`password`, `tpm2`, `recovery`, `tang`, `sss`, ...).
    pub method: String,
    /// Extra detail such as the clevis pin configuration JSON.
    pub detail: Option<String>,
}

impl EnrollmentEntry {
    pub fn is_tpm2(&self) -> bool {
        self.method.eq_ignore_ascii_case("tpm2")
            || self
                .detail
                .as_deref()
                .map(|detail| detail.contains("tpm2"))
                .unwrap_or(false)
    }
}

/// Outcome of the backend tool availability/version probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolingReport {
    pub tool: String,
    pub version: Option<String>,
    pub notes: Vec<String>,
    /// Caveats about how secrets reach the tool.
    pub security: Vec<String>,
}

/// Abstraction over one TPM2 enrollment framework plus `cryptsetup`.
///
/// Every method that mutates the header takes the authenticating secret as raw
/// bytes. Implementations must deliver it over stdin or a private temp file,
/// never through argv.
pub trait LuksBackend {
    type Error: Error + Send + Sync + 'static;

    /// Identify which enrollment framework backs this instance.
    fn kind(&self) -> BackendKind;

    /// Whether a single TPM2-bound slot can be test-unlocked in isolation.
    fn supports_slot_unlock_test(&self) -> bool;

    /// Confirm the backend tooling is installed and recent enough.
    fn check_tooling(&self) -> Result<ToolingReport, Self::Error>;

    /// Verify `device` is a block device carrying a LUKS header.
    fn inspect_device(&self, device: &Path) -> Result<LuksDevice, Self::Error>;

    /// Read and parse the current header.
    fn read_header(&self, device: &Path) -> Result<LuksHeader, Self::Error>;

    /// List the backend's own view of enrolled methods.
    fn read_enrollment(&self, device: &Path) -> Result<Vec<EnrollmentEntry>, Self::Error>;

    /// Test `secret` against one slot (or any slot when `slot` is `None`).
    ///
    /// A wrong secret is `Ok(false)`, not an error.
    fn test_passphrase(
        &self,
        device: &Path,
        slot: Option<u8>,
        secret: &[u8],
    ) -> Result<bool, Self::Error>;

    /// Try to unlock a single TPM2-bound slot.
    ///
    /// `Ok(None)` means the backend cannot answer (unsupported or timed out).
    fn test_tpm2_slot(&self, device: &Path, slot: u8) -> Result<Option<bool>, Self::Error>;

    /// Add `new_secret` as a passphrase, authenticating with `auth`.
    fn add_key(
        &self,
        device: &Path,
        auth: &[u8],
        new_secret: &[u8],
        slot: Option<u8>,
    ) -> Result<(), Self::Error>;

    /// Destroy keyslot `slot` (and any token bound to it).
    fn remove_slot(&self, device: &Path, auth: &[u8], slot: u8) -> Result<(), Self::Error>;

    /// Bind a new TPM2-sealed keyslot using the given PCR policy.
    fn enroll_tpm2(&self, device: &Path, auth: &[u8], pcrs: &PcrSpec) -> Result<(), Self::Error>;

    /// Remove every TPM2-bound keyslot and token.
    fn wipe_tpm2(&self, device: &Path, auth: &[u8]) -> Result<(), Self::Error>;

    /// Post-enrollment boot integration (crypttab options, initramfs hints).
    ///
    /// Returns human-readable notes describing what was changed or what the
    /// operator still has to do.
    fn integrate_boot(&self, device: &LuksDevice) -> Result<Vec<String>, Self::Error>;
}
