//! Host facts that are not tied to a single LUKS device: TPM presence, PCR
//! values, block-device discovery, and firmware/boot state.

use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;

/// Whether a usable TPM 2.0 device is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmPresence {
    Present {
        device: PathBuf,
        /// Major spec version from sysfs, when readable.
        version: Option<String>,
        manufacturer: Option<String>,
    },
    Absent(String),
}

impl TpmPresence {
    pub fn is_present(&self) -> bool {
        matches!(self, TpmPresence::Present { .. })
    }
}

/// Firmware Secure Boot state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureBootState {
    Enabled,
    Disabled,
    Unknown(String),
}

/// Firmware boot mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareMode {
    Uefi,
    Legacy,
}

/// Block device carrying a `crypto_LUKS` signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub size: Option<String>,
    pub uuid: Option<String>,
}

/// One non-comment line of `/etc/crypttab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrypttabEntry {
    pub name: String,
    pub source: String,
    pub key_file: Option<String>,
    pub options: Vec<String>,
}

impl CrypttabEntry {
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|opt| opt == option)
    }
}

/// Read-only access to host-level facts.
pub trait Platform {
    type Error: Error + Send + Sync + 'static;

    /// Detect the TPM 2.0 character device.
    fn tpm_presence(&self) -> TpmPresence;

    /// Read the requested PCRs from `bank`, returning lowercase hex digests.
    fn read_pcrs(&self, bank: &str, indices: &[u8]) -> Result<BTreeMap<u8, String>, Self::Error>;

    /// Enumerate block devices with a LUKS signature.
    fn discover_luks_devices(&self) -> Result<Vec<BlockDeviceInfo>, Self::Error>;

    fn firmware_mode(&self) -> FirmwareMode;

    fn secure_boot(&self) -> SecureBootState;

    /// Initramfs hooks relevant to TPM2 unlock that are installed on the host.
    fn initramfs_hooks(&self) -> Vec<String>;

    /// Parsed crypttab entries; a missing file is an empty list.
    fn crypttab(&self) -> Result<Vec<CrypttabEntry>, Self::Error>;
}
