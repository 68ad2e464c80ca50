//! Error taxonomy shared by every slotkeeper crate.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type SlotkeeperResult<T> = Result<T, SlotkeeperError>;

#[derive(Debug, Error)]
pub enum SlotkeeperError {
    #[error("{0} is not a block device")]
    NotBlockDevice(PathBuf),

    #[error("{0} does not carry a valid LUKS header")]
    NotLuks(PathBuf),

    #[error("{message} (exit code {status})")]
    BackendFailed {
        tool: String,
        status: i32,
        message: String,
        stderr: String,
    },

    #[error("unable to parse {what}: {reason}")]
    ParseFailed { what: String, reason: String },

    #[error("{tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("refusing to remove slots {slots:?}: no enabled keyslot would remain")]
    WouldLockOut { slots: Vec<u8> },

    #[error("refusing to remove slots {slots:?}: no password, recovery, or TPM2 slot would remain")]
    NoFallbackAuth { slots: Vec<u8> },

    #[error(
        "refusing to remove slots {slots:?}: only {remaining} authentication method(s) would remain (minimum {minimum})"
    )]
    BelowMinimumAuthMethods {
        slots: Vec<u8>,
        remaining: usize,
        minimum: usize,
    },

    #[error("slot {slot} is classified `{kind}` and needs an explicit, individually confirmed removal")]
    UnconfirmedSlot { slot: u8, kind: String },

    #[error("slot {slot} is not an enabled keyslot on {device}")]
    SlotNotEnabled { device: PathBuf, slot: u8 },

    #[error("header of {0} could not be fully parsed; automatic changes are disabled for it")]
    UntrustedHeader(PathBuf),

    #[error("prerequisite check failed: {message}")]
    Prerequisite {
        message: String,
        remediation: Option<String>,
    },

    #[error("authentication failed after {attempts} attempt(s)")]
    AuthenticationFailed { attempts: u32 },

    #[error("recovery key in {path} is invalid: {reason}")]
    InvalidRecoveryKey { path: PathBuf, reason: String },

    #[error("TPM2 is NOT enrolled on {device}: {reason}")]
    Tpm2EnrollFailed {
        device: PathBuf,
        reason: String,
        previous_wiped: bool,
    },

    #[error("verification failed on {device}: {failures:?}")]
    VerificationFailed {
        device: PathBuf,
        failures: Vec<String>,
    },

    #[error("another slotkeeper process holds the lock for {device} (pid {pid})")]
    DeviceBusy { device: PathBuf, pid: String },

    #[error("interrupted before {pending} pending operation(s) could start")]
    Interrupted { pending: usize },

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("insufficient privileges: {0}")]
    Privilege(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("toml parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("toml serialisation error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SlotkeeperError {
    /// Concrete manual command (or next step) the operator can fall back to.
    pub fn remediation(&self) -> Option<String> {
        match self {
            SlotkeeperError::NotLuks(path) => Some(format!(
                "confirm the partition with: cryptsetup isLuks -v {}",
                path.display()
            )),
            SlotkeeperError::NotBlockDevice(_) => {
                Some("list encrypted devices with: lsblk -o NAME,PATH,FSTYPE | grep crypto_LUKS".into())
            }
            SlotkeeperError::BackendFailed { tool, stderr, .. } => {
                if stderr.trim().is_empty() {
                    Some(format!("re-run the {tool} command manually with --debug to see details"))
                } else {
                    None
                }
            }
            SlotkeeperError::ParseFailed { .. } | SlotkeeperError::UntrustedHeader(_) => Some(
                "inspect the header manually with: cryptsetup luksDump <device>".into(),
            ),
            SlotkeeperError::Timeout { .. } => Some(
                "check the TPM with: tpm2_getcap properties-fixed (a busy or locked-out TPM delays every query)"
                    .into(),
            ),
            SlotkeeperError::WouldLockOut { .. } | SlotkeeperError::NoFallbackAuth { .. } => Some(
                "add another passphrase first: cryptsetup luksAddKey <device>".into(),
            ),
            SlotkeeperError::BelowMinimumAuthMethods { .. } => Some(
                "add another passphrase first (cryptsetup luksAddKey <device>) or re-run with --force to accept fewer methods"
                    .into(),
            ),
            SlotkeeperError::UnconfirmedSlot { slot, .. } => Some(format!(
                "inspect the slot, then remove it by hand if intended: cryptsetup luksKillSlot <device> {slot}"
            )),
            SlotkeeperError::Prerequisite { remediation, .. } => remediation.clone(),
            SlotkeeperError::AuthenticationFailed { .. } => Some(
                "check which slots accept a passphrase with: cryptsetup open --test-passphrase -v <device>"
                    .into(),
            ),
            SlotkeeperError::InvalidRecoveryKey { path, .. } => Some(format!(
                "move {} aside and re-run setup to generate a fresh recovery key",
                path.display()
            )),
            SlotkeeperError::Tpm2EnrollFailed { device, .. } => Some(format!(
                "re-run: systemd-cryptenroll --wipe-slot=tpm2 --tpm2-device=auto --tpm2-pcrs=7 {} (or: clevis luks bind -d {} tpm2 '{{\"pcr_ids\":\"7\"}}')",
                device.display(),
                device.display()
            )),
            SlotkeeperError::VerificationFailed { device, .. } => Some(format!(
                "review the header with: cryptsetup luksDump {} and keep the recovery key at hand before rebooting",
                device.display()
            )),
            SlotkeeperError::DeviceBusy { .. } => Some(
                "wait for the other run to finish; remove the lock file only if no slotkeeper process is alive"
                    .into(),
            ),
            SlotkeeperError::Privilege(_) => Some("re-run with sudo".into()),
            _ => None,
        }
    }

    /// True for errors raised by the removal safety checks.
    pub fn is_safety_rejection(&self) -> bool {
        matches!(
            self,
            SlotkeeperError::WouldLockOut { .. }
                | SlotkeeperError::NoFallbackAuth { .. }
                | SlotkeeperError::BelowMinimumAuthMethods { .. }
                | SlotkeeperError::UnconfirmedSlot { .. }
                | SlotkeeperError::SlotNotEnabled { .. }
                | SlotkeeperError::UntrustedHeader(_)
        )
    }
}
