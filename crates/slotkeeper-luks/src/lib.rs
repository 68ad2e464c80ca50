#![forbid(unsafe_code)]

//! System adapters for LUKS keyslot management.
//!
//! Integrates with the host via:
//! - `cryptsetup` (isLuks/luksDump/test-passphrase/luksAddKey/luksKillSlot)
//! - `clevis luks` or `systemd-cryptenroll` for TPM2 bindings
//! - `tpm2_pcrread`, `lsblk`, `mokutil`, and sysfs for host facts
//! - `/etc/crypttab` for boot integration

mod clevis;
mod command;
mod cryptenroll;
mod cryptsetup;
pub mod crypttab;
pub mod dump;
pub mod enrollment;
mod platform;
mod resolve;

pub use clevis::ClevisBackend;
pub use cryptenroll::{CryptenrollBackend, MIN_SYSTEMD_VERSION, UNLOCK_KEY_FILE_VERSION};
pub use platform::{parse_lsblk, parse_pcrread, SystemPlatform};
pub use resolve::resolve_binary;

use command::ToolCommand;
use cryptsetup::Cryptsetup;
use log::debug;
use resolve::optional_binary;
use slotkeeper_core::config::{BackendChoice, SlotkeeperConfig};
use slotkeeper_core::error::{SlotkeeperError, SlotkeeperResult};
use slotkeeper_provider::luks::{
    EnrollmentEntry, LuksBackend, LuksDevice, LuksHeader, ToolingReport,
};
use slotkeeper_provider::pcr::PcrSpec;
use slotkeeper_provider::BackendKind;
use std::path::Path;

/// Either concrete backend, picked at runtime from configuration.
#[derive(Debug)]
pub enum SystemBackend {
    Clevis(ClevisBackend),
    Cryptenroll(CryptenrollBackend),
}

macro_rules! dispatch {
    ($self:ident, $backend:ident => $call:expr) => {
        match $self {
            SystemBackend::Clevis($backend) => $call,
            SystemBackend::Cryptenroll($backend) => $call,
        }
    };
}

impl LuksBackend for SystemBackend {
    type Error = SlotkeeperError;

    fn kind(&self) -> BackendKind {
        dispatch!(self, b => b.kind())
    }

    fn supports_slot_unlock_test(&self) -> bool {
        dispatch!(self, b => b.supports_slot_unlock_test())
    }

    fn check_tooling(&self) -> SlotkeeperResult<ToolingReport> {
        dispatch!(self, b => b.check_tooling())
    }

    fn inspect_device(&self, device: &Path) -> SlotkeeperResult<LuksDevice> {
        dispatch!(self, b => b.inspect_device(device))
    }

    fn read_header(&self, device: &Path) -> SlotkeeperResult<LuksHeader> {
        dispatch!(self, b => b.read_header(device))
    }

    fn read_enrollment(&self, device: &Path) -> SlotkeeperResult<Vec<EnrollmentEntry>> {
        dispatch!(self, b => b.read_enrollment(device))
    }

    fn test_passphrase(&self, device: &Path, slot: Option<u8>, secret: &[u8]) -> SlotkeeperResult<bool> {
        dispatch!(self, b => b.test_passphrase(device, slot, secret))
    }

    fn test_tpm2_slot(&self, device: &Path, slot: u8) -> SlotkeeperResult<Option<bool>> {
        dispatch!(self, b => b.test_tpm2_slot(device, slot))
    }

    fn add_key(
        &self,
        device: &Path,
        auth: &[u8],
        new_secret: &[u8],
        slot: Option<u8>,
    ) -> SlotkeeperResult<()> {
        dispatch!(self, b => b.add_key(device, auth, new_secret, slot))
    }

    fn remove_slot(&self, device: &Path, auth: &[u8], slot: u8) -> SlotkeeperResult<()> {
        dispatch!(self, b => b.remove_slot(device, auth, slot))
    }

    fn enroll_tpm2(&self, device: &Path, auth: &[u8], pcrs: &PcrSpec) -> SlotkeeperResult<()> {
        dispatch!(self, b => b.enroll_tpm2(device, auth, pcrs))
    }

    fn wipe_tpm2(&self, device: &Path, auth: &[u8]) -> SlotkeeperResult<()> {
        dispatch!(self, b => b.wipe_tpm2(device, auth))
    }

    fn integrate_boot(&self, device: &LuksDevice) -> SlotkeeperResult<Vec<String>> {
        dispatch!(self, b => b.integrate_boot(device))
    }
}

fn cryptsetup_from_config(config: &SlotkeeperConfig) -> SlotkeeperResult<Cryptsetup> {
    let binary = resolve_binary("cryptsetup", config.backend.cryptsetup_path.as_deref())?;
    Ok(Cryptsetup::new(
        ToolCommand::new(binary, config.command_timeout()),
        config.luks.allow_image_files,
    ))
}

fn clevis_backend(config: &SlotkeeperConfig, cryptsetup: Cryptsetup, binary: &Path) -> ClevisBackend {
    ClevisBackend::new(
        cryptsetup,
        ToolCommand::new(binary.to_path_buf(), config.command_timeout()),
        config.tpm_timeout(),
    )
}

fn cryptenroll_backend(
    config: &SlotkeeperConfig,
    cryptsetup: Cryptsetup,
    binary: &Path,
) -> CryptenrollBackend {
    CryptenrollBackend::new(
        cryptsetup,
        ToolCommand::new(binary.to_path_buf(), config.command_timeout()),
        config.crypttab_path(),
    )
}

/// Build the backend selected by `choice` (or `backend.type` when `None`).
///
/// `auto` prefers systemd-cryptenroll >= 248 and falls back to clevis.
pub fn backend_from_config(
    config: &SlotkeeperConfig,
    choice: Option<BackendChoice>,
) -> SlotkeeperResult<SystemBackend> {
    let cryptsetup = cryptsetup_from_config(config)?;
    let cryptenroll_path = config.backend.cryptenroll_path.as_deref();
    let clevis_path = config.backend.clevis_path.as_deref();

    match choice.unwrap_or(config.backend.kind) {
        BackendChoice::Clevis => {
            let binary = resolve_binary("clevis", clevis_path)?;
            Ok(SystemBackend::Clevis(clevis_backend(config, cryptsetup, &binary)))
        }
        BackendChoice::Cryptenroll => {
            let binary = resolve_binary("systemd-cryptenroll", cryptenroll_path)?;
            Ok(SystemBackend::Cryptenroll(cryptenroll_backend(
                config, cryptsetup, &binary,
            )))
        }
        BackendChoice::Auto => {
            if let Some(binary) = optional_binary("systemd-cryptenroll", cryptenroll_path)? {
                let backend = cryptenroll_backend(config, cryptsetup.clone(), &binary);
                match backend.systemd_version() {
                    Ok(version) if version >= MIN_SYSTEMD_VERSION => {
                        return Ok(SystemBackend::Cryptenroll(backend))
                    }
                    Ok(version) => debug!("systemd {version} too old for TPM2 enrollment"),
                    Err(err) => debug!("systemd-cryptenroll unusable: {err}"),
                }
            }
            if let Some(binary) = optional_binary("clevis", clevis_path)? {
                return Ok(SystemBackend::Clevis(clevis_backend(config, cryptsetup, &binary)));
            }
            Err(SlotkeeperError::Prerequisite {
                message: format!(
                    "neither systemd-cryptenroll >= {MIN_SYSTEMD_VERSION} nor clevis is installed"
                ),
                remediation: Some(
                    "install clevis (apt install clevis clevis-luks clevis-tpm2 clevis-initramfs) or upgrade systemd"
                        .into(),
                ),
            })
        }
    }
}

/// Every backend whose tools are installed, for read-only reports. Empty
/// when `cryptsetup` itself is missing.
pub fn installed_backends(config: &SlotkeeperConfig) -> SlotkeeperResult<Vec<SystemBackend>> {
    let Some(binary) = optional_binary("cryptsetup", config.backend.cryptsetup_path.as_deref())? else {
        return Ok(Vec::new());
    };
    let cryptsetup = Cryptsetup::new(
        ToolCommand::new(binary, config.command_timeout()),
        config.luks.allow_image_files,
    );

    let mut backends = Vec::new();
    // The configured backend leads so status reads headers through it.
    let prefer_clevis = config.backend.kind == BackendChoice::Clevis;
    if let Some(binary) = optional_binary("systemd-cryptenroll", config.backend.cryptenroll_path.as_deref())? {
        backends.push(SystemBackend::Cryptenroll(cryptenroll_backend(
            config,
            cryptsetup.clone(),
            &binary,
        )));
    }
    if let Some(binary) = optional_binary("clevis", config.backend.clevis_path.as_deref())? {
        let clevis = SystemBackend::Clevis(clevis_backend(config, cryptsetup, &binary));
        if prefer_clevis {
            backends.insert(0, clevis);
        } else {
            backends.push(clevis);
        }
    }
    Ok(backends)
}
