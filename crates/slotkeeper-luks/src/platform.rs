//! Host facts read from sysfs, `tpm2_pcrread`, `lsblk`, and `mokutil`.

use crate::command::{describe, output_diagnostic, ToolCommand};
use crate::crypttab::read_crypttab;
use crate::resolve::optional_binary;
use log::debug;
use regex::Regex;
use serde::Deserialize;
use slotkeeper_core::config::SlotkeeperConfig;
use slotkeeper_core::error::{SlotkeeperError, SlotkeeperResult};
use slotkeeper_provider::pcr::PcrSpec;
use slotkeeper_provider::platform::{
    BlockDeviceInfo, CrypttabEntry, FirmwareMode, Platform, SecureBootState, TpmPresence,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const TPM_DEVICES: &[&str] = &["/dev/tpmrm0", "/dev/tpm0"];
const TPM_SYSFS: &str = "/sys/class/tpm/tpm0";
const EFI_DIR: &str = "/sys/firmware/efi";
const SECURE_BOOT_VAR: &str =
    "/sys/firmware/efi/efivars/SecureBoot-8be4df61-93ca-11d2-aa0d-00e098032b8c";

/// Files whose presence means the initramfs can unlock with a TPM.
const INITRAMFS_HOOKS: &[(&str, &str)] = &[
    ("clevis (initramfs-tools)", "/usr/share/initramfs-tools/hooks/clevis"),
    ("clevis (dracut)", "/usr/lib/dracut/modules.d/50clevis"),
    ("clevis (dracut)", "/usr/lib/dracut/modules.d/60clevis"),
    ("systemd-cryptsetup (dracut)", "/usr/lib/dracut/modules.d/90crypt"),
    ("systemd-cryptsetup", "/usr/lib/systemd/systemd-cryptsetup"),
    ("systemd-cryptsetup", "/lib/systemd/systemd-cryptsetup"),
    ("tpm2-tss libraries", "/usr/lib/x86_64-linux-gnu/libtss2-esys.so.0"),
];

#[derive(Debug, Clone)]
pub struct SystemPlatform {
    pcrread: Option<ToolCommand>,
    lsblk: Option<ToolCommand>,
    mokutil: Option<ToolCommand>,
    tpm_device: Option<PathBuf>,
    crypttab_path: PathBuf,
}

impl SystemPlatform {
    pub fn from_config(config: &SlotkeeperConfig) -> SlotkeeperResult<Self> {
        let command_timeout = config.command_timeout();
        let tpm_timeout = config.tpm_timeout();
        let pcrread = optional_binary("tpm2_pcrread", config.tpm.pcrread_path.as_deref())?
            .map(|path| ToolCommand::new(path, tpm_timeout));
        let lsblk = optional_binary("lsblk", None)?.map(|path| ToolCommand::new(path, command_timeout));
        let mokutil =
            optional_binary("mokutil", None)?.map(|path| ToolCommand::new(path, command_timeout));
        let tpm_device = config
            .tpm
            .device
            .as_deref()
            .map(str::trim)
            .filter(|dev| !dev.is_empty())
            .map(PathBuf::from);
        Ok(Self {
            pcrread,
            lsblk,
            mokutil,
            tpm_device,
            crypttab_path: config.crypttab_path(),
        })
    }
}

impl Platform for SystemPlatform {
    type Error = SlotkeeperError;

    fn tpm_presence(&self) -> TpmPresence {
        let candidates: Vec<PathBuf> = match &self.tpm_device {
            Some(device) => vec![device.clone()],
            None => TPM_DEVICES.iter().map(PathBuf::from).collect(),
        };
        let Some(device) = candidates.into_iter().find(|dev| dev.exists()) else {
            return TpmPresence::Absent(
                "no TPM character device (/dev/tpmrm0, /dev/tpm0); enable the TPM (PTT/fTPM) in firmware setup"
                    .into(),
            );
        };
        let sysfs = Path::new(TPM_SYSFS);
        TpmPresence::Present {
            device,
            version: read_trimmed(&sysfs.join("tpm_version_major")),
            manufacturer: read_trimmed(&sysfs.join("device/description")),
        }
    }

    fn read_pcrs(&self, bank: &str, indices: &[u8]) -> SlotkeeperResult<BTreeMap<u8, String>> {
        let Some(cmd) = &self.pcrread else {
            return Err(SlotkeeperError::Prerequisite {
                message: "tpm2_pcrread not found".into(),
                remediation: Some("install tpm2-tools".into()),
            });
        };
        let selector = PcrSpec {
            bank: bank.to_string(),
            indices: indices.to_vec(),
        }
        .pcrread_selector();
        let out = cmd.run(&[selector.as_str()], None)?;
        if !out.success() {
            let message = format!(
                "tpm2_pcrread {selector} failed: {}",
                describe(&output_diagnostic(&out))
            );
            return Err(cmd.failure(&out, message));
        }
        Ok(parse_pcrread(&out.stdout))
    }

    fn discover_luks_devices(&self) -> SlotkeeperResult<Vec<BlockDeviceInfo>> {
        let Some(cmd) = &self.lsblk else {
            return Err(SlotkeeperError::Prerequisite {
                message: "lsblk not found".into(),
                remediation: Some("install util-linux, or pass the device path explicitly".into()),
            });
        };
        let out = cmd.run(
            &["--json", "--paths", "--output", "NAME,PATH,FSTYPE,SIZE,UUID"],
            None,
        )?;
        if !out.success() {
            let message = format!("lsblk failed: {}", describe(&output_diagnostic(&out)));
            return Err(cmd.failure(&out, message));
        }
        parse_lsblk(&out.stdout)
    }

    fn firmware_mode(&self) -> FirmwareMode {
        if Path::new(EFI_DIR).is_dir() {
            FirmwareMode::Uefi
        } else {
            FirmwareMode::Legacy
        }
    }

    fn secure_boot(&self) -> SecureBootState {
        if let Some(cmd) = &self.mokutil {
            match cmd.run(&["--sb-state"], None) {
                Ok(out) => {
                    let text = format!("{}\n{}", out.stdout, out.stderr).to_ascii_lowercase();
                    if text.contains("secureboot enabled") {
                        return SecureBootState::Enabled;
                    }
                    if text.contains("secureboot disabled") {
                        return SecureBootState::Disabled;
                    }
                    debug!("unrecognised mokutil output: {}", text.trim());
                }
                Err(err) => debug!("mokutil --sb-state failed: {err}"),
            }
        }
        // efivarfs: 4 attribute bytes, then the value byte.
        match fs::read(SECURE_BOOT_VAR) {
            Ok(bytes) => match bytes.get(4) {
                Some(1) => SecureBootState::Enabled,
                Some(0) => SecureBootState::Disabled,
                _ => SecureBootState::Unknown("unexpected SecureBoot efivar contents".into()),
            },
            Err(_) if self.firmware_mode() == FirmwareMode::Legacy => {
                SecureBootState::Unknown("legacy BIOS boot".into())
            }
            Err(err) => SecureBootState::Unknown(format!("SecureBoot efivar unreadable: {err}")),
        }
    }

    fn initramfs_hooks(&self) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        for (label, path) in INITRAMFS_HOOKS {
            if Path::new(path).exists() && !found.iter().any(|f| f.starts_with(label)) {
                found.push(format!("{label}: {path}"));
            }
        }
        found
    }

    fn crypttab(&self) -> SlotkeeperResult<Vec<CrypttabEntry>> {
        read_crypttab(&self.crypttab_path)
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn pcr_line_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s*:\s*(?:0x)?([0-9A-Fa-f]+)\s*$").expect("valid pcrread regex")
    })
}

/// Parse `tpm2_pcrread` output (`  7 : 0xABC...`) into lowercase hex.
pub fn parse_pcrread(text: &str) -> BTreeMap<u8, String> {
    text.lines()
        .filter_map(|line| pcr_line_re().captures(line))
        .filter_map(|caps| Some((caps[1].parse().ok()?, caps[2].to_ascii_lowercase())))
        .collect()
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Parse `lsblk --json` output, keeping `crypto_LUKS` devices at any depth.
pub fn parse_lsblk(text: &str) -> SlotkeeperResult<Vec<BlockDeviceInfo>> {
    let parsed: LsblkOutput = serde_json::from_str(text).map_err(|err| SlotkeeperError::ParseFailed {
        what: "lsblk --json".into(),
        reason: err.to_string(),
    })?;
    let mut found = Vec::new();
    collect_luks(&parsed.blockdevices, &mut found);
    Ok(found)
}

fn collect_luks(devices: &[LsblkDevice], found: &mut Vec<BlockDeviceInfo>) {
    for dev in devices {
        if dev.fstype.as_deref() == Some("crypto_LUKS") {
            let path = dev.path.clone().unwrap_or_else(|| {
                if dev.name.starts_with('/') {
                    dev.name.clone()
                } else {
                    format!("/dev/{}", dev.name)
                }
            });
            found.push(BlockDeviceInfo {
                path: PathBuf::from(path),
                name: dev.name.clone(),
                size: dev.size.clone(),
                uuid: dev.uuid.clone(),
            });
        }
        collect_luks(&dev.children, found);
    }
}
