//! Backend driving `systemd-cryptenroll` for TPM2 enrollment.

use crate::command::{describe, is_permission_problem, is_wrong_key, output_diagnostic, Output, ToolCommand};
use crate::crypttab::{ensure_option, CrypttabChange};
use crate::cryptsetup::Cryptsetup;
use crate::enrollment::{parse_cryptenroll_list, parse_systemd_version};
use log::{info, warn};
use slotkeeper_core::error::{SlotkeeperError, SlotkeeperResult};
use slotkeeper_provider::luks::{
    EnrollmentEntry, LuksBackend, LuksDevice, LuksHeader, ToolingReport,
};
use slotkeeper_provider::pcr::PcrSpec;
use slotkeeper_provider::BackendKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// First release with `--tpm2-device`.
pub const MIN_SYSTEMD_VERSION: u32 = 248;
/// First release accepting `--unlock-key-file`.
pub const UNLOCK_KEY_FILE_VERSION: u32 = 252;

const CRYPTTAB_OPTION: &str = "tpm2-device=auto";

/// Token types systemd-cryptenroll manages itself and wipes together with
/// their keyslot.
const SYSTEMD_TOKENS: &[&str] = &["systemd-tpm2", "systemd-fido2", "systemd-recovery", "systemd-pkcs11"];

#[derive(Debug)]
pub struct CryptenrollBackend {
    cryptsetup: Cryptsetup,
    tool: ToolCommand,
    crypttab_path: PathBuf,
    version: OnceLock<Option<u32>>,
}

impl CryptenrollBackend {
    pub(crate) fn new(cryptsetup: Cryptsetup, tool: ToolCommand, crypttab_path: PathBuf) -> Self {
        Self {
            cryptsetup,
            tool,
            crypttab_path,
            version: OnceLock::new(),
        }
    }

    /// Major systemd release, queried once per process.
    pub fn systemd_version(&self) -> SlotkeeperResult<u32> {
        if let Some(cached) = self.version.get().copied() {
            return cached.ok_or_else(unknown_version);
        }
        let out = self.tool.run(&["--version"], None)?;
        let parsed = out
            .success()
            .then(|| parse_systemd_version(&out.stdout))
            .flatten();
        let _ = self.version.set(parsed);
        parsed.ok_or_else(unknown_version)
    }

    /// Run a mutating subcommand, handing `auth` over without touching argv:
    /// `--unlock-key-file=/dev/stdin` where supported, `PASSWORD` otherwise.
    fn run_authenticated(&self, options: &[&str], device: &Path, auth: &[u8]) -> SlotkeeperResult<Output> {
        let dev = device.to_string_lossy().into_owned();
        let mut args: Vec<&str> = options.to_vec();
        if self.systemd_version()? >= UNLOCK_KEY_FILE_VERSION {
            args.push("--unlock-key-file=/dev/stdin");
            args.push(dev.as_str());
            self.tool.run(&args, Some(auth))
        } else {
            args.push(dev.as_str());
            self.tool.run_with_env(&args, None, &[("PASSWORD", auth)])
        }
    }

    fn token_bound(&self, device: &Path, slot: u8) -> SlotkeeperResult<bool> {
        let header = self.cryptsetup.dump(device)?;
        Ok(header.tokens.iter().any(|token| {
            SYSTEMD_TOKENS.contains(&token.token_type.as_str()) && token.keyslots.contains(&slot)
        }))
    }

    fn fail(&self, out: &Output, action: &str, device: &Path) -> SlotkeeperError {
        let message = classify_cryptenroll_failure(action, &device.to_string_lossy(), &output_diagnostic(out));
        self.tool.failure(out, message)
    }
}

fn unknown_version() -> SlotkeeperError {
    SlotkeeperError::Prerequisite {
        message: "could not determine the systemd version from `systemd-cryptenroll --version`".into(),
        remediation: Some(format!("systemd >= {MIN_SYSTEMD_VERSION} is required; or set backend.type = \"clevis\"")),
    }
}

impl LuksBackend for CryptenrollBackend {
    type Error = SlotkeeperError;

    fn kind(&self) -> BackendKind {
        BackendKind::Cryptenroll
    }

    fn supports_slot_unlock_test(&self) -> bool {
        false
    }

    fn check_tooling(&self) -> SlotkeeperResult<ToolingReport> {
        let version = self.systemd_version()?;
        if version < MIN_SYSTEMD_VERSION {
            return Err(SlotkeeperError::Prerequisite {
                message: format!("systemd {version} has no TPM2 support in systemd-cryptenroll"),
                remediation: Some(format!(
                    "upgrade to systemd >= {MIN_SYSTEMD_VERSION}, or install clevis and set backend.type = \"clevis\""
                )),
            });
        }
        let mut notes = Vec::new();
        let mut security = Vec::new();
        if version < UNLOCK_KEY_FILE_VERSION {
            security.push(format!(
                "systemd {version} predates --unlock-key-file; the existing passphrase is passed through the PASSWORD environment variable (readable by root via /proc/<pid>/environ while the tool runs)"
            ));
        }
        if let Some(cs) = self.cryptsetup.version()? {
            notes.push(cs);
        }
        Ok(ToolingReport {
            tool: "systemd-cryptenroll".into(),
            version: Some(format!("systemd {version}")),
            notes,
            security,
        })
    }

    fn inspect_device(&self, device: &Path) -> SlotkeeperResult<LuksDevice> {
        self.cryptsetup.inspect(device)
    }

    /// systemd-cryptenroll cannot tell which pin a clevis token carries, so
    /// any clevis token leaves the header untrusted under this backend.
    fn read_header(&self, device: &Path) -> SlotkeeperResult<LuksHeader> {
        let mut header = self.cryptsetup.dump(device)?;
        let clevis: Vec<(u32, Vec<u8>)> = header
            .tokens
            .iter()
            .filter(|token| token.token_type == "clevis" && !token.fields.contains_key("pin"))
            .map(|token| (token.id, token.keyslots.clone()))
            .collect();
        for (id, keyslots) in clevis {
            warn!(
                "clevis token {id} on {} (keyslot(s) {keyslots:?}) has an unknown pin",
                device.display()
            );
            header.warnings.push(format!(
                "clevis token {id} (keyslot(s) {keyslots:?}) has a pin systemd-cryptenroll cannot read; re-run with --backend clevis"
            ));
        }
        Ok(header)
    }

    fn read_enrollment(&self, device: &Path) -> SlotkeeperResult<Vec<EnrollmentEntry>> {
        let dev = device.to_string_lossy();
        let out = self.tool.run(&[&*dev], None)?;
        if !out.success() {
            return Err(self.fail(&out, "list", device));
        }
        Ok(parse_cryptenroll_list(&out.stdout))
    }

    fn test_passphrase(&self, device: &Path, slot: Option<u8>, secret: &[u8]) -> SlotkeeperResult<bool> {
        self.cryptsetup.test_passphrase(device, slot, secret)
    }

    fn test_tpm2_slot(&self, _device: &Path, _slot: u8) -> SlotkeeperResult<Option<bool>> {
        Ok(None)
    }

    fn add_key(
        &self,
        device: &Path,
        auth: &[u8],
        new_secret: &[u8],
        slot: Option<u8>,
    ) -> SlotkeeperResult<()> {
        self.cryptsetup.add_key(device, auth, new_secret, slot)
    }

    /// Token-bound slots go through `--wipe-slot` so the token disappears
    /// with the keyslot; plain passphrases through `luksKillSlot`.
    fn remove_slot(&self, device: &Path, auth: &[u8], slot: u8) -> SlotkeeperResult<()> {
        if !self.token_bound(device, slot)? {
            return self.cryptsetup.kill_slot(device, auth, slot);
        }
        let wipe = format!("--wipe-slot={slot}");
        let out = self.run_authenticated(&[wipe.as_str()], device, auth)?;
        if out.success() {
            info!("systemd-cryptenroll wiped slot {slot} on {}", device.display());
            return Ok(());
        }
        Err(self.fail(&out, "wipe-slot", device))
    }

    fn enroll_tpm2(&self, device: &Path, auth: &[u8], pcrs: &PcrSpec) -> SlotkeeperResult<()> {
        let pcr_arg = format!("--tpm2-pcrs={}", pcrs.cryptenroll_arg());
        let out = self.run_authenticated(&["--tpm2-device=auto", pcr_arg.as_str()], device, auth)?;
        if out.success() {
            info!("systemd-cryptenroll enrolled TPM2 on {} ({pcr_arg})", device.display());
            return Ok(());
        }
        Err(self.fail(&out, "tpm2 enrollment", device))
    }

    fn wipe_tpm2(&self, device: &Path, auth: &[u8]) -> SlotkeeperResult<()> {
        let out = self.run_authenticated(&["--wipe-slot=tpm2"], device, auth)?;
        if out.success() {
            info!("systemd-cryptenroll wiped TPM2 slots on {}", device.display());
            return Ok(());
        }
        Err(self.fail(&out, "wipe-slot=tpm2", device))
    }

    fn integrate_boot(&self, device: &LuksDevice) -> SlotkeeperResult<Vec<String>> {
        let dev = device.path.display();
        let notes = match ensure_option(&self.crypttab_path, device, CRYPTTAB_OPTION)? {
            CrypttabChange::Updated { name, backup } => vec![
                format!(
                    "Added {CRYPTTAB_OPTION} to crypttab entry `{name}` (previous file kept at {})",
                    backup.display()
                ),
                "Run `update-initramfs -u -k all` (or `dracut -f`) so early boot picks up the change".into(),
            ],
            CrypttabChange::AlreadyPresent { name } => {
                vec![format!("crypttab entry `{name}` already carries {CRYPTTAB_OPTION}")]
            }
            CrypttabChange::NoEntry => vec![format!(
                "No entry in {} refers to {dev}; add `{CRYPTTAB_OPTION}` to its options by hand",
                self.crypttab_path.display()
            )],
        };
        Ok(notes)
    }
}

fn classify_cryptenroll_failure(action: &str, source: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);

    if is_wrong_key(&lower) || lower.contains("failed to unlock") {
        return format!(
            "systemd-cryptenroll {action} could not unlock `{source}` with the supplied passphrase: {diagnostic}"
        );
    }
    if lower.contains("no tpm2") || lower.contains("tpm2 support not") || lower.contains("tpm2 device") {
        return format!(
            "systemd-cryptenroll {action} found no usable TPM2 for `{source}`: {diagnostic}. Check that /dev/tpmrm0 exists and the TPM is enabled in firmware"
        );
    }
    if is_permission_problem(&lower) {
        return format!("systemd-cryptenroll {action} on `{source}` requires root: {diagnostic}");
    }
    format!("systemd-cryptenroll {action} failed for `{source}`: {diagnostic}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_passphrase_message() {
        let message = classify_cryptenroll_failure("tpm2 enrollment", "/dev/vda3", "Failed to unlock disk: Operation not permitted");
        assert!(message.contains("could not unlock"));
    }

    #[test]
    fn missing_tpm_message() {
        let message = classify_cryptenroll_failure("tpm2 enrollment", "/dev/vda3", "No TPM2 devices found.");
        assert!(message.contains("/dev/tpmrm0"));
    }
}
