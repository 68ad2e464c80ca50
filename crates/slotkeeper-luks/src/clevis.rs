//! Backend driving `clevis luks` for TPM2 bindings.

use crate::command::{describe, is_permission_problem, is_wrong_key, output_diagnostic, ToolCommand};
use crate::cryptsetup::Cryptsetup;
use crate::enrollment::parse_clevis_list;
use crate::resolve::optional_binary;
use log::{debug, info, warn};
use slotkeeper_core::error::{SlotkeeperError, SlotkeeperResult};
use slotkeeper_provider::luks::{
    EnrollmentEntry, LuksBackend, LuksDevice, LuksHeader, ToolingReport,
};
use slotkeeper_provider::pcr::PcrSpec;
use slotkeeper_provider::BackendKind;
use std::path::Path;
use std::time::Duration;

const CLEVIS_HELPERS: &[&str] = &["clevis-luks-bind", "clevis-luks-unbind", "clevis-encrypt-tpm2"];

const INITRAMFS_HOOKS: &[&str] = &[
    "/usr/share/initramfs-tools/hooks/clevis",
    "/usr/lib/dracut/modules.d/50clevis",
    "/usr/lib/dracut/modules.d/60clevis",
];

#[derive(Debug, Clone)]
pub struct ClevisBackend {
    cryptsetup: Cryptsetup,
    clevis: ToolCommand,
    tpm_timeout: Duration,
}

impl ClevisBackend {
    pub(crate) fn new(cryptsetup: Cryptsetup, clevis: ToolCommand, tpm_timeout: Duration) -> Self {
        Self {
            cryptsetup,
            clevis,
            tpm_timeout,
        }
    }

    fn list(&self, device: &Path) -> SlotkeeperResult<Vec<EnrollmentEntry>> {
        let dev = device.to_string_lossy();
        let out = self.clevis.run(&["luks", "list", "-d", &*dev], None)?;
        if !out.success() {
            let message = format!(
                "clevis could not list bindings on `{dev}`: {}",
                describe(&output_diagnostic(&out))
            );
            return Err(self.clevis.failure(&out, message));
        }
        Ok(parse_clevis_list(&out.stdout))
    }

    fn unbind(&self, device: &Path, auth: &[u8], slot: u8) -> SlotkeeperResult<()> {
        let dev = device.to_string_lossy().into_owned();
        let slot_arg = slot.to_string();
        let out = self.clevis.run(
            &["luks", "unbind", "-d", dev.as_str(), "-s", slot_arg.as_str(), "-f"],
            Some(auth),
        )?;
        if out.success() {
            info!("clevis unbound slot {slot} on {dev}");
            return Ok(());
        }
        let message = classify_clevis_failure("unbind", &dev, &output_diagnostic(&out));
        Err(self.clevis.failure(&out, message))
    }

    fn slot_is_bound(&self, device: &Path, slot: u8) -> SlotkeeperResult<bool> {
        let header = self.cryptsetup.dump(device)?;
        Ok(header
            .tokens
            .iter()
            .any(|token| token.token_type == "clevis" && token.keyslots.contains(&slot)))
    }
}

impl LuksBackend for ClevisBackend {
    type Error = SlotkeeperError;

    fn kind(&self) -> BackendKind {
        BackendKind::Clevis
    }

    fn supports_slot_unlock_test(&self) -> bool {
        true
    }

    fn check_tooling(&self) -> SlotkeeperResult<ToolingReport> {
        let mut notes = Vec::new();
        let sibling_dir = self.clevis.binary().parent().map(Path::to_path_buf);
        for helper in CLEVIS_HELPERS {
            let beside = sibling_dir
                .as_ref()
                .map(|dir| dir.join(helper))
                .filter(|path| path.is_file());
            let found = match beside {
                Some(path) => Some(path),
                None => optional_binary(helper, None)?,
            };
            match found {
                Some(path) => notes.push(format!("{helper}: {}", path.display())),
                None => {
                    return Err(SlotkeeperError::Prerequisite {
                        message: format!("{helper} is missing"),
                        remediation: Some("install clevis, clevis-luks, and clevis-tpm2".into()),
                    })
                }
            }
        }
        if let Some(version) = self.cryptsetup.version()? {
            notes.push(version);
        }
        Ok(ToolingReport {
            tool: "clevis".into(),
            version: None,
            notes,
            security: Vec::new(),
        })
    }

    fn inspect_device(&self, device: &Path) -> SlotkeeperResult<LuksDevice> {
        self.cryptsetup.inspect(device)
    }

    /// The dump alone cannot tell a TPM2 binding from a tang or sss one, so
    /// each clevis token gets the pin from `clevis luks list`.
    fn read_header(&self, device: &Path) -> SlotkeeperResult<LuksHeader> {
        let mut header = self.cryptsetup.dump(device)?;
        if !header.tokens.iter().any(|token| token.token_type == "clevis") {
            return Ok(header);
        }

        let entries = match self.list(device) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("clevis pins on {} unknown: {err}", device.display());
                header
                    .warnings
                    .push(format!("clevis luks list failed, pins unknown: {err}"));
                return Ok(header);
            }
        };

        let mut unresolved = Vec::new();
        for token in header.tokens.iter_mut().filter(|t| t.token_type == "clevis") {
            let entry = entries
                .iter()
                .find(|entry| token.keyslots.contains(&entry.slot));
            match entry {
                Some(entry) => {
                    token.fields.insert("pin".into(), entry.method.clone());
                    if let Some(detail) = &entry.detail {
                        token.fields.insert("config".into(), detail.clone());
                    }
                }
                None => unresolved.push(token.id),
            }
        }
        for id in unresolved {
            header
                .warnings
                .push(format!("clevis token {id} has no matching `clevis luks list` entry"));
        }
        Ok(header)
    }

    fn read_enrollment(&self, device: &Path) -> SlotkeeperResult<Vec<EnrollmentEntry>> {
        self.list(device)
    }

    fn test_passphrase(&self, device: &Path, slot: Option<u8>, secret: &[u8]) -> SlotkeeperResult<bool> {
        self.cryptsetup.test_passphrase(device, slot, secret)
    }

    fn test_tpm2_slot(&self, device: &Path, slot: u8) -> SlotkeeperResult<Option<bool>> {
        let dev = device.to_string_lossy().into_owned();
        let slot_arg = slot.to_string();
        let runner = self.clevis.with_timeout(self.tpm_timeout);
        let mut out = match runner.run(
            &["luks", "pass", "-d", dev.as_str(), "-s", slot_arg.as_str()],
            None,
        ) {
            Ok(out) => out,
            Err(SlotkeeperError::Timeout { after, .. }) => {
                warn!("clevis luks pass on {dev} slot {slot} timed out after {after:?}");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        // stdout is the slot's passphrase.
        let unlocked = out.success() && !out.stdout.trim().is_empty();
        if !unlocked {
            debug!(
                "clevis luks pass on {dev} slot {slot} exited {}: {}",
                out.status,
                describe(out.stderr.trim())
            );
        }
        out.scrub();
        Ok(Some(unlocked))
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

    fn remove_slot(&self, device: &Path, auth: &[u8], slot: u8) -> SlotkeeperResult<()> {
        if self.slot_is_bound(device, slot)? {
            self.unbind(device, auth, slot)
        } else {
            self.cryptsetup.kill_slot(device, auth, slot)
        }
    }

    fn enroll_tpm2(&self, device: &Path, auth: &[u8], pcrs: &PcrSpec) -> SlotkeeperResult<()> {
        let dev = device.to_string_lossy().into_owned();
        let config = pcrs.clevis_config();
        let out = self.clevis.run(
            &["luks", "bind", "-y", "-k", "-", "-d", dev.as_str(), "tpm2", config.as_str()],
            Some(auth),
        )?;
        if out.success() {
            info!("clevis bound a TPM2 slot on {dev} with {config}");
            return Ok(());
        }
        let message = classify_clevis_failure("bind", &dev, &output_diagnostic(&out));
        Err(self.clevis.failure(&out, message))
    }

    fn wipe_tpm2(&self, device: &Path, auth: &[u8]) -> SlotkeeperResult<()> {
        let bound: Vec<u8> = self
            .list(device)?
            .into_iter()
            .filter(EnrollmentEntry::is_tpm2)
            .map(|entry| entry.slot)
            .collect();
        for slot in bound {
            self.unbind(device, auth, slot)?;
        }
        Ok(())
    }

    fn integrate_boot(&self, device: &LuksDevice) -> SlotkeeperResult<Vec<String>> {
        let hook = INITRAMFS_HOOKS.iter().find(|path| Path::new(path).exists());
        let note = match hook {
            Some(path) => format!(
                "clevis initramfs support found at {path}; run `update-initramfs -u -k all` (or `dracut -f`) so {} unlocks at boot",
                device.path.display()
            ),
            None => format!(
                "no clevis initramfs hook found; install clevis-initramfs (or clevis-dracut) and regenerate the initramfs before relying on TPM2 unlock of {}",
                device.path.display()
            ),
        };
        Ok(vec![note])
    }
}

fn classify_clevis_failure(action: &str, source: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);

    if is_wrong_key(&lower) || lower.contains("invalid key") {
        return format!(
            "clevis luks {action} rejected the existing passphrase for `{source}`: {diagnostic}"
        );
    }
    if lower.contains("tpm") && (lower.contains("error") || lower.contains("failed")) {
        return format!(
            "clevis luks {action} could not talk to the TPM for `{source}`: {diagnostic}. Check `tpm2_getcap properties-fixed`"
        );
    }
    if is_permission_problem(&lower) {
        return format!("clevis luks {action} on `{source}` requires root: {diagnostic}");
    }
    format!("clevis luks {action} failed for `{source}`: {diagnostic}")
}
