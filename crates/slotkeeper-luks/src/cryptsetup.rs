//! `cryptsetup` operations shared by both enrollment backends.

use crate::command::{
    action_unsupported, describe, is_missing_device, is_permission_problem, is_wrong_key,
    output_diagnostic, ToolCommand,
};
use crate::dump::parse_luks_dump;
use log::debug;
use slotkeeper_core::error::{SlotkeeperError, SlotkeeperResult};
use slotkeeper_provider::luks::{LuksDevice, LuksHeader};
use std::fs;
use std::io::Write;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use zeroize::Zeroizing;

/// cryptsetup exits with 2 when no keyslot accepted the key.
const EXIT_WRONG_KEY: i32 = 2;

#[derive(Debug, Clone)]
pub(crate) struct Cryptsetup {
    cmd: ToolCommand,
    allow_image_files: bool,
}

impl Cryptsetup {
    pub(crate) fn new(cmd: ToolCommand, allow_image_files: bool) -> Self {
        Self {
            cmd,
            allow_image_files,
        }
    }

    pub(crate) fn version(&self) -> SlotkeeperResult<Option<String>> {
        let out = self.cmd.run(&["--version"], None)?;
        Ok(out
            .success()
            .then(|| out.stdout.trim().to_string())
            .filter(|v| !v.is_empty()))
    }

    /// Check the path is a block device (or an image file when allowed)
    /// carrying a LUKS header, and read its version and UUID.
    pub(crate) fn inspect(&self, device: &Path) -> SlotkeeperResult<LuksDevice> {
        let meta = match fs::metadata(device) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SlotkeeperError::NotBlockDevice(device.to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };
        let file_type = meta.file_type();
        if !file_type.is_block_device() && !(self.allow_image_files && file_type.is_file()) {
            return Err(SlotkeeperError::NotBlockDevice(device.to_path_buf()));
        }

        if !self.is_luks(device)? {
            return Err(SlotkeeperError::NotLuks(device.to_path_buf()));
        }
        let header = self.dump(device)?;
        Ok(LuksDevice {
            path: device.to_path_buf(),
            version: header.version,
            uuid: header.uuid,
        })
    }

    pub(crate) fn is_luks(&self, device: &Path) -> SlotkeeperResult<bool> {
        let dev = device.to_string_lossy();
        let out = self.cmd.run(&["isLuks", &*dev], None)?;
        if !out.success() {
            debug!(
                "isLuks {dev} exited {}: {}",
                out.status,
                describe(&output_diagnostic(&out))
            );
        }
        Ok(out.success())
    }

    pub(crate) fn dump(&self, device: &Path) -> SlotkeeperResult<LuksHeader> {
        let dev = device.to_string_lossy();
        let out = self.cmd.run(&["luksDump", &*dev], None)?;
        if !out.success() {
            let message = classify_dump_failure(&dev, &output_diagnostic(&out));
            return Err(self.cmd.failure(&out, message));
        }
        parse_luks_dump(&out.stdout)
    }

    /// Test `secret` against one slot, or against any slot when `slot` is
    /// `None`. A rejected key is `Ok(false)`.
    pub(crate) fn test_passphrase(
        &self,
        device: &Path,
        slot: Option<u8>,
        secret: &[u8],
    ) -> SlotkeeperResult<bool> {
        let dev = device.to_string_lossy().into_owned();
        let slot_arg = slot.map(|s| s.to_string());
        let mut args = vec!["open", "--test-passphrase"];
        if let Some(slot) = slot_arg.as_deref() {
            args.extend(["--key-slot", slot]);
        }
        args.extend(["--key-file", "-", dev.as_str()]);

        let mut out = self.cmd.run(&args, Some(secret))?;
        if !out.success() && action_unsupported(&out) {
            args[0] = "luksOpen";
            out = self.cmd.run(&args, Some(secret))?;
        }
        if out.success() {
            return Ok(true);
        }

        let diagnostic = output_diagnostic(&out);
        let lower = diagnostic.to_ascii_lowercase();
        if out.status == EXIT_WRONG_KEY || is_wrong_key(&lower) {
            return Ok(false);
        }
        let message = classify_test_failure(&dev, slot, &diagnostic);
        Err(self.cmd.failure(&out, message))
    }

    /// Add `new_secret` as a passphrase. The existing key goes over stdin and
    /// the new one through an owner-only temp file.
    pub(crate) fn add_key(
        &self,
        device: &Path,
        auth: &[u8],
        new_secret: &[u8],
        slot: Option<u8>,
    ) -> SlotkeeperResult<()> {
        let mut keyfile = tempfile::Builder::new()
            .prefix("slotkeeper-key-")
            .tempfile()?;
        keyfile.as_file_mut().write_all(new_secret)?;
        keyfile.as_file_mut().flush()?;

        let dev = device.to_string_lossy().into_owned();
        let key_path = keyfile.path().to_string_lossy().into_owned();
        let slot_arg = slot.map(|s| s.to_string());
        let mut args = vec!["luksAddKey", "--batch-mode", "--key-file", "-"];
        if let Some(slot) = slot_arg.as_deref() {
            args.extend(["--key-slot", slot]);
        }
        args.extend([dev.as_str(), key_path.as_str()]);

        let result = self.cmd.run(&args, Some(auth));
        scrub_keyfile(keyfile.as_file_mut(), new_secret.len());
        let out = result?;
        if out.success() {
            return Ok(());
        }
        let message = classify_addkey_failure(&dev, &output_diagnostic(&out));
        Err(self.cmd.failure(&out, message))
    }

    pub(crate) fn kill_slot(&self, device: &Path, auth: &[u8], slot: u8) -> SlotkeeperResult<()> {
        let dev = device.to_string_lossy().into_owned();
        let slot_arg = slot.to_string();
        let args = [
            "luksKillSlot",
            "--batch-mode",
            dev.as_str(),
            slot_arg.as_str(),
            "--key-file",
            "-",
        ];
        let out = self.cmd.run(&args, Some(auth))?;
        if out.success() {
            return Ok(());
        }
        let message = classify_killslot_failure(&dev, slot, &output_diagnostic(&out));
        Err(self.cmd.failure(&out, message))
    }
}

/// Overwrite the staged key before the temp file is unlinked.
fn scrub_keyfile(file: &mut fs::File, len: usize) {
    use std::io::{Seek, SeekFrom};
    let zeros = Zeroizing::new(vec![0u8; len]);
    if file.seek(SeekFrom::Start(0)).is_ok() {
        let _ = file.write_all(&zeros);
        let _ = file.sync_all();
    }
}

fn classify_dump_failure(source: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);

    if lower.contains("not a valid luks device") || lower.contains("is not a luks device") {
        return format!("`{source}` does not carry a LUKS header: {diagnostic}");
    }
    if is_permission_problem(&lower) {
        return format!(
            "cryptsetup could not read the header of `{source}`: {diagnostic}. Reading LUKS headers requires root"
        );
    }
    if is_missing_device(&lower) {
        return format!(
            "cryptsetup could not access `{source}`: {diagnostic}. Confirm the device path is correct and present"
        );
    }
    format!("cryptsetup luksDump failed for `{source}`: {diagnostic}")
}

fn classify_test_failure(source: &str, slot: Option<u8>, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);
    let target = match slot {
        Some(slot) => format!("slot {slot} of `{source}`"),
        None => format!("`{source}`"),
    };

    if is_permission_problem(&lower) {
        return format!(
            "cryptsetup could not test a passphrase against {target}: {diagnostic}. This requires root"
        );
    }
    if lower.contains("keyslot") && lower.contains("not active") {
        return format!("{target} is not an active keyslot: {diagnostic}");
    }
    format!("cryptsetup failed to test a passphrase against {target}: {diagnostic}")
}

fn classify_addkey_failure(source: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);

    if is_wrong_key(&lower) {
        return format!(
            "cryptsetup rejected the existing passphrase while adding a key to `{source}`: {diagnostic}. Re-enter the current LUKS passphrase and retry"
        );
    }
    if lower.contains("no free key slot")
        || lower.contains("no free keyslot")
        || lower.contains("all key slots full")
        || lower.contains("no remaining keyslot")
    {
        return format!(
            "`{source}` has no free keyslots: {diagnostic}. Run `slotkeeper cleanup` to drop duplicates first"
        );
    }
    if lower.contains("already used") || lower.contains("is not free") {
        return format!("the requested keyslot on `{source}` is already in use: {diagnostic}");
    }
    if is_permission_problem(&lower) {
        return format!(
            "cryptsetup could not add a key to `{source}`: {diagnostic}. This requires root"
        );
    }
    if is_missing_device(&lower) {
        return format!(
            "cryptsetup could not access `{source}` while adding a key: {diagnostic}. Confirm the device path is correct and present"
        );
    }
    format!("cryptsetup failed to add a key to `{source}`: {diagnostic}")
}

fn classify_killslot_failure(source: &str, slot: u8, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);

    if is_wrong_key(&lower) {
        return format!(
            "cryptsetup rejected the passphrase while removing slot {slot} from `{source}`: {diagnostic}"
        );
    }
    if lower.contains("not active") || lower.contains("is not used") {
        return format!("slot {slot} of `{source}` is already empty: {diagnostic}");
    }
    if lower.contains("last keyslot") || lower.contains("last key slot") {
        return format!(
            "cryptsetup refused to remove slot {slot}, the last keyslot of `{source}`: {diagnostic}"
        );
    }
    if is_permission_problem(&lower) {
        return format!(
            "cryptsetup could not remove slot {slot} from `{source}`: {diagnostic}. This requires root"
        );
    }
    format!("cryptsetup failed to remove slot {slot} from `{source}`: {diagnostic}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_diagnostics_still_read_well() {
        let message = classify_killslot_failure("/dev/vda3", 4, "  ");
        assert!(message.ends_with("no additional output"));
    }

    #[test]
    fn full_header_gets_cleanup_hint() {
        let message = classify_addkey_failure("/dev/vda3", "All key slots full.");
        assert!(message.contains("slotkeeper cleanup"));
    }

    #[test]
    fn non_luks_dump_is_named() {
        let message = classify_dump_failure("/dev/vda1", "Device /dev/vda1 is not a valid LUKS device.");
        assert!(message.contains("does not carry a LUKS header"));
    }
}
