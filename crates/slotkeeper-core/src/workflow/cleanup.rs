//! Duplicate keyslot cleanup.
//!
//! Builds a removal plan per device from the classified header plus whatever
//! the operator's passphrase and the stored recovery keys reveal, validates
//! it, and only then hands it to the mutation engine. Dry runs stop after
//! validation.

use super::{describe_slots, select_device, Prompter, WorkflowLevel, WorkflowReport};
use crate::classify::{classify, slots_of, AuthKind, SlotMap};
use crate::config::SlotkeeperConfig;
use crate::error::{SlotkeeperError, SlotkeeperResult};
use crate::lock::DeviceLock;
use crate::mutation::MutationEngine;
use crate::probe::{probe_slots, verify_secret};
use crate::recovery::discover_recovery_keys;
use crate::safety::{validate_removal, RemovalPolicy};
use log::info;
use slotkeeper_provider::luks::LuksBackend;
use slotkeeper_provider::platform::Platform;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Knobs accepted by [`cleanup`].
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Print the plan and validate it, change nothing.
    pub dry_run: bool,
    /// Process every discovered LUKS device.
    pub all: bool,
    pub device: Option<PathBuf>,
    /// TPM2 slot to keep when several exist.
    pub keep_tpm2: Option<u8>,
    /// Allow dropping below the configured minimum of auth methods.
    pub force: bool,
}

/// A slot scheduled for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRemoval {
    pub slot: u8,
    pub kind: AuthKind,
    pub reason: String,
}

/// What cleanup intends to do to one device.
#[derive(Debug, Clone)]
pub struct CleanupPlan {
    pub device: PathBuf,
    pub classified: SlotMap,
    /// Slots deliberately kept, with the reason.
    pub keep: BTreeMap<u8, String>,
    pub remove: Vec<PlannedRemoval>,
    /// Unknown or ambiguous slots left for the operator.
    pub manual: Vec<u8>,
}

impl CleanupPlan {
    fn new(device: &Path, classified: SlotMap) -> Self {
        Self {
            device: device.to_path_buf(),
            classified,
            keep: BTreeMap::new(),
            remove: Vec::new(),
            manual: Vec::new(),
        }
    }

    pub fn slots_to_remove(&self) -> Vec<u8> {
        let mut slots: Vec<u8> = self.remove.iter().map(|r| r.slot).collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    fn schedule(&mut self, slot: u8, reason: String) {
        if self.keep.contains_key(&slot) || self.remove.iter().any(|r| r.slot == slot) {
            return;
        }
        let kind = self.classified.get(&slot).copied().unwrap_or(AuthKind::Unknown);
        self.remove.push(PlannedRemoval { slot, kind, reason });
    }

    fn keep(&mut self, slot: u8, reason: String) {
        self.remove.retain(|r| r.slot != slot);
        self.keep.entry(slot).or_insert(reason);
    }
}

/// Remove duplicate authentication slots from one or all LUKS devices.
pub fn cleanup<B, P, Q>(
    config: &SlotkeeperConfig,
    backend: &B,
    platform: &P,
    prompter: &mut Q,
    options: &CleanupOptions,
) -> SlotkeeperResult<WorkflowReport>
where
    B: LuksBackend<Error = SlotkeeperError>,
    P: Platform<Error = SlotkeeperError>,
    Q: Prompter + ?Sized,
{
    let mut report = WorkflowReport::new(if options.dry_run {
        "Cleanup (dry run)"
    } else {
        "Cleanup"
    });

    let devices: Vec<PathBuf> = if options.all && options.device.is_none() {
        let found = platform.discover_luks_devices()?;
        if found.is_empty() {
            return Err(SlotkeeperError::Prerequisite {
                message: "no LUKS-encrypted block devices found".into(),
                remediation: Some("list block devices with: lsblk -f".into()),
            });
        }
        found.into_iter().map(|dev| dev.path).collect()
    } else {
        vec![select_device(platform, prompter, options.device.as_ref())?]
    };

    let many = devices.len() > 1;
    for device in &devices {
        match cleanup_device(config, backend, prompter, options, device, &mut report) {
            Ok(()) => {}
            Err(err @ (SlotkeeperError::Aborted(_) | SlotkeeperError::Interrupted { .. })) => {
                return Err(err)
            }
            Err(err) if many => {
                let mut message = format!("{}: {err}", device.display());
                if let Some(fix) = err.remediation() {
                    message.push_str(&format!(" ({fix})"));
                }
                report.push(WorkflowLevel::Error, message);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(report)
}

fn cleanup_device<B, Q>(
    config: &SlotkeeperConfig,
    backend: &B,
    prompter: &mut Q,
    options: &CleanupOptions,
    device: &Path,
    report: &mut WorkflowReport,
) -> SlotkeeperResult<()>
where
    B: LuksBackend<Error = SlotkeeperError>,
    Q: Prompter + ?Sized,
{
    let info = backend.inspect_device(device)?;
    let path = info.path.as_path();
    let header = backend.read_header(path)?;
    let classified = classify(&header);
    report.push(
        WorkflowLevel::Info,
        format!(
            "{} ({}): {}",
            path.display(),
            info.version,
            describe_slots(&classified)
        ),
    );

    if !header.warnings.is_empty() {
        for warning in &header.warnings {
            report.push(WorkflowLevel::Warn, format!("Header: {warning}"));
        }
        report.push(
            WorkflowLevel::Warn,
            format!(
                "{} has header content slotkeeper does not understand; nothing will be removed",
                path.display()
            ),
        );
        return Ok(());
    }

    let mut plan = CleanupPlan::new(path, classified.clone());

    for (slot, kind) in &classified {
        if !kind.auto_removable() {
            plan.manual.push(*slot);
            report.push(
                WorkflowLevel::Warn,
                format!(
                    "Slot {slot} is {kind}; review `cryptsetup luksDump {dev}` and, if it is not needed, remove it with `cryptsetup luksKillSlot {dev} {slot}`",
                    dev = path.display()
                ),
            );
        }
    }

    let tpm = slots_of(&classified, AuthKind::Tpm2);
    if tpm.len() > 1 {
        let keeper = choose_tpm2_keeper(backend, prompter, path, &tpm, options.keep_tpm2)?;
        plan.keep(keeper, "TPM2 binding kept".into());
        for slot in tpm.iter().copied().filter(|slot| *slot != keeper) {
            plan.schedule(slot, format!("duplicate TPM2 binding (keeping slot {keeper})"));
        }
    } else if let Some(slot) = tpm.first() {
        if let Some(requested) = options.keep_tpm2.filter(|requested| requested != slot) {
            report.push(
                WorkflowLevel::Warn,
                format!("--keep-tpm2 {requested} ignored: slot {slot} is the only TPM2 binding"),
            );
        }
        plan.keep(*slot, "only TPM2 binding".into());
    }

    let password_slots = slots_of(&classified, AuthKind::Password);
    let needs_auth = !plan.remove.is_empty() || password_slots.len() > 1;
    let auth = if needs_auth {
        authenticate(backend, prompter, path, &classified, options.dry_run, report)?
    } else {
        None
    };

    if let Some((_, matches)) = &auth {
        if let Some((first, rest)) = matches.split_first() {
            plan.keep(*first, "opens with the passphrase you entered".into());
            for slot in rest {
                plan.schedule(*slot, format!("same passphrase as slot {first}"));
            }
        }
    }

    let discovered = discover_recovery_keys(config);
    for record in discovered.valid.iter().filter(|r| r.applies_to(path)) {
        let matches = probe_slots(backend, path, &classified, record.value.as_bytes())?;
        if let Some((first, rest)) = matches.split_first() {
            plan.keep(*first, format!("recovery key {}", record.fingerprint()));
            for slot in rest {
                plan.schedule(*slot, format!("duplicate of recovery key in slot {first}"));
            }
        }
    }

    for slot in &password_slots {
        if !plan.keep.contains_key(slot) && !plan.remove.iter().any(|r| r.slot == *slot) {
            report.push(
                WorkflowLevel::Info,
                format!("Slot {slot}: passphrase not matched by any known secret; left alone"),
            );
        }
    }
    for (slot, reason) in &plan.keep {
        report.push(WorkflowLevel::Info, format!("Keep slot {slot}: {reason}"));
    }

    let to_remove = plan.slots_to_remove();
    if to_remove.is_empty() {
        report.push(
            WorkflowLevel::Success,
            format!("No duplicate slots on {}", path.display()),
        );
        return Ok(());
    }

    let verb = if options.dry_run {
        "[dry-run] would remove"
    } else {
        "Remove"
    };
    for removal in &plan.remove {
        report.push(
            WorkflowLevel::Info,
            format!("{verb} slot {} ({}): {}", removal.slot, removal.kind, removal.reason),
        );
    }

    let policy = RemovalPolicy::new(config.safety.min_remaining_auth_methods).with_force(options.force);
    if let Err(err) = validate_removal(path, &classified, &to_remove, &policy) {
        if !err.is_safety_rejection() {
            return Err(err);
        }
        let mut message = format!("Plan for {} rejected: {err}", path.display());
        if let Some(fix) = err.remediation() {
            message.push_str(&format!(" ({fix})"));
        }
        report.push(WorkflowLevel::Error, message);
        return Ok(());
    }

    if options.dry_run {
        report.push(
            WorkflowLevel::Success,
            format!(
                "[dry-run] plan for {} passes the safety checks; nothing was changed",
                path.display()
            ),
        );
        return Ok(());
    }

    let Some((secret, _)) = auth else {
        return Err(SlotkeeperError::Aborted(
            "a current passphrase is required to remove keyslots".into(),
        ));
    };
    let prompt = format!("Remove slot(s) {to_remove:?} from {}?", path.display());
    if !prompter.confirm(&prompt, false)? {
        report.push(
            WorkflowLevel::Info,
            format!("Left {} unchanged", path.display()),
        );
        return Ok(());
    }

    let _lock = DeviceLock::acquire(&config.lock_dir(), path)?;
    let engine = MutationEngine::from_config(backend, config);
    let outcome = engine.remove_slots(path, secret.as_bytes(), &to_remove, &policy)?;

    if let Some(backup) = &outcome.backup {
        report.push(
            WorkflowLevel::Info,
            format!("Header backup written to {}", backup.display()),
        );
    }
    for slot in &outcome.removed {
        report.push(WorkflowLevel::Success, format!("Removed slot {slot}"));
    }
    for failure in &outcome.failed {
        report.push(
            WorkflowLevel::Error,
            format!("Failed to remove slot {}: {}", failure.slot, failure.reason),
        );
    }
    for slot in &outcome.skipped {
        report.push(
            WorkflowLevel::Error,
            format!("Slot {slot} left untouched after interrupt"),
        );
    }

    let after = classify(&backend.read_header(path)?);
    info!(
        "cleanup of {} removed {:?}; remaining {}",
        path.display(),
        outcome.removed,
        describe_slots(&after)
    );
    report.push(
        if outcome.is_complete() {
            WorkflowLevel::Success
        } else {
            WorkflowLevel::Warn
        },
        format!("Final keyslots: {}", describe_slots(&after)),
    );
    Ok(())
}

/// Ask for the current passphrase and return it with the password slots it
/// opens. A cancelled prompt is fine during a dry run.
fn authenticate<B, Q>(
    backend: &B,
    prompter: &mut Q,
    device: &Path,
    classified: &SlotMap,
    dry_run: bool,
    report: &mut WorkflowReport,
) -> SlotkeeperResult<Option<(Zeroizing<String>, Vec<u8>)>>
where
    B: LuksBackend<Error = SlotkeeperError>,
    Q: Prompter + ?Sized,
{
    for attempt in 1..=MAX_AUTH_ATTEMPTS {
        let prompt = format!(
            "Current passphrase for {} (attempt {attempt}/{MAX_AUTH_ATTEMPTS})",
            device.display()
        );
        let Some(secret) = prompter.secret(&prompt)? else {
            if dry_run {
                report.push(
                    WorkflowLevel::Warn,
                    "No passphrase given; duplicate passphrases were not checked",
                );
                return Ok(None);
            }
            return Err(SlotkeeperError::Aborted(
                "cancelled at the passphrase prompt".into(),
            ));
        };

        let matches = probe_slots(backend, device, classified, secret.as_bytes())?;
        if !matches.is_empty() || verify_secret(backend, device, secret.as_bytes())? {
            return Ok(Some((secret, matches)));
        }
        report.push(
            WorkflowLevel::Warn,
            format!("Passphrase rejected (attempt {attempt}/{MAX_AUTH_ATTEMPTS})"),
        );
    }
    Err(SlotkeeperError::AuthenticationFailed {
        attempts: MAX_AUTH_ATTEMPTS,
    })
}

/// Pick the TPM2 slot to keep: the requested one, else the newest slot that
/// passes an unlock test, else an operator choice defaulting to the newest.
fn choose_tpm2_keeper<B, Q>(
    backend: &B,
    prompter: &mut Q,
    device: &Path,
    tpm: &[u8],
    requested: Option<u8>,
) -> SlotkeeperResult<u8>
where
    B: LuksBackend<Error = SlotkeeperError>,
    Q: Prompter + ?Sized,
{
    if let Some(slot) = requested {
        if tpm.contains(&slot) {
            return Ok(slot);
        }
        return Err(SlotkeeperError::Aborted(format!(
            "slot {slot} is not a TPM2 slot on {}; TPM2 slots are {tpm:?}",
            device.display()
        )));
    }

    if backend.supports_slot_unlock_test() {
        for slot in tpm.iter().rev() {
            match backend.test_tpm2_slot(device, *slot) {
                Ok(Some(true)) => return Ok(*slot),
                Ok(_) | Err(SlotkeeperError::Timeout { .. }) => {}
                Err(err) => return Err(err),
            }
        }
    }

    let labels: Vec<String> = tpm.iter().map(|slot| format!("TPM2 slot {slot}")).collect();
    let default = tpm.len() - 1;
    match prompter.choose("Keep which TPM2 slot?", &labels, default)? {
        Some(idx) if idx < tpm.len() => Ok(tpm[idx]),
        Some(idx) => Err(SlotkeeperError::Aborted(format!(
            "TPM2 choice {idx} is out of range"
        ))),
        None => Err(SlotkeeperError::Aborted("no TPM2 slot chosen".into())),
    }
}
