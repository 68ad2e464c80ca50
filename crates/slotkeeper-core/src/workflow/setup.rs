//! Guided setup: recovery key, new passphrase, TPM2 enrollment, and removal
//! of the installer passphrase, driven as an explicit state machine.
//!
//! Every state re-reads what it depends on, so re-running setup on an
//! already configured device walks through the same states and changes
//! nothing.

use super::{describe_slots, prereq, select_device, Prompter, WorkflowLevel, WorkflowReport};
use crate::audit::AuditAction;
use crate::classify::{classify, slots_of, AuthKind, SlotMap};
use crate::config::SlotkeeperConfig;
use crate::error::{SlotkeeperError, SlotkeeperResult};
use crate::lock::DeviceLock;
use crate::mutation::{MutationEngine, Tpm2Outcome};
use crate::probe::{find_matching_slots, probe_slots, verify_secret};
use crate::recovery::{
    default_recovery_path, discover_recovery_keys, generate_recovery_key, RecoveryKeyRecord,
};
use crate::safety::RemovalPolicy;
use log::{debug, warn};
use slotkeeper_provider::luks::{LuksBackend, LuksDevice};
use slotkeeper_provider::pcr::PcrSpec;
use slotkeeper_provider::platform::Platform;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use zeroize::Zeroizing;

const MAX_AUTH_ATTEMPTS: u32 = 3;
const MIN_PASSPHRASE_LEN: usize = 8;

/// States of the setup flow, in the order they are normally visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Init,
    PrereqCheck,
    DeviceSelect,
    StateDetect,
    Authenticate,
    RecoveryKeySetup,
    NewPasswordInput,
    Tpm2Enroll,
    PasswordCleanup,
    Verify,
    Done,
    Aborted,
}

impl fmt::Display for SetupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupState::Init => "init",
            SetupState::PrereqCheck => "prereq-check",
            SetupState::DeviceSelect => "device-select",
            SetupState::StateDetect => "state-detect",
            SetupState::Authenticate => "authenticate",
            SetupState::RecoveryKeySetup => "recovery-key-setup",
            SetupState::NewPasswordInput => "new-password-input",
            SetupState::Tpm2Enroll => "tpm2-enroll",
            SetupState::PasswordCleanup => "password-cleanup",
            SetupState::Verify => "verify",
            SetupState::Done => "done",
            SetupState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Knobs accepted by [`setup`].
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// Skip device discovery and use this path.
    pub device: Option<PathBuf>,
    /// Walk every state but change nothing and write no files.
    pub dry_run: bool,
    /// Wipe and re-create an existing TPM2 binding.
    pub reenroll_tpm2: bool,
    /// Overrides `tpm.pcrs` from the configuration.
    pub pcrs: Option<PcrSpec>,
    /// Allow dropping below the configured minimum of auth methods.
    pub force: bool,
}

enum RecoveryState {
    Missing,
    /// A key file on this host that opens these password slots.
    File {
        record: RecoveryKeyRecord,
        slots: Vec<u8>,
    },
    /// A systemd recovery token; the key itself is not stored here.
    Token { slots: Vec<u8> },
}

struct SetupRun<'a, B, P, Q: ?Sized> {
    config: &'a SlotkeeperConfig,
    backend: &'a B,
    platform: &'a P,
    prompter: &'a mut Q,
    options: &'a SetupOptions,
    engine: MutationEngine<'a, B>,
    report: WorkflowReport,
    device: Option<LuksDevice>,
    classified: SlotMap,
    _lock: Option<DeviceLock>,
    auth: Option<Zeroizing<String>>,
    auth_slots: Vec<u8>,
    recovery: RecoveryState,
    unused_record: Option<RecoveryKeyRecord>,
    new_password: Option<(Zeroizing<String>, Vec<u8>)>,
}

/// Run the setup flow to completion or to the first terminal error.
pub fn setup<B, P, Q>(
    config: &SlotkeeperConfig,
    backend: &B,
    platform: &P,
    prompter: &mut Q,
    options: &SetupOptions,
) -> SlotkeeperResult<WorkflowReport>
where
    B: LuksBackend<Error = SlotkeeperError>,
    P: Platform<Error = SlotkeeperError>,
    Q: Prompter + ?Sized,
{
    let title = if options.dry_run {
        "Setup (dry run)"
    } else {
        "Setup"
    };
    let mut run = SetupRun {
        config,
        backend,
        platform,
        prompter,
        options,
        engine: MutationEngine::from_config(backend, config),
        report: WorkflowReport::new(title),
        device: None,
        classified: SlotMap::new(),
        _lock: None,
        auth: None,
        auth_slots: Vec::new(),
        recovery: RecoveryState::Missing,
        unused_record: None,
        new_password: None,
    };

    let mut state = SetupState::Init;
    loop {
        debug!("setup: entering {state}");
        let next = match state {
            SetupState::Init => Ok(SetupState::PrereqCheck),
            SetupState::PrereqCheck => run.prereq_check(),
            SetupState::DeviceSelect => run.device_select(),
            SetupState::StateDetect => run.state_detect(),
            SetupState::Authenticate => run.authenticate(),
            SetupState::RecoveryKeySetup => run.recovery_key_setup(),
            SetupState::NewPasswordInput => run.new_password_input(),
            SetupState::Tpm2Enroll => run.tpm2_enroll(),
            SetupState::PasswordCleanup => run.password_cleanup(),
            SetupState::Verify => run.verify(),
            SetupState::Done | SetupState::Aborted => break,
        };
        match next {
            Ok(next) => state = next,
            Err(err) => {
                warn!("setup: {state} -> {}: {err}", SetupState::Aborted);
                return Err(err);
            }
        }
    }

    Ok(run.report)
}

impl<'a, B, P, Q> SetupRun<'a, B, P, Q>
where
    B: LuksBackend<Error = SlotkeeperError>,
    P: Platform<Error = SlotkeeperError>,
    Q: Prompter + ?Sized,
{
    fn prereq_check(&mut self) -> SlotkeeperResult<SetupState> {
        let events = prereq::check_prerequisites(self.platform, self.backend)?;
        self.report.events.extend(events);
        Ok(SetupState::DeviceSelect)
    }

    fn device_select(&mut self) -> SlotkeeperResult<SetupState> {
        let path = select_device(self.platform, &mut *self.prompter, self.options.device.as_ref())?;
        let device = self.backend.inspect_device(&path)?;
        self.report.push(
            WorkflowLevel::Info,
            format!(
                "Using {} ({}{})",
                device.path.display(),
                device.version,
                device
                    .uuid
                    .as_deref()
                    .map(|uuid| format!(", UUID {uuid}"))
                    .unwrap_or_default()
            ),
        );
        if !self.options.dry_run {
            self._lock = Some(DeviceLock::acquire(&self.config.lock_dir(), &device.path)?);
        }
        self.device = Some(device);
        Ok(SetupState::StateDetect)
    }

    fn state_detect(&mut self) -> SlotkeeperResult<SetupState> {
        let path = self.path()?;
        let header = self.backend.read_header(&path)?;
        if !header.warnings.is_empty() {
            for warning in &header.warnings {
                self.report.push(WorkflowLevel::Warn, format!("Header: {warning}"));
            }
            return Err(SlotkeeperError::UntrustedHeader(path));
        }

        self.classified = classify(&header);
        self.report.push(
            WorkflowLevel::Info,
            format!("Keyslots: {}", describe_slots(&self.classified)),
        );

        let tpm = slots_of(&self.classified, AuthKind::Tpm2);
        if tpm.is_empty() {
            self.report.push(WorkflowLevel::Info, "No TPM2 binding found");
        } else {
            self.report.push(
                WorkflowLevel::Info,
                format!("TPM2 bound in slot(s) {tpm:?}"),
            );
        }

        let discovered = discover_recovery_keys(self.config);
        for err in &discovered.invalid {
            self.report
                .push(WorkflowLevel::Warn, format!("Ignored recovery key file: {err}"));
        }
        for record in discovered.valid.into_iter().filter(|r| r.applies_to(&path)) {
            let slots = probe_slots(self.backend, &path, &self.classified, record.value.as_bytes())?;
            if !slots.is_empty() {
                self.report.push(
                    WorkflowLevel::Success,
                    format!(
                        "Recovery key {} ({}) unlocks slot(s) {slots:?}",
                        record.path.display(),
                        record.fingerprint()
                    ),
                );
                self.recovery = RecoveryState::File { record, slots };
                break;
            }
            if self.unused_record.is_none() {
                self.report.push(
                    WorkflowLevel::Warn,
                    format!(
                        "Recovery key file {} does not unlock any keyslot of {}",
                        record.path.display(),
                        path.display()
                    ),
                );
                self.unused_record = Some(record);
            }
        }

        if matches!(self.recovery, RecoveryState::Missing) {
            let token_slots = slots_of(&self.classified, AuthKind::Recovery);
            if token_slots.is_empty() {
                self.report
                    .push(WorkflowLevel::Warn, "No working recovery key found");
            } else {
                self.report.push(
                    WorkflowLevel::Info,
                    format!("systemd recovery key enrolled in slot(s) {token_slots:?}"),
                );
                self.recovery = RecoveryState::Token { slots: token_slots };
            }
        }

        Ok(SetupState::Authenticate)
    }

    fn authenticate(&mut self) -> SlotkeeperResult<SetupState> {
        let path = self.path()?;
        for attempt in 1..=MAX_AUTH_ATTEMPTS {
            let prompt = format!(
                "Current passphrase for {} (attempt {attempt}/{MAX_AUTH_ATTEMPTS})",
                path.display()
            );
            let Some(secret) = self.prompter.secret(&prompt)? else {
                return Err(SlotkeeperError::Aborted(
                    "cancelled at the passphrase prompt".into(),
                ));
            };

            let slots = probe_slots(self.backend, &path, &self.classified, secret.as_bytes())?;
            if !slots.is_empty() {
                self.report.push(
                    WorkflowLevel::Success,
                    format!("Passphrase accepted by slot(s) {slots:?}"),
                );
                self.auth = Some(secret);
                self.auth_slots = slots;
                return Ok(SetupState::RecoveryKeySetup);
            }
            if verify_secret(self.backend, &path, secret.as_bytes())? {
                self.report.push(
                    WorkflowLevel::Success,
                    "Passphrase accepted by a token-bound keyslot",
                );
                self.auth = Some(secret);
                return Ok(SetupState::RecoveryKeySetup);
            }
            self.report.push(
                WorkflowLevel::Warn,
                format!("Passphrase rejected (attempt {attempt}/{MAX_AUTH_ATTEMPTS})"),
            );
        }
        Err(SlotkeeperError::AuthenticationFailed {
            attempts: MAX_AUTH_ATTEMPTS,
        })
    }

    fn recovery_key_setup(&mut self) -> SlotkeeperResult<SetupState> {
        let next = SetupState::NewPasswordInput;
        match &self.recovery {
            RecoveryState::File { record, .. } => {
                self.report.push(
                    WorkflowLevel::Info,
                    format!("Recovery key {} already in place; skipping", record.fingerprint()),
                );
                return Ok(next);
            }
            RecoveryState::Token { .. } => {
                self.report.push(
                    WorkflowLevel::Info,
                    "systemd recovery key already in place; skipping",
                );
                return Ok(next);
            }
            RecoveryState::Missing => {}
        }

        let path = self.path()?;
        let reuse = match self.unused_record.take() {
            Some(record) => {
                let prompt = format!(
                    "Add the existing recovery key from {} ({}) instead of generating a new one?",
                    record.path.display(),
                    record.fingerprint()
                );
                if self.prompter.confirm(&prompt, true)? {
                    Some(record)
                } else {
                    None
                }
            }
            None => None,
        };

        if self.options.dry_run {
            let action = match &reuse {
                Some(record) => format!("add the recovery key from {}", record.path.display()),
                None => format!(
                    "generate a recovery key, save it to {}",
                    default_recovery_path(self.config).display()
                ),
            };
            self.report.push(
                WorkflowLevel::Info,
                format!("[dry-run] would {action} and enroll it in a free keyslot"),
            );
            return Ok(next);
        }

        let auth = self.auth()?;
        let (record, fresh) = match reuse {
            Some(record) => (record, false),
            None => (
                RecoveryKeyRecord::new(
                    &path,
                    generate_recovery_key(),
                    default_recovery_path(self.config),
                )?,
                true,
            ),
        };

        if fresh {
            let rotated = record.write()?;
            self.engine.audit().record_after(
                AuditAction::RecoveryKeyWritten,
                &path,
                None,
                format!("{} fingerprint={}", record.path.display(), record.fingerprint()),
            );
            if let Some(old) = rotated {
                self.report.push(
                    WorkflowLevel::Warn,
                    format!("Previous recovery key file moved to {}", old.display()),
                );
            }
            self.report.push(
                WorkflowLevel::Security,
                format!("Recovery key saved to {} (mode 600)", record.path.display()),
            );
        }

        let slot = self
            .engine
            .add_secret(&path, auth.as_bytes(), record.value.as_bytes())?;
        self.report.push(
            WorkflowLevel::Success,
            format!("Recovery key enrolled in slot {slot}"),
        );
        if fresh {
            self.report.recovery_key = Some(record.value.clone());
        }
        self.recovery = RecoveryState::File {
            record,
            slots: vec![slot],
        };
        Ok(next)
    }

    fn new_password_input(&mut self) -> SlotkeeperResult<SetupState> {
        let next = SetupState::Tpm2Enroll;
        if !self.prompter.confirm("Set a new LUKS passphrase?", true)? {
            self.report
                .push(WorkflowLevel::Info, "Keeping the current passphrase");
            return Ok(next);
        }

        let mut chosen = None;
        for _ in 0..MAX_AUTH_ATTEMPTS {
            let Some(first) = self.prompter.secret("New passphrase")? else {
                return Err(SlotkeeperError::Aborted(
                    "cancelled at the new passphrase prompt".into(),
                ));
            };
            if first.chars().count() < MIN_PASSPHRASE_LEN {
                self.report.push(
                    WorkflowLevel::Warn,
                    format!("New passphrase must be at least {MIN_PASSPHRASE_LEN} characters"),
                );
                continue;
            }
            let Some(second) = self.prompter.secret("Repeat new passphrase")? else {
                return Err(SlotkeeperError::Aborted(
                    "cancelled at the new passphrase prompt".into(),
                ));
            };
            if first.as_str() != second.as_str() {
                self.report
                    .push(WorkflowLevel::Warn, "Passphrases do not match");
                continue;
            }
            chosen = Some(first);
            break;
        }
        let Some(new) = chosen else {
            return Err(SlotkeeperError::Aborted(
                "new passphrase was not confirmed".into(),
            ));
        };

        let path = self.path()?;
        let existing = find_matching_slots(self.backend, &path, new.as_bytes())?;
        if !existing.is_empty() {
            self.report.push(
                WorkflowLevel::Info,
                format!("New passphrase already unlocks slot(s) {existing:?}; not adding it again"),
            );
            self.new_password = Some((new, existing));
            return Ok(next);
        }

        if self.options.dry_run {
            self.report.push(
                WorkflowLevel::Info,
                "[dry-run] would add the new passphrase to a free keyslot",
            );
            self.new_password = Some((new, Vec::new()));
            return Ok(next);
        }

        let auth = self.auth()?;
        let slot = self
            .engine
            .add_secret(&path, auth.as_bytes(), new.as_bytes())?;
        self.report.push(
            WorkflowLevel::Success,
            format!("New passphrase enrolled in slot {slot}"),
        );
        self.new_password = Some((new, vec![slot]));
        Ok(next)
    }

    fn tpm2_enroll(&mut self) -> SlotkeeperResult<SetupState> {
        let next = SetupState::PasswordCleanup;
        let path = self.path()?;
        let existing = slots_of(&classify(&self.backend.read_header(&path)?), AuthKind::Tpm2);

        if !existing.is_empty() && !self.options.reenroll_tpm2 {
            self.report.push(
                WorkflowLevel::Info,
                format!(
                    "TPM2 already enrolled in slot(s) {existing:?}; skipping (pass --reenroll to replace it)"
                ),
            );
            if existing.len() > 1 {
                self.report.push(
                    WorkflowLevel::Warn,
                    format!(
                        "Multiple TPM2 slots {existing:?}; run `slotkeeper cleanup {}` to remove duplicates",
                        path.display()
                    ),
                );
            }
            return Ok(next);
        }

        let pcrs = match &self.options.pcrs {
            Some(spec) => spec.clone(),
            None => self.config.pcr_spec()?,
        };

        if self.options.dry_run {
            let action = if existing.is_empty() {
                "enroll TPM2".to_string()
            } else {
                format!("wipe TPM2 slot(s) {existing:?} and re-enroll TPM2")
            };
            self.report.push(
                WorkflowLevel::Info,
                format!("[dry-run] would {action} sealed to PCRs {pcrs}"),
            );
            return Ok(next);
        }

        let auth = self.auth()?;
        match self.engine.enroll_or_reenroll_tpm2(
            &path,
            auth.as_bytes(),
            &pcrs,
            self.options.reenroll_tpm2,
        )? {
            Tpm2Outcome::AlreadyEnrolled { slots } => {
                self.report.push(
                    WorkflowLevel::Info,
                    format!("TPM2 already enrolled in slot(s) {slots:?}"),
                );
            }
            Tpm2Outcome::Enrolled { slot, replaced } => {
                if !replaced.is_empty() {
                    self.report.push(
                        WorkflowLevel::Info,
                        format!("Previous TPM2 slot(s) {replaced:?} wiped"),
                    );
                }
                self.report.push(
                    WorkflowLevel::Success,
                    format!("TPM2 enrolled in slot {slot} (PCRs {pcrs})"),
                );
            }
        }

        let device = self.device.clone().ok_or_else(no_device)?;
        match self.backend.integrate_boot(&device) {
            Ok(notes) => {
                for note in notes {
                    self.report.push(WorkflowLevel::Info, note);
                }
            }
            Err(err) => {
                let mut message = format!("Boot integration failed: {err}");
                if let Some(fix) = err.remediation() {
                    message.push_str(&format!(" ({fix})"));
                }
                self.report.push(WorkflowLevel::Error, message);
            }
        }
        Ok(next)
    }

    fn password_cleanup(&mut self) -> SlotkeeperResult<SetupState> {
        let next = SetupState::Verify;
        let mut protected: BTreeSet<u8> = BTreeSet::new();
        if let RecoveryState::File { slots, .. } = &self.recovery {
            protected.extend(slots.iter().copied());
        }
        if let Some((_, slots)) = &self.new_password {
            protected.extend(slots.iter().copied());
        }
        let candidates: Vec<u8> = self
            .auth_slots
            .iter()
            .copied()
            .filter(|slot| !protected.contains(slot))
            .collect();
        if candidates.is_empty() {
            self.report
                .push(WorkflowLevel::Info, "No old passphrase slots to remove");
            return Ok(next);
        }

        let survivor = match (&self.new_password, &self.recovery) {
            (Some((secret, _)), _) => Some(secret.clone()),
            (None, RecoveryState::File { record, .. }) => Some(record.value.clone()),
            _ => None,
        };
        let Some(survivor) = survivor else {
            self.report.push(
                WorkflowLevel::Info,
                "Keeping the current passphrase: no replacement passphrase or recovery key to authenticate with",
            );
            return Ok(next);
        };

        let prompt = format!(
            "Remove the passphrase you authenticated with from slot(s) {candidates:?}?"
        );
        if !self.prompter.confirm(&prompt, false)? {
            self.report.push(
                WorkflowLevel::Info,
                format!("Keeping old passphrase slot(s) {candidates:?}"),
            );
            return Ok(next);
        }

        if self.options.dry_run {
            self.report.push(
                WorkflowLevel::Info,
                format!("[dry-run] would remove slot(s) {candidates:?}"),
            );
            return Ok(next);
        }

        let path = self.path()?;
        let policy = RemovalPolicy::new(self.config.safety.min_remaining_auth_methods)
            .with_force(self.options.force);
        let outcome = match self
            .engine
            .remove_slots(&path, survivor.as_bytes(), &candidates, &policy)
        {
            Ok(outcome) => outcome,
            Err(err) if err.is_safety_rejection() => {
                let mut message = format!("Old passphrase kept: {err}");
                if let Some(fix) = err.remediation() {
                    message.push_str(&format!(" ({fix})"));
                }
                self.report.push(WorkflowLevel::Warn, message);
                return Ok(next);
            }
            Err(err) => return Err(err),
        };

        for slot in &outcome.removed {
            self.report.push(
                WorkflowLevel::Success,
                format!("Removed old passphrase from slot {slot}"),
            );
        }
        for failure in &outcome.failed {
            self.report.push(
                WorkflowLevel::Error,
                format!("Failed to remove slot {}: {}", failure.slot, failure.reason),
            );
        }
        for slot in &outcome.skipped {
            self.report.push(
                WorkflowLevel::Error,
                format!("Slot {slot} left untouched after interrupt"),
            );
        }
        if !outcome.removed.is_empty() {
            self.auth_slots.retain(|slot| !outcome.removed.contains(slot));
            if self.auth_slots.is_empty() {
                self.auth = Some(survivor);
            }
        }
        Ok(next)
    }

    fn verify(&mut self) -> SlotkeeperResult<SetupState> {
        if self.options.dry_run {
            self.report
                .push(WorkflowLevel::Info, "[dry-run] no changes were made");
            return Ok(SetupState::Done);
        }

        let path = self.path()?;
        let classified = classify(&self.backend.read_header(&path)?);
        let mut failures = Vec::new();

        match &self.recovery {
            RecoveryState::File { record, .. } => {
                let slots = probe_slots(self.backend, &path, &classified, record.value.as_bytes())?;
                if slots.is_empty() {
                    failures.push(format!(
                        "recovery key from {} does not unlock any keyslot",
                        record.path.display()
                    ));
                } else {
                    self.report.push(
                        WorkflowLevel::Success,
                        format!("Recovery key verified (slot(s) {slots:?})"),
                    );
                }
            }
            RecoveryState::Token { slots } => {
                let missing: Vec<u8> = slots
                    .iter()
                    .copied()
                    .filter(|slot| classified.get(slot) != Some(&AuthKind::Recovery))
                    .collect();
                if missing.is_empty() {
                    self.report.push(
                        WorkflowLevel::Success,
                        format!("systemd recovery key still enrolled (slot(s) {slots:?})"),
                    );
                } else {
                    failures.push(format!("systemd recovery slot(s) {missing:?} disappeared"));
                }
            }
            RecoveryState::Missing => failures.push("no recovery key is enrolled".into()),
        }

        if let Some((secret, _)) = &self.new_password {
            let slots = probe_slots(self.backend, &path, &classified, secret.as_bytes())?;
            if slots.is_empty() {
                failures.push("new passphrase does not unlock any keyslot".into());
            } else {
                self.report.push(
                    WorkflowLevel::Success,
                    format!("New passphrase verified (slot(s) {slots:?})"),
                );
            }
        }

        let tpm = slots_of(&classified, AuthKind::Tpm2);
        if tpm.is_empty() {
            failures.push("no TPM2 keyslot present".into());
        }
        for slot in &tpm {
            if !self.backend.supports_slot_unlock_test() {
                self.report.push(
                    WorkflowLevel::Info,
                    format!(
                        "TPM2 slot {slot} present; {} cannot test it, the next boot will",
                        self.backend.kind()
                    ),
                );
                continue;
            }
            match self.backend.test_tpm2_slot(&path, *slot) {
                Ok(Some(true)) => self.report.push(
                    WorkflowLevel::Success,
                    format!("TPM2 slot {slot} unseals with the current PCR values"),
                ),
                Ok(Some(false)) => failures.push(format!(
                    "TPM2 slot {slot} does not unseal with the current PCR values"
                )),
                Ok(None) | Err(SlotkeeperError::Timeout { .. }) => self.report.push(
                    WorkflowLevel::Warn,
                    format!("TPM2 unlock test for slot {slot} was inconclusive"),
                ),
                Err(err) => return Err(err),
            }
        }

        if !failures.is_empty() {
            return Err(SlotkeeperError::VerificationFailed {
                device: path,
                failures,
            });
        }

        self.report.push(
            WorkflowLevel::Success,
            format!("Final keyslots: {}", describe_slots(&classified)),
        );
        Ok(SetupState::Done)
    }

    fn path(&self) -> SlotkeeperResult<PathBuf> {
        self.device
            .as_ref()
            .map(|device| device.path.clone())
            .ok_or_else(no_device)
    }

    fn auth(&self) -> SlotkeeperResult<Zeroizing<String>> {
        self.auth
            .clone()
            .ok_or_else(|| SlotkeeperError::Aborted("no authenticated passphrase".into()))
    }
}

fn no_device() -> SlotkeeperError {
    SlotkeeperError::Aborted("no device selected".into())
}
