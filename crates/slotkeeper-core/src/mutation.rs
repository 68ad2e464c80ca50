//! Header mutations: keyslot removal, passphrase addition, TPM2 (re)enrollment.
//!
//! Each entry point re-reads and re-classifies the header, refuses devices
//! whose header did not parse cleanly, snapshots the header, performs the
//! change without retrying, and re-reads the device to confirm the result.

use crate::audit::{AuditAction, AuditLog};
use crate::backup::HeaderBackups;
use crate::classify::{classify, slots_of, AuthKind, SlotMap};
use crate::config::SlotkeeperConfig;
use crate::error::{SlotkeeperError, SlotkeeperResult};
use crate::interrupt::{self, CancelToken};
use crate::probe::verify_secret;
use crate::safety::{validate_removal, RemovalPolicy};
use log::{info, warn};
use slotkeeper_provider::luks::{LuksBackend, LuksHeader};
use slotkeeper_provider::pcr::PcrSpec;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Per-slot failure inside a removal batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotFailure {
    pub slot: u8,
    pub reason: String,
}

/// Aggregate result of a removal batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub removed: Vec<u8>,
    pub failed: Vec<SlotFailure>,
    /// Slots never attempted because of an interrupt.
    pub skipped: Vec<u8>,
    pub backup: Option<PathBuf>,
}

impl RemovalOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Result of a TPM2 enrollment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tpm2Outcome {
    /// A TPM2 slot was already present and replacement was not requested.
    AlreadyEnrolled { slots: Vec<u8> },
    /// A fresh binding now lives in `slot`; `replaced` lists wiped slots.
    Enrolled { slot: u8, replaced: Vec<u8> },
}

/// Guarded front door for every header change.
pub struct MutationEngine<'a, B> {
    backend: &'a B,
    audit: AuditLog,
    backups: HeaderBackups,
    cancel: CancelToken,
}

impl<'a, B> MutationEngine<'a, B>
where
    B: LuksBackend<Error = SlotkeeperError>,
{
    pub fn new(backend: &'a B, audit: AuditLog, backups: HeaderBackups, cancel: CancelToken) -> Self {
        Self {
            backend,
            audit,
            backups,
            cancel,
        }
    }

    /// Engine wired to the configured audit/backup paths and the global
    /// Ctrl-C token.
    pub fn from_config(backend: &'a B, config: &SlotkeeperConfig) -> Self {
        Self::new(
            backend,
            AuditLog::new(config.audit_log_path()),
            HeaderBackups::new(config.backup_dir()),
            interrupt::global().clone(),
        )
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Remove `slots` after the safety checks pass.
    ///
    /// A rejected batch removes nothing. Once removal starts, a failing slot is
    /// recorded and the batch moves on to the next one.
    pub fn remove_slots(
        &self,
        device: &Path,
        auth: &[u8],
        slots: &[u8],
        policy: &RemovalPolicy,
    ) -> SlotkeeperResult<RemovalOutcome> {
        let ordered: Vec<u8> = slots
            .iter()
            .copied()
            .collect::<BTreeSet<u8>>()
            .into_iter()
            .collect();
        let mut outcome = RemovalOutcome::default();
        if ordered.is_empty() {
            return Ok(outcome);
        }

        let (header, classified) = self.fresh_state(device)?;
        validate_removal(device, &classified, &ordered, policy)?;
        self.check_cancel(ordered.len())?;

        let remaining = classified.len() - ordered.len();
        if policy.force && remaining < policy.min_remaining {
            self.audit.record(
                AuditAction::ForceOverride,
                device,
                None,
                format!(
                    "removing {:?} leaves {remaining} method(s), minimum {}",
                    ordered, policy.min_remaining
                ),
            )?;
        }

        let _guard = self.cancel.enter_mutation();
        outcome.backup = Some(self.backup(device, &header)?);

        for (pos, slot) in ordered.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(
                    "interrupt received; leaving slots {:?} on {} untouched",
                    &ordered[pos..],
                    device.display()
                );
                outcome.skipped.extend_from_slice(&ordered[pos..]);
                break;
            }

            let kind = classified[slot];
            if let Err(err) = self.audit.record(
                AuditAction::RemoveAttempt,
                device,
                Some(*slot),
                format!("kind={kind}"),
            ) {
                warn!("audit log unavailable ({err}); stopping before slot {slot}");
                outcome.skipped.extend_from_slice(&ordered[pos..]);
                break;
            }

            match self.backend.remove_slot(device, auth, *slot) {
                Ok(()) => {
                    info!("removed {kind} slot {slot} from {}", device.display());
                    outcome.removed.push(*slot);
                    self.audit
                        .record_after(AuditAction::RemoveSuccess, device, Some(*slot), "ok");
                }
                Err(err) => {
                    warn!("failed to remove slot {slot} from {}: {err}", device.display());
                    self.audit.record_after(
                        AuditAction::RemoveFailed,
                        device,
                        Some(*slot),
                        err.to_string(),
                    );
                    outcome.failed.push(SlotFailure {
                        slot: *slot,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if !outcome.removed.is_empty() {
            let after = self.backend.read_header(device)?;
            let reported = std::mem::take(&mut outcome.removed);
            let mut confirmed = Vec::with_capacity(reported.len());
            for slot in reported {
                if after.is_enabled(slot) {
                    self.audit.record_after(
                        AuditAction::RemoveFailed,
                        device,
                        Some(slot),
                        "backend reported success but the slot is still enabled",
                    );
                    outcome.failed.push(SlotFailure {
                        slot,
                        reason: "backend reported success but the slot is still enabled".into(),
                    });
                } else {
                    confirmed.push(slot);
                }
            }
            outcome.removed = confirmed;
        }

        Ok(outcome)
    }

    /// Add `new_secret` as a passphrase and return the slot it landed in.
    pub fn add_secret(&self, device: &Path, auth: &[u8], new_secret: &[u8]) -> SlotkeeperResult<u8> {
        if new_secret.is_empty() {
            return Err(SlotkeeperError::Aborted("refusing to add an empty passphrase".into()));
        }

        let (header, _) = self.fresh_state(device)?;
        let before: BTreeSet<u8> = header.enabled_slots().into_iter().collect();
        self.check_cancel(1)?;

        let _guard = self.cancel.enter_mutation();
        self.backup(device, &header)?;

        if let Err(err) = self.backend.add_key(device, auth, new_secret, None) {
            self.audit
                .record_after(AuditAction::AddKeyFailed, device, None, err.to_string());
            return Err(err);
        }

        let after = self.backend.read_header(device)?;
        let fresh: Vec<u8> = after
            .enabled_slots()
            .into_iter()
            .filter(|slot| !before.contains(slot))
            .collect();

        let mut landed = None;
        for slot in &fresh {
            if self.backend.test_passphrase(device, Some(*slot), new_secret)? {
                landed = Some(*slot);
                break;
            }
        }

        match landed {
            Some(slot) => {
                self.audit
                    .record_after(AuditAction::AddKey, device, Some(slot), "verified");
                info!("added passphrase in slot {slot} of {}", device.display());
                Ok(slot)
            }
            None => {
                let reason = if fresh.is_empty() {
                    "add-key reported success but no new keyslot appeared".to_string()
                } else {
                    format!("new keyslot(s) {fresh:?} do not accept the new passphrase")
                };
                self.audit
                    .record_after(AuditAction::AddKeyFailed, device, None, reason.clone());
                Err(SlotkeeperError::VerificationFailed {
                    device: device.to_path_buf(),
                    failures: vec![reason],
                })
            }
        }
    }

    /// Enroll TPM2, replacing an existing binding when `replace_existing`.
    ///
    /// Replacement wipes first and only enrolls once the wipe is confirmed, so
    /// two TPM2 bindings never coexist. If enrollment fails after a wipe the
    /// error says the device is not enrolled.
    pub fn enroll_or_reenroll_tpm2(
        &self,
        device: &Path,
        auth: &[u8],
        pcrs: &PcrSpec,
        replace_existing: bool,
    ) -> SlotkeeperResult<Tpm2Outcome> {
        let (header, classified) = self.fresh_state(device)?;
        let existing = slots_of(&classified, AuthKind::Tpm2);
        if !existing.is_empty() && !replace_existing {
            return Ok(Tpm2Outcome::AlreadyEnrolled { slots: existing });
        }

        if !verify_secret(self.backend, device, auth)? {
            return Err(SlotkeeperError::AuthenticationFailed { attempts: 1 });
        }
        self.check_cancel(1)?;

        let _guard = self.cancel.enter_mutation();
        self.backup(device, &header)?;

        if !existing.is_empty() {
            validate_removal(device, &classified, &existing, &RemovalPolicy::new(1))?;
            self.audit.record(
                AuditAction::RemoveAttempt,
                device,
                None,
                format!("wipe tpm2 slots {existing:?} before re-enrollment"),
            )?;
            if let Err(err) = self.backend.wipe_tpm2(device, auth) {
                self.audit
                    .record_after(AuditAction::WipeFailed, device, None, err.to_string());
                return Err(err);
            }

            let leftover = slots_of(&classify(&self.backend.read_header(device)?), AuthKind::Tpm2);
            if !leftover.is_empty() {
                let reason = format!("TPM2 slots {leftover:?} still present after wipe; enrollment skipped");
                self.audit
                    .record_after(AuditAction::WipeFailed, device, None, reason.clone());
                return Err(SlotkeeperError::VerificationFailed {
                    device: device.to_path_buf(),
                    failures: vec![reason],
                });
            }
            self.audit.record_after(
                AuditAction::Wipe,
                device,
                None,
                format!("removed tpm2 slots {existing:?}"),
            );

            if self.cancel.is_cancelled() {
                return Err(SlotkeeperError::Tpm2EnrollFailed {
                    device: device.to_path_buf(),
                    reason: "interrupted after the previous binding was wiped".into(),
                    previous_wiped: true,
                });
            }
        }

        if let Err(err) = self.backend.enroll_tpm2(device, auth, pcrs) {
            self.audit
                .record_after(AuditAction::EnrollFailed, device, None, err.to_string());
            return Err(SlotkeeperError::Tpm2EnrollFailed {
                device: device.to_path_buf(),
                reason: err.to_string(),
                previous_wiped: !existing.is_empty(),
            });
        }

        let enrolled = slots_of(&classify(&self.backend.read_header(device)?), AuthKind::Tpm2);
        match enrolled.as_slice() {
            [slot] => {
                self.audit.record_after(
                    AuditAction::Enroll,
                    device,
                    Some(*slot),
                    format!("pcrs={pcrs}"),
                );
                info!("TPM2 enrolled in slot {slot} of {}", device.display());
                Ok(Tpm2Outcome::Enrolled {
                    slot: *slot,
                    replaced: existing,
                })
            }
            [] => {
                let reason = "enrollment reported success but no TPM2 keyslot is present";
                self.audit
                    .record_after(AuditAction::EnrollFailed, device, None, reason);
                Err(SlotkeeperError::Tpm2EnrollFailed {
                    device: device.to_path_buf(),
                    reason: reason.into(),
                    previous_wiped: !existing.is_empty(),
                })
            }
            many => {
                let reason = format!("multiple TPM2 slots {many:?} present after enrollment; run cleanup");
                self.audit
                    .record_after(AuditAction::EnrollFailed, device, None, reason.clone());
                Err(SlotkeeperError::VerificationFailed {
                    device: device.to_path_buf(),
                    failures: vec![reason],
                })
            }
        }
    }

    fn fresh_state(&self, device: &Path) -> SlotkeeperResult<(LuksHeader, SlotMap)> {
        let header = self.backend.read_header(device)?;
        if !header.warnings.is_empty() {
            warn!(
                "header of {} has unparsed content: {:?}",
                device.display(),
                header.warnings
            );
            return Err(SlotkeeperError::UntrustedHeader(device.to_path_buf()));
        }
        let classified = classify(&header);
        Ok((header, classified))
    }

    fn backup(&self, device: &Path, header: &LuksHeader) -> SlotkeeperResult<PathBuf> {
        let path = self.backups.write(device, header)?;
        self.audit.record(
            AuditAction::Backup,
            device,
            None,
            format!("header saved to {}", path.display()),
        )?;
        Ok(path)
    }

    fn check_cancel(&self, pending: usize) -> SlotkeeperResult<()> {
        if self.cancel.is_cancelled() {
            Err(SlotkeeperError::Interrupted { pending })
        } else {
            Ok(())
        }
    }
}
