//! Lockout protection for keyslot removal.
//!
//! Every removal batch, whether requested by cleanup, setup, or a TPM2
//! re-enrollment, goes through [`validate_removal`] against a freshly
//! classified header before anything is destroyed.

use crate::classify::{AuthKind, SlotMap};
use crate::error::{SlotkeeperError, SlotkeeperResult};
use log::warn;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Caller-supplied policy for one removal batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalPolicy {
    /// Slots that must survive the batch.
    pub min_remaining: usize,
    /// Accept ending up below `min_remaining` (never below one slot).
    pub force: bool,
    /// Unknown/ambiguous slots the operator confirmed one by one.
    pub confirmed_unclassified: BTreeSet<u8>,
}

impl RemovalPolicy {
    pub fn new(min_remaining: usize) -> Self {
        Self {
            min_remaining: min_remaining.max(1),
            force: false,
            confirmed_unclassified: BTreeSet::new(),
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn confirm_unclassified(mut self, slot: u8) -> Self {
        self.confirmed_unclassified.insert(slot);
        self
    }
}

impl Default for RemovalPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Reject removal batches that would lock the operator out.
///
/// Checks run in order: nothing left at all, no fallback method left, fewer
/// than the configured minimum (skippable only with `force`), then
/// unknown/ambiguous slots that were not individually confirmed.
pub fn validate_removal(
    device: &Path,
    classified: &SlotMap,
    to_remove: &[u8],
    policy: &RemovalPolicy,
) -> SlotkeeperResult<()> {
    let removal: BTreeSet<u8> = to_remove.iter().copied().collect();
    let slots: Vec<u8> = removal.iter().copied().collect();

    for slot in &removal {
        if !classified.contains_key(slot) {
            return Err(SlotkeeperError::SlotNotEnabled {
                device: PathBuf::from(device),
                slot: *slot,
            });
        }
    }

    let survivors: Vec<AuthKind> = classified
        .iter()
        .filter(|(slot, _)| !removal.contains(slot))
        .map(|(_, kind)| *kind)
        .collect();
    let remaining = survivors.len();

    if remaining < 1 {
        return Err(SlotkeeperError::WouldLockOut { slots });
    }

    let remaining_passwords = survivors
        .iter()
        .filter(|kind| **kind == AuthKind::Password)
        .count();
    let other_fallback = survivors
        .iter()
        .any(|kind| matches!(kind, AuthKind::Tpm2 | AuthKind::Recovery));
    if remaining_passwords == 0 && !other_fallback {
        return Err(SlotkeeperError::NoFallbackAuth { slots });
    }

    if remaining < policy.min_remaining {
        if policy.force {
            warn!(
                "--force: removing slots {:?} from {} leaves {} method(s), below the minimum of {}",
                slots,
                device.display(),
                remaining,
                policy.min_remaining
            );
        } else {
            return Err(SlotkeeperError::BelowMinimumAuthMethods {
                slots,
                remaining,
                minimum: policy.min_remaining,
            });
        }
    }

    for slot in &removal {
        let kind = classified[slot];
        if !kind.auto_removable() && !policy.confirmed_unclassified.contains(slot) {
            return Err(SlotkeeperError::UnconfirmedSlot {
                slot: *slot,
                kind: kind.to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(u8, AuthKind)]) -> SlotMap {
        entries.iter().copied().collect()
    }

    fn dev() -> &'static Path {
        Path::new("/dev/test")
    }

    #[test]
    fn refuses_to_remove_everything() {
        let slots = map(&[(0, AuthKind::Password), (1, AuthKind::Tpm2)]);
        let err = validate_removal(dev(), &slots, &[0, 1], &RemovalPolicy::new(1).with_force(true))
            .unwrap_err();
        assert!(matches!(err, SlotkeeperError::WouldLockOut { .. }));
    }

    #[test]
    fn refuses_when_only_hardware_tokens_remain() {
        let slots = map(&[(0, AuthKind::Password), (1, AuthKind::Fido2)]);
        let err = validate_removal(dev(), &slots, &[0], &RemovalPolicy::new(1)).unwrap_err();
        assert!(matches!(err, SlotkeeperError::NoFallbackAuth { .. }));
    }

    #[test]
    fn tpm2_alone_counts_as_fallback_but_trips_minimum() {
        let slots = map(&[(0, AuthKind::Password), (1, AuthKind::Tpm2)]);
        let err = validate_removal(dev(), &slots, &[0], &RemovalPolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            SlotkeeperError::BelowMinimumAuthMethods {
                remaining: 1,
                minimum: 2,
                ..
            }
        ));
        validate_removal(dev(), &slots, &[0], &RemovalPolicy::default().with_force(true)).unwrap();
    }

    #[test]
    fn unknown_slots_need_individual_confirmation() {
        let slots = map(&[
            (0, AuthKind::Password),
            (1, AuthKind::Tpm2),
            (2, AuthKind::Unknown),
            (3, AuthKind::Password),
        ]);
        let err = validate_removal(dev(), &slots, &[2], &RemovalPolicy::default()).unwrap_err();
        assert!(matches!(err, SlotkeeperError::UnconfirmedSlot { slot: 2, .. }));

        let policy = RemovalPolicy::default().confirm_unclassified(2);
        validate_removal(dev(), &slots, &[2], &policy).unwrap();
    }

    #[test]
    fn rejects_slots_that_are_not_enabled() {
        let slots = map(&[(0, AuthKind::Password), (1, AuthKind::Password)]);
        let err = validate_removal(dev(), &slots, &[4], &RemovalPolicy::new(1)).unwrap_err();
        assert!(matches!(err, SlotkeeperError::SlotNotEnabled { slot: 4, .. }));
    }

    #[test]
    fn duplicate_indices_count_once() {
        let slots = map(&[
            (0, AuthKind::Password),
            (1, AuthKind::Tpm2),
            (2, AuthKind::Tpm2),
        ]);
        validate_removal(dev(), &slots, &[2, 2], &RemovalPolicy::default()).unwrap();
    }
}
