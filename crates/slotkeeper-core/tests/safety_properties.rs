//! Property tests for the removal safety rules and the classifier.

use proptest::prelude::*;
use slotkeeper_core::classify::{classify, AuthKind, SlotMap};
use slotkeeper_core::error::SlotkeeperError;
use slotkeeper_core::safety::{validate_removal, RemovalPolicy};
use slotkeeper_provider::luks::{Keyslot, LuksHeader, LuksVersion, Token};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

fn fallback_kind() -> impl Strategy<Value = AuthKind> {
    prop_oneof![
        Just(AuthKind::Password),
        Just(AuthKind::Tpm2),
        Just(AuthKind::Recovery),
    ]
}

fn any_kind() -> impl Strategy<Value = AuthKind> {
    prop_oneof![
        Just(AuthKind::Password),
        Just(AuthKind::Tpm2),
        Just(AuthKind::Recovery),
        Just(AuthKind::Fido2),
        Just(AuthKind::OtherToken),
        Just(AuthKind::Ambiguous),
        Just(AuthKind::Unknown),
    ]
}

fn slot_map(kind: impl Strategy<Value = AuthKind>) -> impl Strategy<Value = SlotMap> {
    prop::collection::btree_map(0u8..32, kind, 1..8)
}

/// A map plus a removal subset drawn from its slots.
fn map_and_subset(
    kind: impl Strategy<Value = AuthKind>,
) -> impl Strategy<Value = (SlotMap, Vec<u8>)> {
    slot_map(kind).prop_flat_map(|map| {
        let slots: Vec<u8> = map.keys().copied().collect();
        let len = slots.len();
        (
            Just(map),
            prop::sample::subsequence(slots, 0..=len),
        )
    })
}

fn device() -> &'static Path {
    Path::new("/dev/vda3")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// With only fallback-capable kinds, `--force`, and a minimum of one, the
    /// only rejection left is removing every slot.
    #[test]
    fn forced_removal_rejects_only_total_lockout((map, subset) in map_and_subset(fallback_kind())) {
        let policy = RemovalPolicy::new(1).with_force(true);
        let result = validate_removal(device(), &map, &subset, &policy);
        let remaining = map.len() - subset.len();
        if remaining == 0 {
            prop_assert!(
                matches!(result, Err(SlotkeeperError::WouldLockOut { .. })),
                "{:?}",
                result
            );
        } else {
            prop_assert!(result.is_ok(), "{:?}", result);
        }
    }

    /// Removing every enabled slot is refused whatever the policy says.
    #[test]
    fn removing_everything_is_always_rejected(
        map in slot_map(any_kind()),
        min in 1usize..5,
        force in any::<bool>(),
    ) {
        let all: Vec<u8> = map.keys().copied().collect();
        let mut policy = RemovalPolicy::new(min).with_force(force);
        for slot in &all {
            policy = policy.confirm_unclassified(*slot);
        }
        let result = validate_removal(device(), &map, &all, &policy);
        prop_assert!(
            matches!(result, Err(SlotkeeperError::WouldLockOut { .. })),
            "{:?}",
            result
        );
    }

    /// An accepted batch always leaves a fallback method and, unless forced,
    /// at least the configured number of slots.
    #[test]
    fn accepted_batches_leave_a_way_in(
        (map, subset) in map_and_subset(any_kind()),
        min in 1usize..4,
    ) {
        let policy = RemovalPolicy::new(min);
        if validate_removal(device(), &map, &subset, &policy).is_ok() {
            let removed: BTreeSet<u8> = subset.iter().copied().collect();
            let survivors: Vec<AuthKind> = map
                .iter()
                .filter(|(slot, _)| !removed.contains(slot))
                .map(|(_, kind)| *kind)
                .collect();
            prop_assert!(survivors.len() >= min);
            prop_assert!(survivors
                .iter()
                .any(|kind| matches!(kind, AuthKind::Password | AuthKind::Tpm2 | AuthKind::Recovery)));
            prop_assert!(subset.iter().all(|slot| map[slot].auto_removable()));
        }
    }

    /// Every enabled slot is classified exactly once and disabled slots never
    /// show up, whatever tokens point at them.
    #[test]
    fn classification_covers_exactly_the_enabled_slots(
        enabled in prop::collection::btree_map(0u8..32, any::<bool>(), 0..12),
        links in prop::collection::vec((0u8..32, 0usize..3), 0..6),
    ) {
        let token_types = ["systemd-tpm2", "systemd-recovery", "systemd-fido2"];
        let header = LuksHeader {
            version: LuksVersion::Luks2,
            uuid: None,
            keyslots: enabled
                .iter()
                .map(|(index, on)| Keyslot {
                    index: *index,
                    enabled: *on,
                    slot_type: Some("luks2".into()),
                    priority: None,
                    unbound: false,
                })
                .collect(),
            tokens: links
                .iter()
                .enumerate()
                .map(|(id, (slot, ty))| Token {
                    id: id as u32,
                    token_type: token_types[*ty].into(),
                    keyslots: vec![*slot],
                    fields: BTreeMap::new(),
                })
                .collect(),
            warnings: Vec::new(),
            raw: String::new(),
        };

        let classified = classify(&header);
        let expected: Vec<u8> = enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(index, _)| *index)
            .collect();
        prop_assert_eq!(classified.keys().copied().collect::<Vec<_>>(), expected);
        for (slot, kind) in &classified {
            let linked = links.iter().filter(|(target, _)| target == slot).count();
            match linked {
                0 => prop_assert_eq!(*kind, AuthKind::Password),
                1 => prop_assert!(kind.is_fallback() || *kind == AuthKind::Fido2),
                _ => prop_assert_eq!(*kind, AuthKind::Ambiguous),
            }
        }
    }
}
