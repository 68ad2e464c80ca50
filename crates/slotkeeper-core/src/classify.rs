//! Keyslot classification.
//!
//! Turns a parsed header into one [`AuthKind`] per enabled keyslot. This is a
//! pure function of the header: callers re-read the device and re-classify
//! before every decision instead of holding on to an old map.

use slotkeeper_provider::luks::{LuksHeader, LuksVersion, Token};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Authentication method a keyslot is believed to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuthKind {
    Password,
    Recovery,
    Tpm2,
    Fido2,
    OtherToken,
    /// Referenced by more than one token; needs a human to sort out.
    Ambiguous,
    /// Header data the parser could not interpret.
    Unknown,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Password => "password",
            AuthKind::Recovery => "recovery",
            AuthKind::Tpm2 => "tpm2",
            AuthKind::Fido2 => "fido2",
            AuthKind::OtherToken => "other-token",
            AuthKind::Ambiguous => "ambiguous",
            AuthKind::Unknown => "unknown",
        }
    }

    /// Kinds that may appear in an automatically computed removal set.
    pub fn auto_removable(&self) -> bool {
        !matches!(self, AuthKind::Ambiguous | AuthKind::Unknown)
    }

    /// Kinds that let an operator in without a TPM or hardware token.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            AuthKind::Password | AuthKind::Recovery | AuthKind::Tpm2
        )
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification result keyed by keyslot index.
pub type SlotMap = BTreeMap<u8, AuthKind>;

/// Map a LUKS2 token to the kind of keyslot it unlocks.
pub fn token_kind(token: &Token) -> AuthKind {
    let token_type = token.token_type.trim().to_ascii_lowercase();
    if token_type.is_empty() {
        return AuthKind::Unknown;
    }

    match token_type.as_str() {
        "systemd-tpm2" => AuthKind::Tpm2,
        "systemd-fido2" => AuthKind::Fido2,
        "systemd-recovery" => AuthKind::Recovery,
        // luksDump alone does not name the pin; only `clevis luks list` does.
        "clevis" => match token.fields.get("pin") {
            Some(pin) if pin.contains("tpm2") => AuthKind::Tpm2,
            Some(_) => AuthKind::OtherToken,
            None => AuthKind::Unknown,
        },
        other if other.contains("tpm2") => AuthKind::Tpm2,
        _ => AuthKind::OtherToken,
    }
}

/// Classify every enabled keyslot in `header`.
///
/// Never fails. LUKS1 slots are always passwords. On LUKS2 a slot with no
/// token is a password and a slot referenced by two or more tokens is
/// ambiguous. Unbound keyslots and types other than `luks2` are unknown.
pub fn classify(header: &LuksHeader) -> SlotMap {
    let enabled = header.enabled_slots();

    if header.version == LuksVersion::Luks1 {
        return enabled
            .into_iter()
            .map(|slot| (slot, AuthKind::Password))
            .collect();
    }

    let mut linked: HashMap<u8, Vec<AuthKind>> = HashMap::new();
    for token in &header.tokens {
        let kind = token_kind(token);
        for slot in &token.keyslots {
            linked.entry(*slot).or_default().push(kind);
        }
    }

    enabled
        .into_iter()
        .map(|slot| {
            let keyslot = header.keyslot(slot);
            let unbound = keyslot.map_or(false, |keyslot| keyslot.unbound);
            let slot_type = keyslot
                .and_then(|keyslot| keyslot.slot_type.as_deref())
                .map(str::to_ascii_lowercase);
            let kind = match (slot_type.as_deref(), linked.get(&slot)) {
                _ if unbound => AuthKind::Unknown,
                (Some(ty), _) if ty != "luks2" => AuthKind::Unknown,
                (_, None) => AuthKind::Password,
                (_, Some(kinds)) if kinds.len() > 1 => AuthKind::Ambiguous,
                (_, Some(kinds)) => kinds[0],
            };
            (slot, kind)
        })
        .collect()
}

/// Slots of `kind` in ascending order.
pub fn slots_of(map: &SlotMap, kind: AuthKind) -> Vec<u8> {
    map.iter()
        .filter(|(_, k)| **k == kind)
        .map(|(slot, _)| *slot)
        .collect()
}

/// Count slots per kind, for reports.
pub fn summarize(map: &SlotMap) -> BTreeMap<AuthKind, usize> {
    let mut counts = BTreeMap::new();
    for kind in map.values() {
        *counts.entry(*kind).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotkeeper_provider::luks::Keyslot;

    fn slot(index: u8) -> Keyslot {
        Keyslot {
            index,
            enabled: true,
            slot_type: Some("luks2".into()),
            priority: None,
            unbound: false,
        }
    }

    fn token(id: u32, ty: &str, keyslots: &[u8]) -> Token {
        Token {
            id,
            token_type: ty.into(),
            keyslots: keyslots.to_vec(),
            fields: BTreeMap::new(),
        }
    }

    fn luks2(keyslots: Vec<Keyslot>, tokens: Vec<Token>) -> LuksHeader {
        LuksHeader {
            version: LuksVersion::Luks2,
            uuid: None,
            keyslots,
            tokens,
            warnings: Vec::new(),
            raw: String::new(),
        }
    }

    #[test]
    fn luks1_slots_are_passwords() {
        let header = LuksHeader {
            version: LuksVersion::Luks1,
            uuid: None,
            keyslots: vec![
                Keyslot {
                    index: 0,
                    enabled: true,
                    slot_type: None,
                    priority: None,
                    unbound: false,
                },
                Keyslot {
                    index: 1,
                    enabled: false,
                    slot_type: None,
                    priority: None,
                    unbound: false,
                },
                Keyslot {
                    index: 3,
                    enabled: true,
                    slot_type: None,
                    priority: None,
                    unbound: false,
                },
            ],
            tokens: Vec::new(),
            warnings: Vec::new(),
            raw: String::new(),
        };
        let map = classify(&header);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&0], AuthKind::Password);
        assert_eq!(map[&3], AuthKind::Password);
    }

    #[test]
    fn luks2_tokens_map_to_kinds() {
        let header = luks2(
            (0..6).map(slot).collect(),
            vec![
                token(0, "systemd-tpm2", &[1]),
                token(1, "systemd-recovery", &[2]),
                token(2, "systemd-fido2", &[3]),
                token(3, "clevis", &[4]),
                token(4, "vendor-smartcard", &[5]),
            ],
        );
        let map = classify(&header);
        assert_eq!(map[&0], AuthKind::Password);
        assert_eq!(map[&1], AuthKind::Tpm2);
        assert_eq!(map[&2], AuthKind::Recovery);
        assert_eq!(map[&3], AuthKind::Fido2);
        assert_eq!(map[&4], AuthKind::Unknown);
        assert_eq!(map[&5], AuthKind::OtherToken);
    }

    #[test]
    fn clevis_tpm2_pin_is_tpm2() {
        let mut bound = token(0, "clevis", &[1]);
        bound.fields.insert("pin".into(), "tpm2".into());
        let header = luks2(vec![slot(0), slot(1)], vec![bound]);
        assert_eq!(classify(&header)[&1], AuthKind::Tpm2);
    }

    #[test]
    fn clevis_without_pin_is_never_tpm2() {
        let header = luks2(
            vec![slot(0), slot(1), slot(2)],
            vec![token(0, "systemd-tpm2", &[1]), token(1, "clevis", &[2])],
        );
        let map = classify(&header);
        assert_eq!(map[&1], AuthKind::Tpm2);
        assert_eq!(map[&2], AuthKind::Unknown);
        assert_eq!(slots_of(&map, AuthKind::Tpm2), vec![1]);
        assert!(!map[&2].auto_removable());
        assert!(!map[&2].is_fallback());
    }

    #[test]
    fn clevis_tang_pin_is_not_tpm2() {
        let mut tang = token(0, "clevis", &[1]);
        tang.fields.insert("pin".into(), "tang".into());
        let header = luks2(vec![slot(0), slot(1)], vec![tang]);
        assert_eq!(classify(&header)[&1], AuthKind::OtherToken);
    }

    #[test]
    fn doubly_referenced_slot_is_ambiguous() {
        let header = luks2(
            vec![slot(0), slot(1)],
            vec![token(0, "systemd-tpm2", &[1]), token(1, "systemd-tpm2", &[1])],
        );
        assert_eq!(classify(&header)[&1], AuthKind::Ambiguous);
    }

    #[test]
    fn malformed_entries_degrade_to_unknown() {
        let mut odd = slot(2);
        odd.slot_type = Some("reencrypt".into());
        let header = luks2(
            vec![slot(0), slot(1), odd],
            vec![token(0, "", &[1])],
        );
        let map = classify(&header);
        assert_eq!(map[&1], AuthKind::Unknown);
        assert_eq!(map[&2], AuthKind::Unknown);
        assert!(!AuthKind::Unknown.auto_removable());
    }

    #[test]
    fn unbound_slot_is_unknown_even_without_a_token() {
        let mut unbound = slot(1);
        unbound.unbound = true;
        let header = luks2(vec![slot(0), unbound], Vec::new());
        let map = classify(&header);
        assert_eq!(map[&0], AuthKind::Password);
        assert_eq!(map[&1], AuthKind::Unknown);
        assert!(!map[&1].is_fallback());
    }

    #[test]
    fn tokens_for_disabled_slots_are_ignored() {
        let header = luks2(vec![slot(0)], vec![token(0, "systemd-tpm2", &[5])]);
        let map = classify(&header);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&0], AuthKind::Password);
    }
}
