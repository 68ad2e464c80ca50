//! Read-only credential probing.
//!
//! Finds which password keyslots accept a candidate secret. Token-bound slots
//! (TPM2, FIDO2, recovery tokens) are never passphrase-tested.

use crate::classify::{classify, AuthKind, SlotMap};
use crate::error::{SlotkeeperError, SlotkeeperResult};
use log::{debug, warn};
use slotkeeper_provider::luks::LuksBackend;
use std::path::Path;

/// Re-read `device` and return the password slots that accept `secret`.
///
/// No match is an empty list, not an error.
pub fn find_matching_slots<B>(backend: &B, device: &Path, secret: &[u8]) -> SlotkeeperResult<Vec<u8>>
where
    B: LuksBackend<Error = SlotkeeperError>,
{
    let header = backend.read_header(device)?;
    probe_slots(backend, device, &classify(&header), secret)
}

/// Probe the password slots of an already classified header.
///
/// One `test_passphrase` call per password slot, always in ascending order
/// and always for every candidate, so the number of calls does not depend on
/// which slot matched. A timed-out test counts as no match.
pub fn probe_slots<B>(
    backend: &B,
    device: &Path,
    classified: &SlotMap,
    secret: &[u8],
) -> SlotkeeperResult<Vec<u8>>
where
    B: LuksBackend<Error = SlotkeeperError>,
{
    if secret.is_empty() {
        return Ok(Vec::new());
    }

    let mut matches = Vec::new();
    for (slot, kind) in classified {
        if *kind != AuthKind::Password {
            continue;
        }
        match backend.test_passphrase(device, Some(*slot), secret) {
            Ok(true) => matches.push(*slot),
            Ok(false) => {}
            Err(SlotkeeperError::Timeout { tool, after }) => {
                warn!(
                    "passphrase test for slot {slot} on {} timed out ({tool}, {after:?}); treating as no match",
                    device.display()
                );
            }
            Err(err) => return Err(err),
        }
    }

    debug!(
        "probe on {} matched {} of {} password slot(s)",
        device.display(),
        matches.len(),
        classified
            .values()
            .filter(|kind| **kind == AuthKind::Password)
            .count()
    );
    Ok(matches)
}

/// True when `secret` opens any keyslot of `device`.
pub fn verify_secret<B>(backend: &B, device: &Path, secret: &[u8]) -> SlotkeeperResult<bool>
where
    B: LuksBackend<Error = SlotkeeperError>,
{
    if secret.is_empty() {
        return Ok(false);
    }
    match backend.test_passphrase(device, None, secret) {
        Err(SlotkeeperError::Timeout { tool, after }) => {
            warn!(
                "passphrase check on {} timed out ({tool}, {after:?})",
                device.display()
            );
            Ok(false)
        }
        other => other,
    }
}
