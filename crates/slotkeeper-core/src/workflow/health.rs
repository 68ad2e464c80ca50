//! PCR snapshots taken before a system update and compared afterwards.
//!
//! Health checks only ever warn: a drifted PCR is reported together with the
//! re-enrollment command, and nothing on the device is touched.

use super::{WorkflowLevel, WorkflowReport};
use crate::config::SlotkeeperConfig;
use crate::error::{SlotkeeperError, SlotkeeperResult};
use crate::files::{ensure_private_dir, rotate_aside, write_atomic};
use crate::recovery::discover_recovery_keys;
use chrono::Local;
use log::debug;
use serde::{Deserialize, Serialize};
use slotkeeper_provider::pcr::{PcrSpec, MAX_PCR_INDEX};
use slotkeeper_provider::platform::Platform;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_FILE: &str = "pcr-snapshot.json";

/// Which side of an update the check runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthPhase {
    Pre,
    Post,
}

/// PCR values captured at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrSnapshot {
    pub taken_at: String,
    pub bank: String,
    pub values: BTreeMap<u8, String>,
}

/// One PCR whose value differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrDrift {
    pub index: u8,
    pub before: Option<String>,
    pub after: Option<String>,
}

pub fn snapshot_path(config: &SlotkeeperConfig) -> PathBuf {
    config.state_dir().join(SNAPSHOT_FILE)
}

impl PcrSnapshot {
    /// Read every PCR of `bank`.
    pub fn capture<P>(platform: &P, bank: &str) -> SlotkeeperResult<Self>
    where
        P: Platform<Error = SlotkeeperError>,
    {
        let indices: Vec<u8> = (0..=MAX_PCR_INDEX).collect();
        let values = platform.read_pcrs(bank, &indices)?;
        Ok(Self {
            taken_at: Local::now().to_rfc3339(),
            bank: bank.to_string(),
            values,
        })
    }

    /// Write the snapshot, moving any previous one aside.
    pub fn save(&self, path: &Path) -> SlotkeeperResult<Option<PathBuf>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(parent)?;
        }
        let rotated = rotate_aside(path)?;
        let payload = serde_json::to_string_pretty(self)?;
        write_atomic(path, payload.as_bytes(), 0o600)?;
        Ok(rotated)
    }

    pub fn load(path: &Path) -> SlotkeeperResult<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// PCRs whose value changed between `self` and `current`.
    pub fn drift(&self, current: &Self) -> Vec<PcrDrift> {
        let indices: BTreeSet<u8> = self
            .values
            .keys()
            .chain(current.values.keys())
            .copied()
            .collect();
        indices
            .into_iter()
            .filter_map(|index| {
                let before = self.values.get(&index);
                let after = current.values.get(&index);
                (before != after).then(|| PcrDrift {
                    index,
                    before: before.cloned(),
                    after: after.cloned(),
                })
            })
            .collect()
    }
}

/// Run the pre- or post-update check. Problems are reported as warnings.
pub fn health<P>(
    config: &SlotkeeperConfig,
    platform: &P,
    phase: HealthPhase,
) -> SlotkeeperResult<WorkflowReport>
where
    P: Platform<Error = SlotkeeperError>,
{
    let spec = config.pcr_spec().unwrap_or_else(|err| {
        debug!("falling back to the default PCR policy: {err}");
        PcrSpec::default()
    });
    let path = snapshot_path(config);
    let report = match phase {
        HealthPhase::Pre => pre_update(config, platform, &spec, &path),
        HealthPhase::Post => post_update(platform, &spec, &path),
    };
    Ok(report)
}

fn pre_update<P>(config: &SlotkeeperConfig, platform: &P, spec: &PcrSpec, path: &Path) -> WorkflowReport
where
    P: Platform<Error = SlotkeeperError>,
{
    let mut report = WorkflowReport::new("Health check (pre-update)");
    let snapshot = match PcrSnapshot::capture(platform, &spec.bank) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            report.push(
                WorkflowLevel::Warn,
                format!("Could not read PCRs, no snapshot taken: {err}"),
            );
            return report;
        }
    };

    match snapshot.save(path) {
        Ok(rotated) => {
            report.push(
                WorkflowLevel::Success,
                format!("PCR snapshot saved to {}", path.display()),
            );
            if let Some(old) = rotated {
                report.push(
                    WorkflowLevel::Info,
                    format!("Previous snapshot kept at {}", old.display()),
                );
            }
        }
        Err(err) => {
            report.push(
                WorkflowLevel::Warn,
                format!("Could not save PCR snapshot to {}: {err}", path.display()),
            );
        }
    }

    for index in &spec.indices {
        if let Some(value) = snapshot.values.get(index) {
            report.push(
                WorkflowLevel::Info,
                format!("Sealing PCR {}:{index} = {value}", spec.bank),
            );
        }
    }

    if discover_recovery_keys(config).valid.is_empty() {
        report.push(
            WorkflowLevel::Security,
            "No recovery key file found on this host; make sure your recovery key is at hand before rebooting",
        );
    }
    report
}

fn post_update<P>(platform: &P, spec: &PcrSpec, path: &Path) -> WorkflowReport
where
    P: Platform<Error = SlotkeeperError>,
{
    let mut report = WorkflowReport::new("Health check (post-update)");
    let before = match PcrSnapshot::load(path) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            report.push(
                WorkflowLevel::Warn,
                format!(
                    "No PCR snapshot at {}; run `slotkeeper health pre` before the next update",
                    path.display()
                ),
            );
            return report;
        }
        Err(err) => {
            report.push(
                WorkflowLevel::Warn,
                format!("PCR snapshot {} is unreadable: {err}", path.display()),
            );
            return report;
        }
    };

    if before.bank != spec.bank {
        report.push(
            WorkflowLevel::Warn,
            format!(
                "Snapshot uses bank {} but the configured bank is {}; comparing {}",
                before.bank, spec.bank, before.bank
            ),
        );
    }

    let current = match PcrSnapshot::capture(platform, &before.bank) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            report.push(
                WorkflowLevel::Warn,
                format!("Could not read current PCRs: {err}"),
            );
            return report;
        }
    };

    let drift = before.drift(&current);
    if drift.is_empty() {
        report.push(
            WorkflowLevel::Success,
            format!("No PCR drift since {}", before.taken_at),
        );
        return report;
    }

    for change in &drift {
        report.push(
            WorkflowLevel::Warn,
            format!(
                "PCR {} changed: {} -> {}",
                change.index,
                short(change.before.as_deref()),
                short(change.after.as_deref())
            ),
        );
    }

    let sealed: Vec<u8> = drift
        .iter()
        .map(|change| change.index)
        .filter(|index| spec.contains(*index))
        .collect();
    if sealed.is_empty() {
        report.push(
            WorkflowLevel::Info,
            format!("None of the sealing PCRs ({spec}) changed; TPM2 unlock is unaffected"),
        );
    } else {
        report.push(
            WorkflowLevel::Warn,
            format!(
                "Sealing PCR(s) {sealed:?} changed: TPM2 unlock will fail at the next boot. Keep the recovery key at hand and re-enroll with `slotkeeper setup --reenroll` or `systemd-cryptenroll --wipe-slot=tpm2 --tpm2-device=auto --tpm2-pcrs={} <device>`",
                spec.cryptenroll_arg()
            ),
        );
    }
    report
}

fn short(value: Option<&str>) -> String {
    match value {
        Some(value) if value.len() > 16 => format!("{}...", &value[..16]),
        Some(value) => value.to_string(),
        None => "(missing)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(values: &[(u8, &str)]) -> PcrSnapshot {
        PcrSnapshot {
            taken_at: "2024-01-01T00:00:00+00:00".into(),
            bank: "sha256".into(),
            values: values.iter().map(|(i, v)| (*i, v.to_string())).collect(),
        }
    }

    #[test]
    fn drift_lists_changed_added_and_missing_pcrs() {
        let before = snapshot(&[(0, "aa"), (7, "bb"), (9, "cc")]);
        let after = snapshot(&[(0, "aa"), (7, "ee"), (14, "ff")]);
        let indices: Vec<u8> = before.drift(&after).iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![7, 9, 14]);
    }

    #[test]
    fn snapshot_survives_a_save_load_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join(SNAPSHOT_FILE);
        let snap = snapshot(&[(7, "0123456789abcdef0123")]);
        assert!(snap.save(&path).unwrap().is_none());
        assert_eq!(PcrSnapshot::load(&path).unwrap(), Some(snap.clone()));
        assert!(snap.save(&path).unwrap().is_some());
    }

    #[test]
    fn short_truncates_long_digests() {
        assert_eq!(short(Some("0123456789abcdef0123")), "0123456789abcdef...");
        assert_eq!(short(None), "(missing)");
    }
}
