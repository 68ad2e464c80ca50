//! Read-only status report, optionally narrowed to one area.

use super::{event, health, prereq, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::classify::{classify, slots_of, AuthKind};
use crate::config::SlotkeeperConfig;
use crate::error::{SlotkeeperError, SlotkeeperResult};
use crate::recovery::discover_recovery_keys;
use slotkeeper_provider::luks::{LuksBackend, LuksDevice, LuksHeader};
use slotkeeper_provider::platform::{FirmwareMode, Platform, SecureBootState, TpmPresence};
use slotkeeper_provider::BackendKind;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

/// Backend handle usable from the per-device worker threads.
pub type SharedBackend<'a> = &'a (dyn LuksBackend<Error = SlotkeeperError> + Sync);

/// PCRs listed in every PCR report on top of the sealing set.
const REPORTED_PCRS: [u8; 10] = [0, 1, 2, 3, 4, 5, 7, 8, 9, 14];

/// Which part of the system to report on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusScope {
    #[default]
    All,
    Tpm,
    Pcr,
    Luks,
    Clevis,
    Systemd,
    Boot,
    Diag,
}

impl StatusScope {
    fn includes(self, section: StatusScope) -> bool {
        self == StatusScope::All || self == section
    }
}

/// Build the status report. `backends[0]` reads headers; every backend
/// contributes its own enrollment listing.
pub fn status<P>(
    config: &SlotkeeperConfig,
    platform: &P,
    backends: &[SharedBackend<'_>],
    scope: StatusScope,
    device: Option<&Path>,
) -> SlotkeeperResult<WorkflowReport>
where
    P: Platform<Error = SlotkeeperError>,
{
    let primary = *backends.first().ok_or_else(|| SlotkeeperError::Prerequisite {
        message: "neither clevis nor systemd-cryptenroll is available".into(),
        remediation: Some(
            "install clevis (apt install clevis clevis-tpm2 clevis-luks clevis-initramfs) or systemd >= 248"
                .into(),
        ),
    })?;

    let mut report = WorkflowReport::new("Status");

    if scope.includes(StatusScope::Tpm) {
        report.events.extend(tpm_section(platform));
    }
    if scope.includes(StatusScope::Pcr) {
        report.events.extend(pcr_section(config, platform));
    }

    let needs_devices = [StatusScope::Luks, StatusScope::Clevis, StatusScope::Systemd]
        .into_iter()
        .any(|section| scope.includes(section));
    let devices = if needs_devices {
        target_devices(platform, device, &mut report)
    } else {
        Vec::new()
    };

    if scope.includes(StatusScope::Luks) {
        report.events.extend(luks_section(config, primary, &devices));
    }
    if scope.includes(StatusScope::Clevis) {
        report
            .events
            .extend(enrollment_section(BackendKind::Clevis, backends, &devices));
    }
    if scope.includes(StatusScope::Systemd) {
        report
            .events
            .extend(enrollment_section(BackendKind::Cryptenroll, backends, &devices));
    }
    if scope.includes(StatusScope::Boot) {
        report.events.extend(boot_section(platform));
    }
    if scope.includes(StatusScope::Diag) {
        report.events.extend(diag_section(config, backends));
    }

    Ok(report)
}

fn target_devices<P>(platform: &P, device: Option<&Path>, report: &mut WorkflowReport) -> Vec<PathBuf>
where
    P: Platform<Error = SlotkeeperError>,
{
    if let Some(path) = device {
        return vec![path.to_path_buf()];
    }
    match platform.discover_luks_devices() {
        Ok(found) if found.is_empty() => {
            report.push(WorkflowLevel::Warn, "No LUKS devices found");
            Vec::new()
        }
        Ok(found) => found.into_iter().map(|dev| dev.path).collect(),
        Err(err) => {
            report.push(WorkflowLevel::Warn, format!("Device discovery failed: {err}"));
            Vec::new()
        }
    }
}

fn tpm_section<P>(platform: &P) -> Vec<WorkflowEvent>
where
    P: Platform<Error = SlotkeeperError>,
{
    match platform.tpm_presence() {
        TpmPresence::Present {
            device,
            version,
            manufacturer,
        } => vec![event(
            WorkflowLevel::Success,
            format!(
                "TPM: {} (version {}{})",
                device.display(),
                version.as_deref().unwrap_or("unknown"),
                manufacturer
                    .map(|m| format!(", manufacturer {m}"))
                    .unwrap_or_default()
            ),
        )],
        TpmPresence::Absent(reason) => {
            vec![event(WorkflowLevel::Warn, format!("TPM: not available ({reason})"))]
        }
    }
}

fn pcr_section<P>(config: &SlotkeeperConfig, platform: &P) -> Vec<WorkflowEvent>
where
    P: Platform<Error = SlotkeeperError>,
{
    let spec = match config.pcr_spec() {
        Ok(spec) => spec,
        Err(err) => return vec![event(WorkflowLevel::Warn, err.to_string())],
    };
    let mut indices: Vec<u8> = REPORTED_PCRS.to_vec();
    indices.extend(spec.indices.iter().copied());
    indices.sort_unstable();
    indices.dedup();

    match platform.read_pcrs(&spec.bank, &indices) {
        Ok(values) => values
            .into_iter()
            .map(|(index, value)| {
                let sealed = if spec.contains(index) { " (sealing)" } else { "" };
                event(
                    WorkflowLevel::Info,
                    format!("PCR {}:{index:>2} = {value}{sealed}", spec.bank),
                )
            })
            .collect(),
        Err(err) => vec![event(WorkflowLevel::Warn, format!("PCR read failed: {err}"))],
    }
}

fn luks_section(
    config: &SlotkeeperConfig,
    backend: SharedBackend<'_>,
    devices: &[PathBuf],
) -> Vec<WorkflowEvent> {
    let results: Vec<SlotkeeperResult<(LuksDevice, LuksHeader)>> = thread::scope(|scope| {
        let handles: Vec<_> = devices
            .iter()
            .map(|path| {
                scope.spawn(move || -> SlotkeeperResult<(LuksDevice, LuksHeader)> {
                    let device = backend.inspect_device(path)?;
                    let header = backend.read_header(&device.path)?;
                    Ok((device, header))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(SlotkeeperError::Provider("status worker panicked".into()))
                })
            })
            .collect()
    });

    let recovery = discover_recovery_keys(config);
    let mut events = Vec::new();
    for (path, result) in devices.iter().zip(results) {
        let (device, header) = match result {
            Ok(pair) => pair,
            Err(err) => {
                events.push(event(
                    WorkflowLevel::Warn,
                    format!("{}: {err}", path.display()),
                ));
                continue;
            }
        };
        events.extend(device_events(&device, &header));
        for record in recovery.valid.iter().filter(|r| r.applies_to(&device.path)) {
            events.push(event(
                WorkflowLevel::Info,
                format!(
                    "  recovery key file {} (fingerprint {}, created {})",
                    record.path.display(),
                    record.fingerprint(),
                    if record.created.is_empty() {
                        "unknown"
                    } else {
                        record.created.as_str()
                    }
                ),
            ));
        }
    }
    for err in &recovery.invalid {
        events.push(event(WorkflowLevel::Warn, format!("Recovery key file: {err}")));
    }
    events
}

fn device_events(device: &LuksDevice, header: &LuksHeader) -> Vec<WorkflowEvent> {
    let dev = device.path.display();
    let classified = classify(header);
    let mut events = vec![event(
        WorkflowLevel::Info,
        format!(
            "{dev}: {}{}",
            header.version,
            header
                .uuid
                .as_deref()
                .map(|uuid| format!(", UUID {uuid}"))
                .unwrap_or_default()
        ),
    )];

    for (slot, kind) in &classified {
        let tokens: Vec<String> = header
            .tokens
            .iter()
            .filter(|token| token.keyslots.contains(slot))
            .map(|token| format!("token {} {}", token.id, token.token_type))
            .collect();
        let detail = if tokens.is_empty() {
            String::new()
        } else {
            format!(" [{}]", tokens.join(", "))
        };
        let level = if kind.auto_removable() {
            WorkflowLevel::Info
        } else {
            WorkflowLevel::Warn
        };
        events.push(event(level, format!("  slot {slot}: {kind}{detail}")));
    }

    for warning in &header.warnings {
        events.push(event(WorkflowLevel::Warn, format!("  header: {warning}")));
    }

    let tpm = slots_of(&classified, AuthKind::Tpm2);
    if tpm.len() > 1 {
        events.push(event(
            WorkflowLevel::Warn,
            format!("  duplicate TPM2 slots {tpm:?}; run `slotkeeper cleanup {dev}`"),
        ));
    }
    if !classified.values().any(|kind| kind.is_fallback()) {
        events.push(event(
            WorkflowLevel::Warn,
            "  no passphrase or recovery slot: a failed TPM unlock would lock you out",
        ));
    }
    events
}

fn enrollment_section(
    kind: BackendKind,
    backends: &[SharedBackend<'_>],
    devices: &[PathBuf],
) -> Vec<WorkflowEvent> {
    let Some(backend) = backends.iter().find(|backend| backend.kind() == kind) else {
        return vec![event(
            WorkflowLevel::Info,
            format!("{}: not installed", kind.tool()),
        )];
    };

    let mut events = Vec::new();
    for path in devices {
        match backend.read_enrollment(path) {
            Ok(entries) if entries.is_empty() => events.push(event(
                WorkflowLevel::Info,
                format!("{} {}: no bindings", kind.tool(), path.display()),
            )),
            Ok(entries) => {
                for entry in entries {
                    events.push(event(
                        WorkflowLevel::Info,
                        format!(
                            "{} {} slot {}: {}{}",
                            kind.tool(),
                            path.display(),
                            entry.slot,
                            entry.method,
                            entry
                                .detail
                                .as_deref()
                                .map(|detail| format!(" {detail}"))
                                .unwrap_or_default()
                        ),
                    ));
                }
            }
            Err(err) => events.push(event(
                WorkflowLevel::Warn,
                format!("{} {}: {err}", kind.tool(), path.display()),
            )),
        }
    }
    events
}

fn boot_section<P>(platform: &P) -> Vec<WorkflowEvent>
where
    P: Platform<Error = SlotkeeperError>,
{
    let mut events = Vec::new();
    events.push(event(
        WorkflowLevel::Info,
        match platform.firmware_mode() {
            FirmwareMode::Uefi => "Firmware: UEFI",
            FirmwareMode::Legacy => "Firmware: legacy BIOS",
        },
    ));
    events.push(match platform.secure_boot() {
        SecureBootState::Enabled => event(WorkflowLevel::Success, "Secure Boot: enabled"),
        SecureBootState::Disabled => event(WorkflowLevel::Warn, "Secure Boot: disabled"),
        SecureBootState::Unknown(reason) => {
            event(WorkflowLevel::Warn, format!("Secure Boot: unknown ({reason})"))
        }
    });

    let hooks = platform.initramfs_hooks();
    if hooks.is_empty() {
        events.push(event(
            WorkflowLevel::Warn,
            "No TPM2 unlock hook found in the initramfs configuration",
        ));
    } else {
        events.push(event(
            WorkflowLevel::Info,
            format!("Initramfs hooks: {}", hooks.join(", ")),
        ));
    }

    match platform.crypttab() {
        Ok(entries) if entries.is_empty() => {
            events.push(event(WorkflowLevel::Info, "crypttab: no entries"))
        }
        Ok(entries) => {
            for entry in entries {
                let level = if entry.has_option("tpm2-device=auto") {
                    WorkflowLevel::Success
                } else {
                    WorkflowLevel::Info
                };
                events.push(event(
                    level,
                    format!(
                        "crypttab {} {} {} {}",
                        entry.name,
                        entry.source,
                        entry.key_file.as_deref().unwrap_or("none"),
                        if entry.options.is_empty() {
                            "-".to_string()
                        } else {
                            entry.options.join(",")
                        }
                    ),
                ));
            }
        }
        Err(err) => events.push(event(WorkflowLevel::Warn, format!("crypttab: {err}"))),
    }
    events
}

fn diag_section(config: &SlotkeeperConfig, backends: &[SharedBackend<'_>]) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();

    for backend in backends {
        match backend.check_tooling() {
            Ok(tooling) => {
                events.push(event(
                    WorkflowLevel::Success,
                    format!(
                        "{}: {}",
                        tooling.tool,
                        tooling.version.as_deref().unwrap_or("version unknown")
                    ),
                ));
                for note in tooling.notes {
                    events.push(event(WorkflowLevel::Info, format!("  {note}")));
                }
                for caveat in tooling.security {
                    events.push(event(WorkflowLevel::Security, format!("  {caveat}")));
                }
            }
            Err(err) => events.push(event(
                WorkflowLevel::Warn,
                format!("{}: {err}", backend.kind().tool()),
            )),
        }
    }

    let issues = config.validate();
    if issues.is_empty() {
        events.push(event(WorkflowLevel::Success, "Configuration valid"));
    } else {
        for issue in issues {
            events.push(event(WorkflowLevel::Warn, format!("Configuration: {issue}")));
        }
    }

    events.push(event(
        WorkflowLevel::Info,
        format!(
            "Running as {}",
            if prereq::running_as_root() {
                "root"
            } else {
                "an unprivileged user (keyslot tests may fail)"
            }
        ),
    ));

    let audit_path = config.audit_log_path();
    match fs::read_to_string(&audit_path) {
        Ok(text) => events.push(event(
            WorkflowLevel::Info,
            format!(
                "Audit log {}: {} entries",
                audit_path.display(),
                text.lines().count()
            ),
        )),
        Err(_) => events.push(event(
            WorkflowLevel::Info,
            format!("Audit log {}: not written yet", audit_path.display()),
        )),
    }

    let snapshot = health::snapshot_path(config);
    events.push(event(
        WorkflowLevel::Info,
        if snapshot.is_file() {
            format!("PCR snapshot: {}", snapshot.display())
        } else {
            format!(
                "PCR snapshot: none at {} (run `slotkeeper health pre` before updates)",
                snapshot.display()
            )
        },
    ));
    events
}
