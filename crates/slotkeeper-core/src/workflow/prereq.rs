use super::{event, WorkflowEvent, WorkflowLevel};
use crate::error::{SlotkeeperError, SlotkeeperResult};
use slotkeeper_provider::luks::LuksBackend;
use slotkeeper_provider::platform::{Platform, TpmPresence};

/// Fail unless a TPM 2.0 device and the backend tooling are usable.
///
/// These failures are terminal for the current run.
pub fn check_prerequisites<B, P>(platform: &P, backend: &B) -> SlotkeeperResult<Vec<WorkflowEvent>>
where
    B: LuksBackend<Error = SlotkeeperError>,
    P: Platform<Error = SlotkeeperError>,
{
    let mut events = Vec::new();

    match platform.tpm_presence() {
        TpmPresence::Present {
            device,
            version,
            manufacturer,
        } => {
            if let Some(version) = version.as_deref().filter(|v| v.trim() != "2") {
                return Err(SlotkeeperError::Prerequisite {
                    message: format!(
                        "TPM at {} reports major version {version}; TPM 2.0 is required",
                        device.display()
                    ),
                    remediation: Some(
                        "switch the firmware TPM to 2.0 mode (PTT/fTPM) in firmware setup".into(),
                    ),
                });
            }
            events.push(event(
                WorkflowLevel::Success,
                format!(
                    "TPM 2.0 found at {}{}",
                    device.display(),
                    manufacturer
                        .map(|m| format!(" ({m})"))
                        .unwrap_or_default()
                ),
            ));
        }
        TpmPresence::Absent(reason) => {
            return Err(SlotkeeperError::Prerequisite {
                message: format!("no TPM 2.0 device available: {reason}"),
                remediation: Some(
                    "enable the TPM (Intel PTT / AMD fTPM) in firmware setup, then confirm with: ls -l /dev/tpmrm0"
                        .into(),
                ),
            });
        }
    }

    let tooling = backend.check_tooling()?;
    events.push(event(
        WorkflowLevel::Success,
        format!(
            "{} available{}",
            tooling.tool,
            tooling
                .version
                .as_deref()
                .map(|v| format!(" (version {v})"))
                .unwrap_or_default()
        ),
    ));
    for note in tooling.notes {
        events.push(event(WorkflowLevel::Info, note));
    }

    Ok(events)
}

/// Mutating commands need root to touch LUKS headers and /etc.
pub fn ensure_root() -> SlotkeeperResult<()> {
    if running_as_root() {
        Ok(())
    } else {
        Err(SlotkeeperError::Privilege(
            "modifying LUKS keyslots requires root (cryptsetup needs raw access to the block device)"
                .into(),
        ))
    }
}

pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
