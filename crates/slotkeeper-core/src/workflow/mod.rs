//! Workflow orchestration for setup, status, cleanup, and PCR health checks.
//!
//! Workflows never prompt directly. Anything that needs an operator answer
//! goes through [`Prompter`], so the same code runs behind the terminal
//! front end and behind scripted tests.

mod cleanup;
mod health;
mod prereq;
mod setup;
mod status;

use crate::error::{SlotkeeperError, SlotkeeperResult};
use slotkeeper_provider::platform::Platform;
use std::path::PathBuf;
use zeroize::Zeroizing;

pub use cleanup::{cleanup, CleanupOptions, CleanupPlan, PlannedRemoval};
pub use health::{health, snapshot_path, HealthPhase, PcrDrift, PcrSnapshot};
pub use prereq::{check_prerequisites, ensure_root, running_as_root};
pub use setup::{setup, SetupOptions, SetupState};
pub use status::{status, SharedBackend, StatusScope};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
    /// Freshly generated recovery key the operator must store now.
    pub recovery_key: Option<Zeroizing<String>>,
}

impl WorkflowReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            events: Vec::new(),
            recovery_key: None,
        }
    }

    pub fn push(&mut self, level: WorkflowLevel, message: impl Into<String>) {
        self.events.push(event(level, message));
    }

    /// True when any step reported an error (partial failures included).
    pub fn has_errors(&self) -> bool {
        self.events
            .iter()
            .any(|event| event.level == WorkflowLevel::Error)
    }
}

/// Operator interaction needed by the workflows.
pub trait Prompter {
    /// Ask for a secret without echo. `None` means the operator cancelled.
    fn secret(&mut self, prompt: &str) -> SlotkeeperResult<Option<Zeroizing<String>>>;

    /// Yes/no question.
    fn confirm(&mut self, prompt: &str, default: bool) -> SlotkeeperResult<bool>;

    /// Pick one of `options`; `None` means the operator cancelled.
    fn choose(
        &mut self,
        prompt: &str,
        options: &[String],
        default: usize,
    ) -> SlotkeeperResult<Option<usize>>;
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

/// Resolve the device to operate on: explicit path, the only LUKS device, or
/// an operator choice among several.
pub(crate) fn select_device<P, Q>(
    platform: &P,
    prompter: &mut Q,
    explicit: Option<&PathBuf>,
) -> SlotkeeperResult<PathBuf>
where
    P: Platform<Error = SlotkeeperError>,
    Q: Prompter + ?Sized,
{
    if let Some(path) = explicit {
        return Ok(path.clone());
    }

    let candidates = platform.discover_luks_devices()?;
    match candidates.len() {
        0 => Err(SlotkeeperError::Prerequisite {
            message: "no LUKS-encrypted block devices found".into(),
            remediation: Some("list block devices with: lsblk -f".into()),
        }),
        1 => Ok(candidates[0].path.clone()),
        _ => {
            let labels: Vec<String> = candidates
                .iter()
                .map(|dev| {
                    format!(
                        "{} ({}{})",
                        dev.path.display(),
                        dev.size.as_deref().unwrap_or("size unknown"),
                        dev.uuid
                            .as_deref()
                            .map(|uuid| format!(", UUID {uuid}"))
                            .unwrap_or_default()
                    )
                })
                .collect();
            match prompter.choose("Select the LUKS device", &labels, 0)? {
                Some(idx) if idx < candidates.len() => Ok(candidates[idx].path.clone()),
                Some(idx) => Err(SlotkeeperError::Aborted(format!(
                    "device choice {idx} is out of range"
                ))),
                None => Err(SlotkeeperError::Aborted("no device selected".into())),
            }
        }
    }
}

/// Render `slot: kind` pairs for report lines.
pub(crate) fn describe_slots(map: &crate::classify::SlotMap) -> String {
    if map.is_empty() {
        return "no enabled keyslots".to_string();
    }
    map.iter()
        .map(|(slot, kind)| format!("{slot}:{kind}"))
        .collect::<Vec<_>>()
        .join(", ")
}
