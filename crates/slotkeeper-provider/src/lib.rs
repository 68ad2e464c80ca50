#![forbid(unsafe_code)]

//! Backend contracts shared across slotkeeper.
//!
//! Workflows in `slotkeeper-core` only talk to these traits; the concrete
//! `cryptsetup`/`clevis`/`systemd-cryptenroll` integrations live in
//! `slotkeeper-luks`.

use std::fmt;

pub mod luks;
pub mod pcr;
pub mod platform;

/// Identifies which TPM2 enrollment framework a backend drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Clevis,
    Cryptenroll,
}

impl BackendKind {
    /// Stable lowercase identifier, matching the `backend.type` config values.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Clevis => "clevis",
            BackendKind::Cryptenroll => "cryptenroll",
        }
    }

    /// Name of the enrollment tool the backend shells out to.
    pub fn tool(&self) -> &'static str {
        match self {
            BackendKind::Clevis => "clevis",
            BackendKind::Cryptenroll => "systemd-cryptenroll",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
