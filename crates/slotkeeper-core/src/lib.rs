//! Core building blocks shared by slotkeeper binaries.
//!
//! Slot classification, the removal safety rules, the guarded mutation
//! engine, and the setup/cleanup/status/health workflows live here so the
//! command-line front end only has to collect input and print reports.

pub mod audit;
pub mod backup;
pub mod classify;
pub mod config;
pub mod error;
pub mod files;
pub mod interrupt;
pub mod lock;
pub mod logging;
pub mod mutation;
pub mod probe;
pub mod recovery;
pub mod safety;
pub mod workflow;

pub use audit::{AuditAction, AuditLog};
pub use classify::{classify, token_kind, AuthKind, SlotMap};
pub use config::{BackendChoice, ConfigFormat, SlotkeeperConfig};
pub use error::{SlotkeeperError, SlotkeeperResult};
pub use mutation::{MutationEngine, RemovalOutcome, Tpm2Outcome};
pub use probe::{find_matching_slots, verify_secret};
pub use recovery::{generate_recovery_key, is_valid_recovery_key, RecoveryKeyRecord};
pub use safety::{validate_removal, RemovalPolicy};
pub use workflow::{Prompter, WorkflowEvent, WorkflowLevel, WorkflowReport};
