//! Parsers for the enrollment listings printed by `systemd-cryptenroll` and
//! `clevis luks list`, plus tool version strings.

use regex::Regex;
use slotkeeper_provider::luks::EnrollmentEntry;
use std::sync::OnceLock;

fn cryptenroll_row_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"^\s*(\d+)\s+(\S+)\s*$").expect("valid cryptenroll regex"))
}

fn clevis_row_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"^\s*(\d+):\s+(\S+)(?:\s+'(.*)')?\s*$").expect("valid clevis list regex")
    })
}

fn systemd_version_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"systemd\s+(\d+)").expect("valid systemd version regex"))
}

/// Parse the `SLOT TYPE` table `systemd-cryptenroll <device>` prints.
pub fn parse_cryptenroll_list(text: &str) -> Vec<EnrollmentEntry> {
    text.lines()
        .filter_map(|line| cryptenroll_row_re().captures(line))
        .filter_map(|caps| {
            Some(EnrollmentEntry {
                slot: caps[1].parse().ok()?,
                method: caps[2].to_string(),
                detail: None,
            })
        })
        .collect()
}

/// Parse `clevis luks list` lines such as `1: tpm2 '{"pcr_ids":"7"}'`.
pub fn parse_clevis_list(text: &str) -> Vec<EnrollmentEntry> {
    text.lines()
        .filter_map(|line| clevis_row_re().captures(line))
        .filter_map(|caps| {
            Some(EnrollmentEntry {
                slot: caps[1].parse().ok()?,
                method: caps[2].to_string(),
                detail: caps.get(3).map(|m| m.as_str().to_string()),
            })
        })
        .collect()
}

/// Extract the major systemd release from `systemd-cryptenroll --version`.
pub fn parse_systemd_version(text: &str) -> Option<u32> {
    systemd_version_re()
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}
