//! `/etc/crypttab` parsing and the `tpm2-device=auto` option edit.

use log::{info, warn};
use slotkeeper_core::error::SlotkeeperResult;
use slotkeeper_core::files::{backup_copy, write_atomic};
use slotkeeper_provider::luks::LuksDevice;
use slotkeeper_provider::platform::CrypttabEntry;
use std::fs;
use std::path::{Path, PathBuf};

/// What [`ensure_option`] did to the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrypttabChange {
    /// No line refers to the device.
    NoEntry,
    AlreadyPresent { name: String },
    Updated { name: String, backup: PathBuf },
}

/// Parse a `crypttab` document. Comments, blank lines, and lines with fewer
/// than two fields are skipped.
pub fn parse_crypttab(contents: &str) -> Vec<CrypttabEntry> {
    contents.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<CrypttabEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let mut fields = trimmed.split_whitespace();
    let name = fields.next()?.to_string();
    let source = fields.next()?.to_string();
    let key_file = fields
        .next()
        .filter(|key| *key != "none" && *key != "-")
        .map(str::to_string);
    let options = fields
        .next()
        .map(|opts| {
            opts.split(',')
                .filter(|opt| !opt.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(CrypttabEntry {
        name,
        source,
        key_file,
        options,
    })
}

/// Read and parse `path`; a missing file yields no entries.
pub fn read_crypttab(path: &Path) -> SlotkeeperResult<Vec<CrypttabEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(parse_crypttab(&fs::read_to_string(path)?))
}

/// Whether a crypttab `source` column refers to `device`.
pub fn source_matches(source: &str, device: &LuksDevice) -> bool {
    let source = source.trim();
    if let Some(uuid) = device.uuid.as_deref().and_then(normalize_uuid) {
        let by_uuid = strip_prefix_case_insensitive(source, "UUID=")
            .or_else(|| source.strip_prefix("/dev/disk/by-uuid/"));
        if by_uuid.and_then(normalize_uuid).as_deref() == Some(uuid.as_str()) {
            return true;
        }
    }
    if Path::new(source) == device.path {
        return true;
    }
    match (canonicalize_existing(source), canonicalize_existing(&device.path)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

/// Make sure the crypttab line for `device` carries `option`, backing the
/// file up before rewriting it. Other lines are kept byte for byte.
pub fn ensure_option(path: &Path, device: &LuksDevice, option: &str) -> SlotkeeperResult<CrypttabChange> {
    if !path.exists() {
        return Ok(CrypttabChange::NoEntry);
    }
    let contents = fs::read_to_string(path)?;
    let mut target = None;
    for (idx, line) in contents.lines().enumerate() {
        if let Some(entry) = parse_line(line) {
            if source_matches(&entry.source, device) {
                target = Some((idx, entry));
                break;
            }
        }
    }

    let Some((target_idx, mut entry)) = target else {
        return Ok(CrypttabChange::NoEntry);
    };
    if entry.has_option(option) {
        return Ok(CrypttabChange::AlreadyPresent { name: entry.name });
    }

    entry.options.retain(|opt| opt != "none" && opt != "-");
    entry.options.push(option.to_string());
    let key = entry.key_file.as_deref().unwrap_or("none");
    let rewritten = format!(
        "{}\t{}\t{}\t{}",
        entry.name,
        entry.source,
        key,
        entry.options.join(",")
    );

    let mut output = String::with_capacity(contents.len() + option.len() + 1);
    for (idx, line) in contents.lines().enumerate() {
        if idx == target_idx {
            output.push_str(&rewritten);
        } else {
            output.push_str(line);
        }
        output.push('\n');
    }

    let backup = backup_copy(path)?;
    if let Err(err) = write_atomic(path, output.as_bytes(), 0o644) {
        warn!(
            "crypttab rewrite failed, original preserved at {}: {err}",
            backup.display()
        );
        return Err(err);
    }
    info!("added {option} to crypttab entry {}", entry.name);
    Ok(CrypttabChange::Updated {
        name: entry.name,
        backup,
    })
}

fn normalize_uuid(value: &str) -> Option<String> {
    let candidate = value.trim();
    if candidate.is_empty() {
        return None;
    }
    let mut normalised = String::with_capacity(candidate.len());
    for ch in candidate.chars() {
        if ch == '-' {
            continue;
        }
        if !ch.is_ascii_hexdigit() {
            return None;
        }
        normalised.push(ch.to_ascii_lowercase());
    }
    (!normalised.is_empty()).then_some(normalised)
}

fn canonicalize_existing(path: impl AsRef<Path>) -> Option<PathBuf> {
    let candidate = path.as_ref();
    candidate
        .exists()
        .then(|| fs::canonicalize(candidate).ok())
        .flatten()
}

fn strip_prefix_case_insensitive<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    value
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .and_then(|_| value.get(prefix.len()..))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotkeeper_provider::luks::LuksVersion;

    const UUID: &str = "6f1c2b9e-2c71-4d55-9a43-0e4b2d1f7a10";

    fn device() -> LuksDevice {
        LuksDevice {
            path: PathBuf::from("/dev/nonexistent-vda3"),
            version: LuksVersion::Luks2,
            uuid: Some(UUID.to_string()),
        }
    }

    #[test]
    fn parses_columns_and_options() {
        let entries = parse_crypttab(
            "# comment\n\ncryptroot UUID=abc none luks,discard\nswap /dev/sdb2 /dev/urandom swap\nshort\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key_file, None);
        assert!(entries[0].has_option("discard"));
        assert_eq!(entries[1].key_file.as_deref(), Some("/dev/urandom"));
    }

    #[test]
    fn matches_uuid_spellings() {
        let dev = device();
        assert!(source_matches(&format!("UUID={UUID}"), &dev));
        assert!(source_matches(&format!("uuid={}", UUID.to_uppercase()), &dev));
        assert!(source_matches(&format!("/dev/disk/by-uuid/{UUID}"), &dev));
        assert!(source_matches("/dev/nonexistent-vda3", &dev));
        assert!(!source_matches("UUID=0000", &dev));
    }

    #[test]
    fn adds_option_once_and_keeps_other_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crypttab");
        let original = format!("# root\ncryptroot UUID={UUID} none luks,discard\nother /dev/sdz none luks\n");
        fs::write(&path, &original).unwrap();

        let change = ensure_option(&path, &device(), "tpm2-device=auto").unwrap();
        let CrypttabChange::Updated { name, backup } = change else {
            panic!("expected an update, got {change:?}");
        };
        assert_eq!(name, "cryptroot");
        assert_eq!(fs::read_to_string(&backup).unwrap(), original);

        let updated = fs::read_to_string(&path).unwrap();
        assert!(updated.starts_with("# root\n"));
        assert!(updated.contains("luks,discard,tpm2-device=auto"));
        assert!(updated.contains("other /dev/sdz none luks\n"));

        let again = ensure_option(&path, &device(), "tpm2-device=auto").unwrap();
        assert_eq!(
            again,
            CrypttabChange::AlreadyPresent {
                name: "cryptroot".into()
            }
        );
    }

    #[test]
    fn missing_entry_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crypttab");
        assert_eq!(ensure_option(&path, &device(), "x").unwrap(), CrypttabChange::NoEntry);
        fs::write(&path, "other /dev/sdz none luks\n").unwrap();
        assert_eq!(ensure_option(&path, &device(), "x").unwrap(), CrypttabChange::NoEntry);
    }
}
