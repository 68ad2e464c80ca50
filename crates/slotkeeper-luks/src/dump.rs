//! Parser for `cryptsetup luksDump` output (LUKS1 and LUKS2 layouts).
//!
//! The parser is deliberately conservative: anything it cannot place inside
//! the keyslot or token sections becomes a header warning, and callers refuse
//! to mutate a device whose header carries warnings.

use regex::Regex;
use slotkeeper_core::error::{SlotkeeperError, SlotkeeperResult};
use slotkeeper_provider::luks::{Keyslot, LuksHeader, LuksVersion, Token};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Top,
    Keyslots,
    Tokens,
    Other,
}

enum Current {
    None,
    Keyslot(usize),
    Token(usize),
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid luksDump regex"))
}

fn entry_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"^\s{2}(\d+): (\S+)(?:\s+(.*))?$")
}

fn field_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"^\t([A-Za-z0-9][A-Za-z0-9 _-]*):\s*(.*)$")
}

fn luks1_slot_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"^Key Slot (\d+): (ENABLED|DISABLED)\s*$")
}

fn top_field_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"^([A-Za-z][A-Za-z ]*):\s*(.*)$")
}

/// Parse `luksDump` text into a [`LuksHeader`].
///
/// Fails only when the format version cannot be determined; everything else
/// that looks off is recorded in `warnings`.
pub fn parse_luks_dump(text: &str) -> SlotkeeperResult<LuksHeader> {
    let mut version = None;
    let mut uuid = None;
    let mut keyslots: Vec<Keyslot> = Vec::new();
    let mut tokens: Vec<Token> = Vec::new();
    let mut warnings = Vec::new();
    let mut section = Section::Top;
    let mut current = Current::None;

    for (lineno, line) in text.lines().enumerate() {
        let lineno = lineno + 1;
        if line.trim().is_empty() {
            continue;
        }

        if let Some(caps) = luks1_slot_re().captures(line) {
            section = Section::Keyslots;
            match caps[1].parse::<u8>() {
                Ok(index) => {
                    keyslots.push(Keyslot {
                        index,
                        enabled: &caps[2] == "ENABLED",
                        slot_type: None,
                        priority: None,
                        unbound: false,
                    });
                    current = Current::Keyslot(keyslots.len() - 1);
                }
                Err(_) => {
                    warnings.push(format!("line {lineno}: keyslot index out of range: {line}"));
                    current = Current::None;
                }
            }
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        if !indented {
            current = Current::None;
            if let Some(name) = line.strip_suffix(':') {
                section = match name.trim() {
                    "Keyslots" => Section::Keyslots,
                    "Tokens" => Section::Tokens,
                    _ => Section::Other,
                };
                continue;
            }
            if let Some(caps) = top_field_re().captures(line) {
                section = Section::Top;
                let value = caps[2].trim();
                match caps[1].trim() {
                    "Version" => match value.parse::<u32>().ok().and_then(LuksVersion::from_number) {
                        Some(parsed) => version = Some(parsed),
                        None => {
                            return Err(SlotkeeperError::ParseFailed {
                                what: "luksDump".into(),
                                reason: format!("unsupported LUKS version `{value}`"),
                            })
                        }
                    },
                    "UUID" if !value.is_empty() => uuid = Some(value.to_string()),
                    _ => {}
                }
            }
            continue;
        }

        match section {
            Section::Keyslots => {
                parse_keyslot_line(line, lineno, &mut keyslots, &mut current, &mut warnings)
            }
            Section::Tokens => {
                parse_token_line(line, lineno, &mut tokens, &mut current, &mut warnings)
            }
            Section::Top | Section::Other => {}
        }
    }

    let version = version.ok_or_else(|| SlotkeeperError::ParseFailed {
        what: "luksDump".into(),
        reason: "no `Version:` line found".into(),
    })?;

    check_consistency(version, &keyslots, &tokens, &mut warnings);

    Ok(LuksHeader {
        version,
        uuid,
        keyslots,
        tokens,
        warnings,
        raw: text.to_string(),
    })
}

fn parse_keyslot_line(
    line: &str,
    lineno: usize,
    keyslots: &mut Vec<Keyslot>,
    current: &mut Current,
    warnings: &mut Vec<String>,
) {
    if let Some(caps) = entry_re().captures(line) {
        match caps[1].parse::<u8>() {
            Ok(index) => {
                keyslots.push(Keyslot {
                    index,
                    enabled: true,
                    slot_type: Some(caps[2].to_string()),
                    priority: None,
                    unbound: caps
                        .get(3)
                        .map_or(false, |rest| rest.as_str().contains("(unbound)")),
                });
                *current = Current::Keyslot(keyslots.len() - 1);
            }
            Err(_) => {
                warnings.push(format!("line {lineno}: keyslot index out of range: {}", line.trim()));
                *current = Current::None;
            }
        }
        return;
    }

    if let Some(caps) = field_re().captures(line) {
        if let Current::Keyslot(idx) = current {
            if caps[1].trim() == "Priority" {
                keyslots[*idx].priority = Some(caps[2].trim().to_string());
            }
            return;
        }
        warnings.push(format!("line {lineno}: keyslot field outside any keyslot: {}", line.trim()));
        return;
    }

    if is_continuation(line) {
        return;
    }
    warnings.push(format!("line {lineno}: unrecognised keyslot line: {}", line.trim()));
}

fn parse_token_line(
    line: &str,
    lineno: usize,
    tokens: &mut Vec<Token>,
    current: &mut Current,
    warnings: &mut Vec<String>,
) {
    if let Some(caps) = entry_re().captures(line) {
        match caps[1].parse::<u32>() {
            Ok(id) => {
                tokens.push(Token {
                    id,
                    token_type: caps[2].to_string(),
                    keyslots: Vec::new(),
                    fields: BTreeMap::new(),
                });
                *current = Current::Token(tokens.len() - 1);
            }
            Err(_) => {
                warnings.push(format!("line {lineno}: token id out of range: {}", line.trim()));
                *current = Current::None;
            }
        }
        return;
    }

    if let Some(caps) = field_re().captures(line) {
        let Current::Token(idx) = current else {
            warnings.push(format!("line {lineno}: token field outside any token: {}", line.trim()));
            return;
        };
        let token = &mut tokens[*idx];
        let key = caps[1].trim();
        let value = caps[2].trim();
        if key == "Keyslot" || key == "Keyslots" {
            for part in value.split(|ch: char| ch == ',' || ch.is_whitespace()) {
                if part.is_empty() {
                    continue;
                }
                match part.parse::<u8>() {
                    Ok(slot) => token.keyslots.push(slot),
                    Err(_) => warnings.push(format!(
                        "line {lineno}: token {} links to unparseable keyslot `{part}`",
                        token.id
                    )),
                }
            }
        } else {
            token.fields.insert(key.to_string(), value.to_string());
        }
        return;
    }

    if is_continuation(line) {
        return;
    }
    warnings.push(format!("line {lineno}: unrecognised token line: {}", line.trim()));
}

/// Wrapped values (salts, blobs, digests) continue on deeper-indented lines.
fn is_continuation(line: &str) -> bool {
    let indent = line.len() - line.trim_start().len();
    line.starts_with("\t ") || line.starts_with("\t\t") || indent > 2
}

fn check_consistency(
    version: LuksVersion,
    keyslots: &[Keyslot],
    tokens: &[Token],
    warnings: &mut Vec<String>,
) {
    let mut seen = BTreeSet::new();
    for slot in keyslots {
        if slot.index >= version.max_slots() {
            warnings.push(format!(
                "keyslot {} exceeds the {version} limit of {} slots",
                slot.index,
                version.max_slots()
            ));
        }
        if !seen.insert(slot.index) {
            warnings.push(format!("keyslot {} is listed twice", slot.index));
        }
    }

    let enabled: BTreeSet<u8> = keyslots
        .iter()
        .filter(|slot| slot.enabled)
        .map(|slot| slot.index)
        .collect();
    for token in tokens {
        for slot in &token.keyslots {
            if !enabled.contains(slot) {
                warnings.push(format!(
                    "token {} ({}) links to keyslot {slot}, which is not enabled",
                    token.id, token.token_type
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LUKS2: &[&str] = &[
        "LUKS header information",
        "Version:       \t2",
        "Epoch:         \t9",
        "Metadata area: \t16384 [bytes]",
        "UUID:          \t6f1c2b9e-2c71-4d55-9a43-0e4b2d1f7a10",
        "Label:         \t(no label)",
        "",
        "Data segments:",
        "  0: crypt",
        "\toffset: 16777216 [bytes]",
        "\tcipher: aes-xts-plain64",
        "",
        "Keyslots:",
        "  0: luks2",
        "\tKey:        512 bits",
        "\tPriority:   normal",
        "\tSalt:       ab cd ef 01 23 45 67 89 ab cd ef 01 23 45 67 89 ",
        "\t            ab cd ef 01 23 45 67 89 ab cd ef 01 23 45 67 89 ",
        "\tDigest ID:  0",
        "  1: luks2",
        "\tKey:        512 bits",
        "\tPriority:   normal",
        "  2: luks2",
        "\tKey:        512 bits",
        "  3: luks2 (unbound)",
        "\tKey:        512 bits",
        "Tokens:",
        "  0: systemd-tpm2",
        "\ttpm2-hash-pcrs:   7",
        "\ttpm2-pcr-bank:    sha256",
        "\ttpm2-blob:        00 9e 00 20 3b 1a",
        "\t                  5f 77 00 10 aa bb",
        "\tKeyslot:    1",
        "  1: systemd-recovery",
        "\tKeyslot:    2",
        "Digests:",
        "  0: pbkdf2",
        "\tHash:       sha256",
    ];

    const LUKS1: &[&str] = &[
        "LUKS header information for /dev/sda2",
        "",
        "Version:       \t1",
        "Cipher name:   \taes",
        "UUID:          \t0b9e4a55-1111-2222-3333-444455556666",
        "",
        "Key Slot 0: ENABLED",
        "\tIterations:         \t1254567",
        "\tSalt:               \tab cd",
        "\t                      \tef 01",
        "Key Slot 1: DISABLED",
        "Key Slot 2: ENABLED",
        "Key Slot 3: DISABLED",
    ];

    fn dump(lines: &[&str]) -> String {
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    #[test]
    fn parses_luks2_slots_and_tokens() {
        let header = parse_luks_dump(&dump(LUKS2)).unwrap();
        assert_eq!(header.version, LuksVersion::Luks2);
        assert_eq!(
            header.uuid.as_deref(),
            Some("6f1c2b9e-2c71-4d55-9a43-0e4b2d1f7a10")
        );
        assert_eq!(header.enabled_slots(), vec![0, 1, 2, 3]);
        assert_eq!(header.keyslot(0).unwrap().priority.as_deref(), Some("normal"));
        assert!(!header.keyslot(2).unwrap().unbound);
        assert!(header.keyslot(3).unwrap().unbound);
        assert_eq!(header.tokens.len(), 2);
        assert_eq!(header.tokens[0].token_type, "systemd-tpm2");
        assert_eq!(header.tokens[0].keyslots, vec![1]);
        assert_eq!(
            header.tokens[0].fields.get("tpm2-pcr-bank").map(String::as_str),
            Some("sha256")
        );
        assert_eq!(header.tokens[1].keyslots, vec![2]);
        assert!(header.warnings.is_empty(), "{:?}", header.warnings);
    }

    #[test]
    fn unbound_keyslot_is_never_a_fallback() {
        use slotkeeper_core::classify::{classify, AuthKind};
        use slotkeeper_core::safety::{validate_removal, RemovalPolicy};
        use std::path::Path;

        let text = dump(&[
            "Version: \t2",
            "Keyslots:",
            "  0: luks2",
            "\tPriority:   normal",
            "  1: luks2 (unbound)",
            "\tKey:        512 bits",
        ]);
        let header = parse_luks_dump(&text).unwrap();
        let map = classify(&header);
        assert_eq!(map[&0], AuthKind::Password);
        assert_eq!(map[&1], AuthKind::Unknown);

        let err = validate_removal(Path::new("/dev/vda3"), &map, &[0], &RemovalPolicy::new(1))
            .unwrap_err();
        assert!(matches!(err, SlotkeeperError::NoFallbackAuth { .. }), "{err:?}");
    }

    #[test]
    fn parses_luks1_enabled_flags() {
        let header = parse_luks_dump(&dump(LUKS1)).unwrap();
        assert_eq!(header.version, LuksVersion::Luks1);
        assert_eq!(header.enabled_slots(), vec![0, 2]);
        assert!(header.tokens.is_empty());
        assert!(header.warnings.is_empty(), "{:?}", header.warnings);
    }

    #[test]
    fn missing_version_is_a_parse_failure() {
        let err = parse_luks_dump("Keyslots:\n  0: luks2\n").unwrap_err();
        assert!(matches!(err, SlotkeeperError::ParseFailed { .. }));
        let err = parse_luks_dump("Version: 3\n").unwrap_err();
        assert!(matches!(err, SlotkeeperError::ParseFailed { .. }));
    }

    #[test]
    fn oddities_become_warnings() {
        let text = dump(&[
            "Version: \t2",
            "Keyslots:",
            "  0: luks2",
            " ?? garbage",
            "Tokens:",
            "  0: systemd-tpm2",
            "\tKeyslot:    5",
            "  1: clevis",
            "\tKeyslot:    x",
        ]);
        let header = parse_luks_dump(&text).unwrap();
        assert_eq!(header.warnings.len(), 3, "{:?}", header.warnings);
        assert!(header.warnings.iter().any(|w| w.contains("unrecognised keyslot line")));
        assert!(header.warnings.iter().any(|w| w.contains("keyslot 5")));
        assert!(header.warnings.iter().any(|w| w.contains("`x`")));
    }
}
