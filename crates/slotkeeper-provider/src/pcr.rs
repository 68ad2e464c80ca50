//! PCR policy selection used when sealing a keyslot to the TPM.

use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// Highest PCR index exposed by a PC-client TPM.
pub const MAX_PCR_INDEX: u8 = 23;

const KNOWN_BANKS: &[&str] = &["sha1", "sha256", "sha384", "sha512"];

/// Hash bank plus the PCR indices a TPM2 binding is sealed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSpec {
    pub bank: String,
    pub indices: Vec<u8>,
}

/// Rejected PCR selection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSpecError(pub String);

impl fmt::Display for PcrSpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid PCR selection: {}", self.0)
    }
}

impl Error for PcrSpecError {}

impl Default for PcrSpec {
    fn default() -> Self {
        Self {
            bank: "sha256".to_string(),
            indices: vec![7],
        }
    }
}

impl PcrSpec {
    /// Parse `7`, `0,7`, `0+7`, or `sha256:0,7`.
    pub fn parse(raw: &str) -> Result<Self, PcrSpecError> {
        let trimmed = raw.trim();
        let (bank, list) = match trimmed.split_once(':') {
            Some((bank, list)) => (bank.trim().to_ascii_lowercase(), list.trim()),
            None => ("sha256".to_string(), trimmed),
        };

        if !KNOWN_BANKS.contains(&bank.as_str()) {
            return Err(PcrSpecError(format!(
                "unsupported PCR bank `{bank}` (expected one of {})",
                KNOWN_BANKS.join(", ")
            )));
        }
        if list.is_empty() {
            return Err(PcrSpecError("no PCR indices given".into()));
        }
        if !list.chars().all(|ch| ch.is_ascii_digit() || ch == ',' || ch == '+') {
            return Err(PcrSpecError(format!(
                "`{list}` may only contain digits separated by `,` or `+`"
            )));
        }

        let mut indices = Vec::new();
        for part in list.split(|ch: char| ch == ',' || ch == '+') {
            if part.is_empty() {
                return Err(PcrSpecError(format!("empty PCR index in `{list}`")));
            }
            let index: u8 = part
                .parse()
                .map_err(|_| PcrSpecError(format!("`{part}` is not a PCR index")))?;
            if index > MAX_PCR_INDEX {
                return Err(PcrSpecError(format!(
                    "PCR {index} is out of range (0-{MAX_PCR_INDEX})"
                )));
            }
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        indices.sort_unstable();

        Ok(Self { bank, indices })
    }

    /// `0+7` form understood by `systemd-cryptenroll --tpm2-pcrs`.
    pub fn cryptenroll_arg(&self) -> String {
        self.join("+")
    }

    /// JSON pin configuration for `clevis luks bind ... tpm2 '<cfg>'`.
    pub fn clevis_config(&self) -> String {
        format!(
            "{{\"pcr_bank\":\"{}\",\"pcr_ids\":\"{}\"}}",
            self.bank,
            self.join(",")
        )
    }

    /// `sha256:0,7` form understood by `tpm2_pcrread`.
    pub fn pcrread_selector(&self) -> String {
        format!("{}:{}", self.bank, self.join(","))
    }

    pub fn contains(&self, index: u8) -> bool {
        self.indices.contains(&index)
    }

    fn join(&self, sep: &str) -> String {
        self.indices
            .iter()
            .map(|idx| idx.to_string())
            .collect::<Vec<_>>()
            .join(sep)
    }
}

impl FromStr for PcrSpec {
    type Err = PcrSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PcrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pcrread_selector())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(PcrSpec::parse("7").unwrap().indices, vec![7]);
        assert_eq!(PcrSpec::parse("7+0").unwrap().indices, vec![0, 7]);
        let spec = PcrSpec::parse("sha1:0,2,7").unwrap();
        assert_eq!(spec.bank, "sha1");
        assert_eq!(spec.indices, vec![0, 2, 7]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(PcrSpec::parse("").is_err());
        assert!(PcrSpec::parse("7;rm").is_err());
        assert!(PcrSpec::parse("24").is_err());
        assert!(PcrSpec::parse("md5:7").is_err());
        assert!(PcrSpec::parse("0,,7").is_err());
    }

    #[test]
    fn renders_tool_specific_forms() {
        let spec = PcrSpec::parse("0,7").unwrap();
        assert_eq!(spec.cryptenroll_arg(), "0+7");
        assert_eq!(
            spec.clevis_config(),
            r#"{"pcr_bank":"sha256","pcr_ids":"0,7"}"#
        );
        assert_eq!(spec.pcrread_selector(), "sha256:0,7");
    }
}
