//! Configuration model and helpers used by slotkeeper workflows.

use crate::error::{SlotkeeperError, SlotkeeperResult};
use directories_next::ProjectDirs;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slotkeeper_provider::pcr::PcrSpec;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/slotkeeper.toml";
pub const CONFIG_ENV: &str = "SLOTKEEPER_CONFIG";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Slotkeeper";
const APP_NAME: &str = "slotkeeper";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

/// Which enrollment framework to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Prefer systemd-cryptenroll when recent enough, otherwise clevis.
    #[default]
    Auto,
    Clevis,
    Cryptenroll,
}

/// Backend selection and tool path overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BackendCfg {
    #[serde(default, rename = "type")]
    pub kind: BackendChoice,

    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub clevis_path: Option<String>,

    #[serde(default)]
    pub cryptenroll_path: Option<String>,
}

/// TPM device and sealing policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TpmCfg {
    /// PCR indices used for sealing (`7`, `0,7`, `sha256:7`).
    #[serde(default = "default_pcrs")]
    pub pcrs: String,

    /// Bank read by `health` snapshots.
    #[serde(default = "default_pcr_bank")]
    pub pcr_bank: String,

    /// Override for the TPM character device (default: /dev/tpmrm0, then /dev/tpm0).
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default)]
    pub pcrread_path: Option<String>,
}

fn default_pcrs() -> String {
    "7".to_string()
}

fn default_pcr_bank() -> String {
    "sha256".to_string()
}

impl Default for TpmCfg {
    fn default() -> Self {
        Self {
            pcrs: default_pcrs(),
            pcr_bank: default_pcr_bank(),
            device: None,
            pcrread_path: None,
        }
    }
}

/// Lockout protection knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SafetyCfg {
    /// Keyslots that must survive any removal batch unless `--force` is given.
    #[serde(default = "default_min_remaining")]
    pub min_remaining_auth_methods: usize,
}

fn default_min_remaining() -> usize {
    2
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            min_remaining_auth_methods: default_min_remaining(),
        }
    }
}

/// Where recovery keys are written and searched for.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecoveryCfg {
    #[serde(default = "default_recovery_dir")]
    pub directory: String,

    /// Directory scanned for legacy `.luks-recovery-key-<ts>.txt` files.
    #[serde(default = "default_legacy_dir")]
    pub legacy_dir: String,
}

fn default_recovery_dir() -> String {
    "/root/LUKS-Recovery".to_string()
}

fn default_legacy_dir() -> String {
    "/root".to_string()
}

impl Default for RecoveryCfg {
    fn default() -> Self {
        Self {
            directory: default_recovery_dir(),
            legacy_dir: default_legacy_dir(),
        }
    }
}

/// Audit trail and header backup locations.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditCfg {
    #[serde(default = "default_audit_log")]
    pub log_path: String,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
}

fn default_audit_log() -> String {
    "/var/log/slotkeeper-cleanup-audit.log".to_string()
}

fn default_backup_dir() -> String {
    "/var/backups/slotkeeper".to_string()
}

impl Default for AuditCfg {
    fn default() -> Self {
        Self {
            log_path: default_audit_log(),
            backup_dir: default_backup_dir(),
        }
    }
}

/// Host paths slotkeeper reads or writes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PathsCfg {
    #[serde(default = "default_crypttab_path")]
    pub crypttab_path: String,

    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,

    /// Where PCR snapshots live; defaults to the per-user cache directory.
    #[serde(default)]
    pub state_dir: Option<String>,
}

fn default_crypttab_path() -> String {
    "/etc/crypttab".to_string()
}

fn default_lock_dir() -> String {
    "/run/slotkeeper".to_string()
}

impl Default for PathsCfg {
    fn default() -> Self {
        Self {
            crypttab_path: default_crypttab_path(),
            lock_dir: default_lock_dir(),
            state_dir: None,
        }
    }
}

/// Subprocess timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TimeoutCfg {
    /// `cryptsetup` and enrollment tools.
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// TPM queries (`tpm2_pcrread`, `clevis luks pass`).
    #[serde(default = "default_tpm_secs")]
    pub tpm_secs: u64,
}

fn default_command_secs() -> u64 {
    30
}

fn default_tpm_secs() -> u64 {
    10
}

impl Default for TimeoutCfg {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            tpm_secs: default_tpm_secs(),
        }
    }
}

/// Device handling toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LuksCfg {
    /// Accept regular files holding a LUKS image (lab and test setups).
    #[serde(default)]
    pub allow_image_files: bool,
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SlotkeeperConfig {
    #[serde(default)]
    pub backend: BackendCfg,

    #[serde(default)]
    pub tpm: TpmCfg,

    #[serde(default)]
    pub safety: SafetyCfg,

    #[serde(default)]
    pub recovery: RecoveryCfg,

    #[serde(default)]
    pub audit: AuditCfg,

    #[serde(default)]
    pub paths: PathsCfg,

    #[serde(default)]
    pub timeouts: TimeoutCfg,

    #[serde(default)]
    pub luks: LuksCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl SlotkeeperConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Pick the config path: `SLOTKEEPER_CONFIG` wins over the CLI default.
    pub fn resolve_path(cli_path: &Path) -> PathBuf {
        if cli_path == Self::default_path() {
            if let Some(value) = env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
                return PathBuf::from(value);
            }
        }
        cli_path.to_path_buf()
    }

    /// Load configuration from disk, falling back to built-in defaults when
    /// the file does not exist. Nothing is written.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> SlotkeeperResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        debug!(
            "configuration {} not found; using built-in defaults",
            target.display()
        );
        Ok(Self {
            path: target.to_path_buf(),
            ..Self::default()
        })
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> SlotkeeperResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        );
        let mut cfg = if is_yaml {
            serde_yaml::from_str::<Self>(&contents)?
        } else {
            toml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_yaml {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        };

        if cfg.safety.min_remaining_auth_methods == 0 {
            return Err(SlotkeeperError::InvalidConfig(
                "safety.min_remaining_auth_methods must be at least 1".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if let Err(err) = PcrSpec::parse(&self.tpm.pcrs) {
            issues.push(format!("tpm.pcrs: {err}"));
        }
        if PcrSpec::parse(&format!("{}:0", self.tpm.pcr_bank)).is_err() {
            issues.push(format!(
                "tpm.pcr_bank `{}` is not a supported bank",
                self.tpm.pcr_bank
            ));
        }

        if self.safety.min_remaining_auth_methods == 0 {
            issues.push("safety.min_remaining_auth_methods must be at least 1".to_string());
        } else if self.safety.min_remaining_auth_methods == 1 {
            issues.push(
                "safety.min_remaining_auth_methods = 1 allows stripping a device to a single unlock method"
                    .to_string(),
            );
        }

        if self.timeouts.command_secs == 0 {
            issues.push("timeouts.command_secs must be greater than 0".to_string());
        }
        if self.timeouts.tpm_secs == 0 {
            issues.push("timeouts.tpm_secs must be greater than 0".to_string());
        }

        for (field, value) in [
            ("recovery.directory", &self.recovery.directory),
            ("recovery.legacy_dir", &self.recovery.legacy_dir),
            ("audit.log_path", &self.audit.log_path),
            ("audit.backup_dir", &self.audit.backup_dir),
            ("paths.crypttab_path", &self.paths.crypttab_path),
            ("paths.lock_dir", &self.paths.lock_dir),
        ] {
            if !Path::new(value).is_absolute() {
                issues.push(format!("{field} must be an absolute path (got `{value}`)"));
            }
        }

        for (field, value) in [
            ("backend.cryptsetup_path", &self.backend.cryptsetup_path),
            ("backend.clevis_path", &self.backend.clevis_path),
            ("backend.cryptenroll_path", &self.backend.cryptenroll_path),
            ("tpm.pcrread_path", &self.tpm.pcrread_path),
        ] {
            if let Some(path) = value.as_deref().filter(|p| !p.trim().is_empty()) {
                if !Path::new(path).exists() {
                    issues.push(format!("{field} points at missing binary {path}"));
                }
            }
        }

        issues
    }

    /// PCR policy used for new TPM2 bindings.
    pub fn pcr_spec(&self) -> SlotkeeperResult<PcrSpec> {
        let mut spec = PcrSpec::parse(&self.tpm.pcrs)
            .map_err(|err| SlotkeeperError::InvalidConfig(format!("tpm.pcrs: {err}")))?;
        if !self.tpm.pcrs.contains(':') && !self.tpm.pcr_bank.trim().is_empty() {
            spec.bank = self.tpm.pcr_bank.trim().to_ascii_lowercase();
        }
        Ok(spec)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.command_secs)
    }

    pub fn tpm_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.tpm_secs)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        PathBuf::from(&self.audit.log_path)
    }

    pub fn backup_dir(&self) -> PathBuf {
        PathBuf::from(&self.audit.backup_dir)
    }

    pub fn lock_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.lock_dir)
    }

    pub fn crypttab_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.crypttab_path)
    }

    /// Directory holding PCR snapshots.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = self.paths.state_dir.as_deref().filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        project_dirs()
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/var/cache/slotkeeper"))
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> SlotkeeperResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

/// Commented default configuration, suitable for `/etc/slotkeeper.toml`.
pub fn bootstrap_template() -> String {
    format!(
        "# slotkeeper configuration.\n\
         \n\
         [backend]\n\
         # auto | clevis | cryptenroll\n\
         type = \"auto\"\n\
         # cryptsetup_path = \"/usr/sbin/cryptsetup\"\n\
         # clevis_path = \"/usr/bin/clevis\"\n\
         # cryptenroll_path = \"/usr/bin/systemd-cryptenroll\"\n\
         \n\
         [tpm]\n\
         pcrs = \"{pcrs}\"\n\
         pcr_bank = \"{bank}\"\n\
         \n\
         [safety]\n\
         # Keyslots that must survive a removal batch unless --force is given.\n\
         min_remaining_auth_methods = {min}\n\
         \n\
         [recovery]\n\
         directory = \"{recovery}\"\n\
         legacy_dir = \"{legacy}\"\n\
         \n\
         [audit]\n\
         log_path = \"{audit}\"\n\
         backup_dir = \"{backup}\"\n\
         \n\
         [paths]\n\
         crypttab_path = \"{crypttab}\"\n\
         lock_dir = \"{lock}\"\n\
         \n\
         [timeouts]\n\
         command_secs = {cmd}\n\
         tpm_secs = {tpm}\n\
         \n\
         [luks]\n\
         allow_image_files = false\n",
        pcrs = default_pcrs(),
        bank = default_pcr_bank(),
        min = default_min_remaining(),
        recovery = default_recovery_dir(),
        legacy = default_legacy_dir(),
        audit = default_audit_log(),
        backup = default_backup_dir(),
        crypttab = default_crypttab_path(),
        lock = default_lock_dir(),
        cmd = default_command_secs(),
        tpm = default_tpm_secs(),
    )
}
