//! slotkeeper command-line interface for TPM2/LUKS slot setup, reporting, and cleanup.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, warn};
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use slotkeeper_core::{
    config::{bootstrap_template, BackendChoice, SlotkeeperConfig, DEFAULT_CONFIG_PATH},
    interrupt::{self, INTERRUPT_EXIT_CODE},
    logging,
    workflow::{
        self, ensure_root, snapshot_path, CleanupOptions, HealthPhase, Prompter, SetupOptions,
        SharedBackend, StatusScope, WorkflowLevel, WorkflowReport,
    },
    SlotkeeperError, SlotkeeperResult,
};
use slotkeeper_luks::{backend_from_config, installed_backends, SystemPlatform};
use slotkeeper_provider::pcr::PcrSpec;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "slotkeeper",
    version,
    about = "Manage LUKS authentication slots: TPM2 bindings, passphrases, and recovery keys."
)]
struct Cli {
    /// Path to the slotkeeper configuration file (SLOTKEEPER_CONFIG overrides the default).
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enrollment backend; defaults to `backend.type` from the configuration.
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive setup: recovery key, optional new passphrase, TPM2 enrollment, verification.
    Setup {
        /// LUKS device to configure; discovered with lsblk when omitted.
        #[arg(long)]
        device: Option<PathBuf>,

        /// Walk every step without changing the header or writing files.
        #[arg(long)]
        dry_run: bool,

        /// Wipe and re-create an existing TPM2 binding.
        #[arg(long)]
        reenroll: bool,

        /// PCR selection for the TPM2 binding (e.g. `7`, `0,7`, `sha256:7`).
        #[arg(long, value_parser = parse_pcrs)]
        pcrs: Option<PcrSpec>,

        /// Allow removals that leave fewer auth methods than `safety.min_remaining_auth_methods`.
        #[arg(long)]
        force: bool,
    },

    /// Read-only report on the TPM, PCRs, LUKS slots, and boot integration.
    Status {
        /// Restrict the report to one section.
        #[arg(value_enum)]
        scope: Option<ScopeArg>,

        /// Report on this device only instead of every discovered one.
        #[arg(long)]
        device: Option<PathBuf>,
    },

    /// Remove duplicate TPM2 bindings and duplicate passphrase slots.
    Cleanup {
        /// Print the removal plan without changing anything.
        #[arg(short, long)]
        dry_run: bool,

        /// Process every discovered LUKS device.
        #[arg(short, long, conflicts_with = "device")]
        all: bool,

        /// LUKS device to clean; discovered with lsblk when omitted.
        device: Option<PathBuf>,

        /// TPM2 slot to keep when several exist.
        #[arg(long, value_name = "SLOT")]
        keep_tpm2: Option<u8>,

        /// Allow removals that leave fewer auth methods than `safety.min_remaining_auth_methods`.
        #[arg(long)]
        force: bool,
    },

    /// Snapshot PCRs before a firmware/kernel update and compare afterwards.
    Health {
        /// `pre` stores a snapshot, `post` compares against it. When omitted,
        /// `post` runs if a snapshot exists, `pre` otherwise.
        #[arg(value_enum)]
        phase: Option<PhaseArg>,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Output the JSON schema instead of validating a file.
        #[arg(long, conflicts_with = "template")]
        schema: bool,

        /// Print a commented default configuration.
        #[arg(long)]
        template: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Clevis,
    Cryptenroll,
}

impl From<BackendArg> for BackendChoice {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Auto => BackendChoice::Auto,
            BackendArg::Clevis => BackendChoice::Clevis,
            BackendArg::Cryptenroll => BackendChoice::Cryptenroll,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Tpm,
    Pcr,
    Luks,
    Clevis,
    Systemd,
    Boot,
    Diag,
}

impl From<ScopeArg> for StatusScope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Tpm => StatusScope::Tpm,
            ScopeArg::Pcr => StatusScope::Pcr,
            ScopeArg::Luks => StatusScope::Luks,
            ScopeArg::Clevis => StatusScope::Clevis,
            ScopeArg::Systemd => StatusScope::Systemd,
            ScopeArg::Boot => StatusScope::Boot,
            ScopeArg::Diag => StatusScope::Diag,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PhaseArg {
    Pre,
    Post,
}

fn parse_pcrs(raw: &str) -> Result<PcrSpec, String> {
    PcrSpec::parse(raw).map_err(|err| err.to_string())
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        match err.downcast_ref::<SlotkeeperError>() {
            Some(inner) => {
                if let Some(hint) = inner.remediation() {
                    eprintln!("  remediation: {hint}");
                }
                if matches!(inner, SlotkeeperError::Interrupted { .. }) {
                    std::process::exit(INTERRUPT_EXIT_CODE);
                }
            }
            None => debug!("no remediation known for: {err:?}"),
        }
        std::process::exit(1);
    }
}

/// Dispatch to the requested subcommand and map results into exit codes.
fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();
    interrupt::install_handler().map_err(anyhow::Error::new)?;
    let backend_choice = cli.backend.map(BackendChoice::from);

    match cli.command {
        Commands::Validate {
            file,
            schema,
            template,
        } => {
            if schema {
                let schema = schema_for!(SlotkeeperConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }
            if template {
                print!("{}", bootstrap_template());
                return Ok(());
            }

            let path = file.unwrap_or_else(|| SlotkeeperConfig::resolve_path(&cli.config));
            let cfg = SlotkeeperConfig::load(&path)
                .map_err(anyhow::Error::new)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?;
            let issues = cfg.validate();
            if !issues.is_empty() {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("  - {issue}");
                }
                std::process::exit(1);
            }
            println!(
                "Configuration valid (backend={}, pcrs={}, min auth methods={}).",
                backend_label(cfg.backend.kind),
                cfg.tpm.pcrs,
                cfg.safety.min_remaining_auth_methods
            );
            Ok(())
        }

        Commands::Setup {
            device,
            dry_run,
            reenroll,
            pcrs,
            force,
        } => {
            if !dry_run {
                ensure_root().map_err(anyhow::Error::new)?;
            }
            let config = load_cli_config(&cli.config)?;
            let mut prompter = TerminalPrompter;
            confirm_force(&mut prompter, force)?;
            let backend = backend_from_config(&config, backend_choice).map_err(anyhow::Error::new)?;
            let platform = SystemPlatform::from_config(&config).map_err(anyhow::Error::new)?;
            let options = SetupOptions {
                device,
                dry_run,
                reenroll_tpm2: reenroll,
                pcrs,
                force,
            };
            let report = workflow::setup(&config, &backend, &platform, &mut prompter, &options)
                .map_err(anyhow::Error::new)?;
            finish(report)
        }

        Commands::Status { scope, device } => {
            let config = load_cli_config(&cli.config)?;
            let platform = SystemPlatform::from_config(&config).map_err(anyhow::Error::new)?;
            let backends = status_backends(&config, backend_choice)?;
            let shared: Vec<SharedBackend<'_>> = backends
                .iter()
                .map(|backend| backend as SharedBackend<'_>)
                .collect();
            let scope = scope.map(StatusScope::from).unwrap_or_default();
            let report = workflow::status(&config, &platform, &shared, scope, device.as_deref())
                .map_err(anyhow::Error::new)?;
            print_report(&report);
            Ok(())
        }

        Commands::Cleanup {
            dry_run,
            all,
            device,
            keep_tpm2,
            force,
        } => {
            if !dry_run {
                ensure_root().map_err(anyhow::Error::new)?;
            }
            let config = load_cli_config(&cli.config)?;
            let mut prompter = TerminalPrompter;
            confirm_force(&mut prompter, force)?;
            let backend = backend_from_config(&config, backend_choice).map_err(anyhow::Error::new)?;
            let platform = SystemPlatform::from_config(&config).map_err(anyhow::Error::new)?;
            let options = CleanupOptions {
                dry_run,
                all,
                device,
                keep_tpm2,
                force,
            };
            let report = workflow::cleanup(&config, &backend, &platform, &mut prompter, &options)
                .map_err(anyhow::Error::new)?;
            finish(report)
        }

        Commands::Health { phase } => {
            let config = load_cli_config(&cli.config)?;
            let platform = SystemPlatform::from_config(&config).map_err(anyhow::Error::new)?;
            let phase = match phase {
                Some(PhaseArg::Pre) => HealthPhase::Pre,
                Some(PhaseArg::Post) => HealthPhase::Post,
                None if snapshot_path(&config).exists() => HealthPhase::Post,
                None => HealthPhase::Pre,
            };
            let report = workflow::health(&config, &platform, phase).map_err(anyhow::Error::new)?;
            print_report(&report);
            Ok(())
        }
    }
}

fn load_cli_config(path: &Path) -> Result<SlotkeeperConfig> {
    let path = SlotkeeperConfig::resolve_path(path);
    let config = SlotkeeperConfig::load_or_default(&path)
        .map_err(anyhow::Error::new)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    for issue in config.validate() {
        warn!("config {}: {issue}", config.path.display());
    }
    Ok(config)
}

/// Backends for the read-only report. With `--backend` only that one is used.
fn status_backends(
    config: &SlotkeeperConfig,
    choice: Option<BackendChoice>,
) -> Result<Vec<slotkeeper_luks::SystemBackend>> {
    match choice {
        Some(BackendChoice::Auto) | None => {
            installed_backends(config).map_err(anyhow::Error::new)
        }
        Some(choice) => Ok(vec![
            backend_from_config(config, Some(choice)).map_err(anyhow::Error::new)?
        ]),
    }
}

/// `--force` lowers a safety floor, so it needs its own answer.
fn confirm_force<Q: Prompter>(prompter: &mut Q, force: bool) -> Result<()> {
    if !force {
        return Ok(());
    }
    let accepted = prompter
        .confirm(
            "--force allows leaving fewer authentication methods than configured. Continue?",
            false,
        )
        .map_err(anyhow::Error::new)?;
    if !accepted {
        bail!(SlotkeeperError::Aborted("--force was not confirmed".into()));
    }
    Ok(())
}

/// Print the report, then turn any error event into exit code 1.
fn finish(report: WorkflowReport) -> Result<()> {
    print_report(&report);
    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: &WorkflowReport) {
    println!("{}", report.title);
    for event in &report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
    if let Some(key) = &report.recovery_key {
        let line = "=".repeat(key.len() + 8);
        println!();
        println!("{line}");
        println!("    {}", key.as_str());
        println!("{line}");
        println!("Store this recovery key offline now. It unlocks the device without the TPM.");
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}

fn backend_label(choice: BackendChoice) -> &'static str {
    match choice {
        BackendChoice::Auto => "auto",
        BackendChoice::Clevis => "clevis",
        BackendChoice::Cryptenroll => "cryptenroll",
    }
}

/// Prompts on the controlling terminal. Empty input or EOF cancels.
struct TerminalPrompter;

impl TerminalPrompter {
    fn read_line(&self, prompt: &str) -> SlotkeeperResult<Option<String>> {
        print!("{prompt}");
        io::stdout().flush()?;
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl Prompter for TerminalPrompter {
    fn secret(&mut self, prompt: &str) -> SlotkeeperResult<Option<Zeroizing<String>>> {
        let value = match prompt_password(format!("{prompt}: ")) {
            Ok(value) => Zeroizing::new(value),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn confirm(&mut self, prompt: &str, default: bool) -> SlotkeeperResult<bool> {
        if !io::stdin().is_terminal() {
            debug!("stdin is not a terminal; answering `{prompt}` with the default");
            return Ok(default);
        }
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            let Some(answer) = self.read_line(&format!("{prompt} {hint} "))? else {
                return Ok(default);
            };
            match answer.to_ascii_lowercase().as_str() {
                "" => return Ok(default),
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => println!("Please answer y or n."),
            }
        }
    }

    fn choose(
        &mut self,
        prompt: &str,
        options: &[String],
        default: usize,
    ) -> SlotkeeperResult<Option<usize>> {
        println!("{prompt}:");
        for (index, option) in options.iter().enumerate() {
            let marker = if index == default { "*" } else { " " };
            println!(" {marker}{}) {option}", index + 1);
        }
        loop {
            let Some(answer) = self.read_line(&format!("Choice [{}, q to cancel]: ", default + 1))?
            else {
                return Ok(None);
            };
            if answer.is_empty() {
                return Ok(Some(default));
            }
            if answer.eq_ignore_ascii_case("q") {
                return Ok(None);
            }
            match answer.parse::<usize>() {
                Ok(choice) if (1..=options.len()).contains(&choice) => return Ok(Some(choice - 1)),
                _ => println!("Enter a number between 1 and {}.", options.len()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cleanup_flags_parse() {
        let cli = Cli::try_parse_from([
            "slotkeeper",
            "cleanup",
            "-d",
            "/dev/nvme0n1p3",
            "--keep-tpm2",
            "1",
        ])
        .unwrap();
        match cli.command {
            Commands::Cleanup {
                dry_run,
                all,
                device,
                keep_tpm2,
                force,
            } => {
                assert!(dry_run);
                assert!(!all);
                assert!(!force);
                assert_eq!(device, Some(PathBuf::from("/dev/nvme0n1p3")));
                assert_eq!(keep_tpm2, Some(1));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cleanup_all_conflicts_with_device() {
        assert!(Cli::try_parse_from(["slotkeeper", "cleanup", "--all", "/dev/sda2"]).is_err());
    }

    #[test]
    fn setup_rejects_bad_pcrs() {
        assert!(Cli::try_parse_from(["slotkeeper", "setup", "--pcrs", "sha3:7"]).is_err());
        let cli = Cli::try_parse_from(["slotkeeper", "setup", "--pcrs", "0,7"]).unwrap();
        match cli.command {
            Commands::Setup { pcrs: Some(spec), .. } => assert_eq!(spec.indices, vec![0, 7]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn status_scope_and_backend_parse() {
        let cli = Cli::try_parse_from(["slotkeeper", "--backend", "clevis", "status", "pcr"]).unwrap();
        assert!(matches!(cli.backend, Some(BackendArg::Clevis)));
        match cli.command {
            Commands::Status { scope, .. } => {
                assert_eq!(scope.map(StatusScope::from), Some(StatusScope::Pcr))
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn level_tags_match_report_vocabulary() {
        assert_eq!(level_tag(WorkflowLevel::Success), "OK");
        assert_eq!(level_tag(WorkflowLevel::Security), "SEC");
    }
}
