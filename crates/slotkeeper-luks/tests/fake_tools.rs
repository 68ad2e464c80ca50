//! Exercises the real adapters against fake `cryptsetup`, `clevis`, and
//! `systemd-cryptenroll` scripts that log their argv.

use slotkeeper_core::classify::{classify, AuthKind};
use slotkeeper_core::config::{BackendChoice, SlotkeeperConfig};
use slotkeeper_core::error::{SlotkeeperError, SlotkeeperResult};
use slotkeeper_luks::{backend_from_config, SystemBackend};
use slotkeeper_provider::luks::LuksBackend;
use slotkeeper_provider::pcr::PcrSpec;
use slotkeeper_provider::BackendKind;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const AUTH: &str = "correct horse";
const NEW_SECRET: &str = "battery staple 42";
const UUID: &str = "6f1c2b9e-2c71-4d55-9a43-0e4b2d1f7a10";

const CRYPTSETUP: &str = r#"#!/bin/sh
echo "cryptsetup $*" >> "@DIR@/calls.log"
case "$1" in
  --version) echo "cryptsetup 2.7.0 flags: UDEV BLKID KEYRING"; exit 0 ;;
  isLuks) exit 0 ;;
  luksDump) cat "@DIR@/dump.txt"; exit 0 ;;
  open|luksOpen)
    key=$(cat)
    if [ "$key" = "correct horse" ]; then exit 0; fi
    echo "No key available with this passphrase." >&2
    exit 2 ;;
  luksAddKey)
    auth=$(cat)
    for last; do :; done
    if [ "$auth" != "correct horse" ]; then
      echo "No key available with this passphrase." >&2
      exit 2
    fi
    cp "$last" "@DIR@/added.key"
    stat -c %a "$last" > "@DIR@/added.mode"
    echo "$last" > "@DIR@/added.path"
    exit 0 ;;
  luksKillSlot) cat > /dev/null; exit 0 ;;
esac
exit 1
"#;

const CRYPTENROLL: &str = r#"#!/bin/sh
echo "cryptenroll $*" >> "@DIR@/calls.log"
if [ -n "$PASSWORD" ]; then echo "env PASSWORD set" >> "@DIR@/calls.log"; fi
if [ "$1" = "--version" ]; then
  echo "systemd @VERSION@ (@VERSION@.1-1)"
  echo "+PAM +AUDIT +SELINUX"
  exit 0
fi
if [ $# -eq 1 ]; then
  printf 'SLOT TYPE\n   0 password\n   1 tpm2\n'
  exit 0
fi
case "$*" in
  *--unlock-key-file=/dev/stdin*) auth=$(cat) ;;
  *) auth="$PASSWORD" ;;
esac
if [ "$auth" != "correct horse" ]; then
  echo "Failed to unlock disk: Operation not permitted" >&2
  exit 1
fi
exit 0
"#;

const CLEVIS: &str = r#"#!/bin/sh
echo "clevis $*" >> "@DIR@/calls.log"
case "$2" in
  list)
    printf '%s\n' "1: tpm2 '{\"hash\":\"sha256\",\"key\":\"ecc\",\"pcr_ids\":\"7\"}'"
    printf '%s\n' "3: tang '{\"url\":\"http://tang.example\"}'"
    exit 0 ;;
  pass)
    case "$6" in
      1) printf 'sealed-secret'; exit 0 ;;
      3) exec sleep 5 ;;
      *) echo "Failed to unlock" >&2; exit 1 ;;
    esac ;;
  bind)
    auth=$(cat)
    if [ "$auth" = "correct horse" ]; then exit 0; fi
    exit 1 ;;
  unbind) cat > /dev/null; exit 0 ;;
esac
exit 1
"#;

fn write_executable(path: &Path, contents: &str) -> SlotkeeperResult<()> {
    fs::write(path, contents)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

fn dump_text(tokens: &[(&str, u8)]) -> String {
    let mut lines = vec![
        "LUKS header information".to_string(),
        "Version:       \t2".to_string(),
        format!("UUID:          \t{UUID}"),
        String::new(),
        "Keyslots:".to_string(),
    ];
    for slot in 0..4 {
        lines.push(format!("  {slot}: luks2"));
        lines.push("\tKey:        512 bits".to_string());
        lines.push("\tPriority:   normal".to_string());
    }
    lines.push("Tokens:".to_string());
    for (id, (kind, slot)) in tokens.iter().enumerate() {
        lines.push(format!("  {id}: {kind}"));
        lines.push(format!("\tKeyslot:    {slot}"));
    }
    lines.push("Digests:".to_string());
    lines.push("  0: pbkdf2".to_string());
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

struct Fixture {
    dir: TempDir,
    device: PathBuf,
    config: SlotkeeperConfig,
}

impl Fixture {
    fn new(systemd_version: u32, tokens: &[(&str, u8)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().display().to_string();
        let fill = |script: &str| {
            script
                .replace("@DIR@", &root)
                .replace("@VERSION@", &systemd_version.to_string())
        };

        write_executable(&dir.path().join("cryptsetup"), &fill(CRYPTSETUP)).unwrap();
        write_executable(&dir.path().join("systemd-cryptenroll"), &fill(CRYPTENROLL)).unwrap();
        write_executable(&dir.path().join("clevis"), &fill(CLEVIS)).unwrap();
        for helper in ["clevis-luks-bind", "clevis-luks-unbind", "clevis-encrypt-tpm2"] {
            write_executable(&dir.path().join(helper), "#!/bin/sh\nexit 0\n").unwrap();
        }
        fs::write(dir.path().join("dump.txt"), dump_text(tokens)).unwrap();

        let device = dir.path().join("disk.img");
        fs::write(&device, vec![0u8; 4096]).unwrap();

        let mut config = SlotkeeperConfig::default();
        config.backend.cryptsetup_path = Some(dir.path().join("cryptsetup").display().to_string());
        config.backend.cryptenroll_path =
            Some(dir.path().join("systemd-cryptenroll").display().to_string());
        config.backend.clevis_path = Some(dir.path().join("clevis").display().to_string());
        config.paths.crypttab_path = dir.path().join("crypttab").display().to_string();
        config.luks.allow_image_files = true;
        config.timeouts.command_secs = 10;
        config.timeouts.tpm_secs = 1;

        Self {
            dir,
            device,
            config,
        }
    }

    fn backend(&self, choice: BackendChoice) -> SystemBackend {
        backend_from_config(&self.config, Some(choice)).unwrap()
    }

    fn calls(&self) -> String {
        fs::read_to_string(self.dir.path().join("calls.log")).unwrap_or_default()
    }

    fn assert_no_secret_in_argv(&self) {
        let calls = self.calls();
        for secret in [AUTH, NEW_SECRET, "wrong guess"] {
            assert!(!calls.contains(secret), "secret leaked into argv:\n{calls}");
        }
    }
}

#[test]
fn passphrase_tests_use_stdin_and_map_wrong_keys_to_false() {
    let fx = Fixture::new(255, &[]);
    let backend = fx.backend(BackendChoice::Cryptenroll);

    assert!(backend.test_passphrase(&fx.device, Some(0), AUTH.as_bytes()).unwrap());
    assert!(!backend.test_passphrase(&fx.device, Some(0), b"wrong guess").unwrap());
    assert!(backend.test_passphrase(&fx.device, None, AUTH.as_bytes()).unwrap());

    let calls = fx.calls();
    assert!(calls.contains("open --test-passphrase --key-slot 0 --key-file -"));
    fx.assert_no_secret_in_argv();
}

#[test]
fn add_key_stages_the_new_secret_in_a_private_temp_file() {
    let fx = Fixture::new(255, &[]);
    let backend = fx.backend(BackendChoice::Cryptenroll);

    backend
        .add_key(&fx.device, AUTH.as_bytes(), NEW_SECRET.as_bytes(), None)
        .unwrap();

    let root = fx.dir.path();
    assert_eq!(fs::read_to_string(root.join("added.key")).unwrap(), NEW_SECRET);
    assert_eq!(fs::read_to_string(root.join("added.mode")).unwrap().trim(), "600");
    let staged = fs::read_to_string(root.join("added.path")).unwrap();
    assert!(!Path::new(staged.trim()).exists(), "temp key file left behind");
    fx.assert_no_secret_in_argv();
}

#[test]
fn add_key_with_wrong_auth_is_a_backend_failure() {
    let fx = Fixture::new(255, &[]);
    let backend = fx.backend(BackendChoice::Cryptenroll);

    let err = backend
        .add_key(&fx.device, b"wrong guess", NEW_SECRET.as_bytes(), Some(5))
        .unwrap_err();
    match err {
        SlotkeeperError::BackendFailed {
            tool,
            status,
            message,
            stderr,
        } => {
            assert_eq!(tool, "cryptsetup");
            assert_eq!(status, 2);
            assert!(message.contains("rejected the existing passphrase"), "{message}");
            assert!(stderr.contains("No key available"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(fx.calls().contains("--key-slot 5"));
    fx.assert_no_secret_in_argv();
}

#[test]
fn inspect_refuses_image_files_unless_allowed() {
    let mut fx = Fixture::new(255, &[]);
    let device = fx.backend(BackendChoice::Cryptenroll).inspect_device(&fx.device).unwrap();
    assert_eq!(device.uuid.as_deref(), Some(UUID));

    fx.config.luks.allow_image_files = false;
    let err = fx
        .backend(BackendChoice::Cryptenroll)
        .inspect_device(&fx.device)
        .unwrap_err();
    assert!(matches!(err, SlotkeeperError::NotBlockDevice(_)));

    let missing = fx.dir.path().join("missing.img");
    let err = fx
        .backend(BackendChoice::Cryptenroll)
        .inspect_device(&missing)
        .unwrap_err();
    assert!(matches!(err, SlotkeeperError::NotBlockDevice(_)));
}

#[test]
fn clevis_header_learns_pins_from_luks_list() {
    let fx = Fixture::new(255, &[("clevis", 1), ("clevis", 3)]);
    let backend = fx.backend(BackendChoice::Clevis);

    let header = backend.read_header(&fx.device).unwrap();
    assert!(header.warnings.is_empty(), "{:?}", header.warnings);
    assert_eq!(header.tokens[0].fields.get("pin").map(String::as_str), Some("tpm2"));
    assert_eq!(header.tokens[1].fields.get("pin").map(String::as_str), Some("tang"));

    let kinds = classify(&header);
    assert_eq!(kinds[&0], AuthKind::Password);
    assert_eq!(kinds[&1], AuthKind::Tpm2);
    assert_eq!(kinds[&3], AuthKind::OtherToken);
}

#[test]
fn cryptenroll_marks_clevis_tokens_untrusted() {
    let fx = Fixture::new(255, &[("systemd-tpm2", 1), ("clevis", 2)]);
    let backend = fx.backend(BackendChoice::Cryptenroll);

    let header = backend.read_header(&fx.device).unwrap();
    assert_eq!(header.warnings.len(), 1, "{:?}", header.warnings);
    assert!(header.warnings[0].contains("clevis token 1"));

    let kinds = classify(&header);
    assert_eq!(kinds[&1], AuthKind::Tpm2);
    assert_eq!(kinds[&2], AuthKind::Unknown);
    assert!(!kinds[&2].auto_removable());
}

#[test]
fn clevis_slot_test_reports_success_failure_and_timeout() {
    let fx = Fixture::new(255, &[("clevis", 1), ("clevis", 3)]);
    let backend = fx.backend(BackendChoice::Clevis);
    assert!(backend.supports_slot_unlock_test());

    assert_eq!(backend.test_tpm2_slot(&fx.device, 1).unwrap(), Some(true));
    assert_eq!(backend.test_tpm2_slot(&fx.device, 2).unwrap(), Some(false));
    assert_eq!(backend.test_tpm2_slot(&fx.device, 3).unwrap(), None);
}

#[test]
fn clevis_tooling_and_binding() {
    let fx = Fixture::new(255, &[("clevis", 1)]);
    let backend = fx.backend(BackendChoice::Clevis);

    let report = backend.check_tooling().unwrap();
    assert_eq!(report.tool, "clevis");
    assert!(report.notes.iter().any(|note| note.contains("cryptsetup 2.7.0")));

    backend
        .enroll_tpm2(&fx.device, AUTH.as_bytes(), &PcrSpec::default())
        .unwrap();
    backend.wipe_tpm2(&fx.device, AUTH.as_bytes()).unwrap();
    backend.remove_slot(&fx.device, AUTH.as_bytes(), 0).unwrap();

    let calls = fx.calls();
    assert!(calls.contains("clevis luks bind -y -k - -d"));
    assert!(calls.contains("clevis luks unbind -d"));
    assert!(calls.contains("-s 1 -f"));
    assert!(calls.contains("luksKillSlot --batch-mode"));
    fx.assert_no_secret_in_argv();
}

#[test]
fn cryptenroll_passes_auth_on_stdin_from_systemd_252() {
    let fx = Fixture::new(255, &[("systemd-tpm2", 1)]);
    let backend = fx.backend(BackendChoice::Cryptenroll);

    let report = backend.check_tooling().unwrap();
    assert_eq!(report.version.as_deref(), Some("systemd 255"));
    assert!(report.security.is_empty());

    backend
        .enroll_tpm2(&fx.device, AUTH.as_bytes(), &PcrSpec::default())
        .unwrap();
    let calls = fx.calls();
    assert!(calls.contains("--tpm2-device=auto --tpm2-pcrs=7 --unlock-key-file=/dev/stdin"));
    assert!(!calls.contains("env PASSWORD set"));
    fx.assert_no_secret_in_argv();
}

#[test]
fn cryptenroll_falls_back_to_password_env_before_252() {
    let fx = Fixture::new(249, &[("systemd-tpm2", 1)]);
    let backend = fx.backend(BackendChoice::Cryptenroll);

    let report = backend.check_tooling().unwrap();
    assert!(report.security.iter().any(|note| note.contains("PASSWORD")));
    assert!(!report.notes.iter().any(|note| note.contains("PASSWORD")));

    backend.wipe_tpm2(&fx.device, AUTH.as_bytes()).unwrap();
    let err = backend
        .enroll_tpm2(&fx.device, b"wrong guess", &PcrSpec::default())
        .unwrap_err();
    assert!(matches!(err, SlotkeeperError::BackendFailed { .. }));

    let calls = fx.calls();
    assert!(calls.contains("cryptenroll --wipe-slot=tpm2"));
    assert!(calls.contains("env PASSWORD set"));
    assert!(!calls.contains("--unlock-key-file"));
    fx.assert_no_secret_in_argv();
}

#[test]
fn old_systemd_is_a_prerequisite_and_auto_picks_clevis() {
    let fx = Fixture::new(247, &[]);
    let err = fx
        .backend(BackendChoice::Cryptenroll)
        .check_tooling()
        .unwrap_err();
    assert!(matches!(err, SlotkeeperError::Prerequisite { .. }));
    assert!(err.remediation().is_some());

    let auto = fx.backend(BackendChoice::Auto);
    assert_eq!(auto.kind(), BackendKind::Clevis);

    let fresh = Fixture::new(255, &[]);
    assert_eq!(fresh.backend(BackendChoice::Auto).kind(), BackendKind::Cryptenroll);
}

#[test]
fn cryptenroll_removal_routes_token_slots_through_wipe_slot() {
    let fx = Fixture::new(255, &[("systemd-tpm2", 1)]);
    let backend = fx.backend(BackendChoice::Cryptenroll);

    backend.remove_slot(&fx.device, AUTH.as_bytes(), 1).unwrap();
    backend.remove_slot(&fx.device, AUTH.as_bytes(), 2).unwrap();

    let calls = fx.calls();
    assert!(calls.contains("cryptenroll --wipe-slot=1 --unlock-key-file=/dev/stdin"));
    assert!(calls.contains("luksKillSlot --batch-mode"));
    assert!(!calls.contains("--wipe-slot=2"));

    let listed = backend.read_enrollment(&fx.device).unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[1].is_tpm2());
}

#[test]
fn cryptenroll_boot_integration_edits_crypttab() {
    let fx = Fixture::new(255, &[("systemd-tpm2", 1)]);
    let crypttab = fx.dir.path().join("crypttab");
    fs::write(&crypttab, format!("dm_crypt-0 UUID={UUID} none luks,discard\n")).unwrap();
    let backend = fx.backend(BackendChoice::Cryptenroll);

    let device = backend.inspect_device(&fx.device).unwrap();
    let notes = backend.integrate_boot(&device).unwrap();
    assert!(notes[0].starts_with("Added tpm2-device=auto"), "{notes:?}");
    assert!(fs::read_to_string(&crypttab)
        .unwrap()
        .contains("luks,discard,tpm2-device=auto"));

    let again = backend.integrate_boot(&device).unwrap();
    assert!(again[0].contains("already carries"), "{again:?}");
}
