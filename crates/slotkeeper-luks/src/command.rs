//! Execution wrapper shared by every external tool slotkeeper drives.
//!
//! Secrets only ever travel through stdin or the child environment; argv is
//! logged at debug level and must stay free of key material.

use log::debug;
use slotkeeper_core::error::{SlotkeeperError, SlotkeeperResult};
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use zeroize::Zeroize;

#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) status: i32,
}

impl Output {
    pub(crate) fn success(&self) -> bool {
        self.status == 0
    }

    /// Wipe captured output that may echo key material.
    pub(crate) fn scrub(&mut self) {
        self.stdout.zeroize();
        self.stderr.zeroize();
    }
}

impl ToolCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    /// Short tool name used in error messages (`cryptsetup`, `clevis`).
    pub(crate) fn tool(&self) -> String {
        self.binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.display().to_string())
    }

    pub(crate) fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            binary: self.binary.clone(),
            timeout,
        }
    }

    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> SlotkeeperResult<Output> {
        self.run_with_env(args, input, &[])
    }

    /// Run the tool with extra environment variables. Values may be secrets
    /// and are never logged.
    pub(crate) fn run_with_env(
        &self,
        args: &[&str],
        input: Option<&[u8]>,
        env: &[(&str, &[u8])],
    ) -> SlotkeeperResult<Output> {
        debug!("running {} {}", self.binary.display(), args.join(" "));
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        // Own process group: a terminal Ctrl-C reaches slotkeeper, not the
        // tool in the middle of a header write.
        command.process_group(0);
        for (key, value) in env {
            command.env(key, OsStr::from_bytes(value));
        }

        if input.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn()?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // A tool that exits before reading its key closes the pipe;
                // its exit status carries the real failure.
                if let Err(err) = stdin.write_all(payload) {
                    debug!("{}: stdin closed early: {err}", self.tool());
                }
                stdin.flush().ok();
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> SlotkeeperResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SlotkeeperError::Timeout {
                tool: self.tool(),
                after: self.timeout,
            });
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| SlotkeeperError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| SlotkeeperError::Provider("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }

    /// Build the error for a failed invocation.
    pub(crate) fn failure(&self, output: &Output, message: String) -> SlotkeeperError {
        SlotkeeperError::BackendFailed {
            tool: self.tool(),
            status: output.status,
            message,
            stderr: output.stderr.trim().to_string(),
        }
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<SlotkeeperResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> SlotkeeperResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            let text = String::from_utf8_lossy(&buf).into_owned();
            buf.zeroize();
            Ok(text)
        } else {
            Ok(String::new())
        }
    })
}

/// Prefer stderr, fall back to stdout.
pub(crate) fn output_diagnostic(output: &Output) -> String {
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();
    if !stderr.is_empty() {
        stderr.to_string()
    } else {
        stdout.to_string()
    }
}

/// Diagnostic text for messages, never empty.
pub(crate) fn describe(diagnostic: &str) -> String {
    let trimmed = diagnostic.trim();
    if trimmed.is_empty() {
        "no additional output".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Older tool releases reject newer action spellings.
pub(crate) fn action_unsupported(output: &Output) -> bool {
    let lower = output_diagnostic(output).to_ascii_lowercase();
    lower.contains("unknown action")
        || lower.contains("unknown command")
        || lower.contains("invalid action")
        || lower.contains("invalid command")
        || lower.contains("unknown option")
        || lower.contains("unrecognized option")
}

pub(crate) fn is_permission_problem(lower: &str) -> bool {
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
}

pub(crate) fn is_missing_device(lower: &str) -> bool {
    lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
}

pub(crate) fn is_wrong_key(lower: &str) -> bool {
    lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
}
