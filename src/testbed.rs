//! Client side of the testbed control protocol.
//!
//! A [`Testbed`] owns one backend server process (`reprocheck-virt …` or any
//! program speaking the same line protocol) and drives it through
//! open → execute/copy → revert → close. Every request is bounded by a
//! timeout; a timeout or a dead channel poisons the session so the caller
//! tears it down instead of retrying.
use crate::error::{
    TestbedError, TestbedResult, AUX_EXIT_BRIDGE_FAILURE, AUX_EXIT_TIMEOUT,
};
use crate::process::{self, CapturedOutput, OutputMode, RunError};
use crate::protocol::{decode_argv, encode_argv, encode_request, parse_reply};
use crate::util::{format_command_line, truncate_bytes};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Shell snippet used to enter a working directory before exec'ing argv.
const CD_AND_EXEC: &str = "cd \"$1\" || exit 127; shift; exec \"$@\"";

/// How long the backend gets to clean up after SIGTERM before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Per-kind timeouts for testbed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub short_secs: u64,
    pub copy_secs: u64,
    pub build_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            short_secs: 100,
            copy_secs: 300,
            build_secs: 100_000,
        }
    }
}

impl Timeouts {
    pub fn for_kind(&self, kind: CommandKind) -> Duration {
        Duration::from_secs(match kind {
            CommandKind::Short => self.short_secs,
            CommandKind::Copy => self.copy_secs,
            CommandKind::Build => self.build_secs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Short,
    Copy,
    Build,
}

/// Environment overrides: `Some` sets a variable, `None` unsets it.
pub type EnvOverrides = BTreeMap<String, Option<String>>;

/// One command to run inside the testbed.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub argv: &'a [String],
    pub env: &'a EnvOverrides,
    pub cwd: Option<&'a str>,
    pub stdin: Option<&'a [u8]>,
    pub kind: CommandKind,
    pub output: OutputMode,
}

/// `env` invocation applying `env`; empty when there is nothing to apply.
pub fn env_argv(env: &EnvOverrides) -> Vec<String> {
    let mut argv = Vec::new();
    if env.is_empty() {
        return argv;
    }
    argv.push("env".to_string());
    for (key, _) in env.iter().filter(|(_, value)| value.is_none()) {
        argv.push("-u".to_string());
        argv.push(key.clone());
    }
    for (key, value) in env {
        if let Some(value) = value {
            argv.push(format!("{key}={value}"));
        }
    }
    argv
}

/// Build the argv that runs `argv` with `env` applied inside `cwd`.
pub fn wrap_argv(argv: &[String], env: &EnvOverrides, cwd: Option<&str>) -> Vec<String> {
    let mut inner = env_argv(env);
    inner.extend(argv.iter().cloned());
    match cwd {
        Some(cwd) => {
            let mut wrapped = vec![
                "sh".to_string(),
                "-c".to_string(),
                CD_AND_EXEC.to_string(),
                "sh".to_string(),
                cwd.to_string(),
            ];
            wrapped.extend(inner);
            wrapped
        }
        None => inner,
    }
}

pub struct Testbed {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    replies: Option<Receiver<std::io::Result<String>>>,
    last_sent: Option<String>,
    scratch: Option<String>,
    caps: Vec<String>,
    exec_prefix: Vec<String>,
    timeouts: Timeouts,
    poisoned: bool,
    stopped: bool,
}

impl Testbed {
    /// Spawn the backend server and wait for its `ok` banner.
    pub fn start(argv: &[String], timeouts: Timeouts) -> TestbedResult<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TestbedError::Protocol("empty backend command".to_string()))?;
        tracing::info!(backend = %format_command_line(argv), "starting testbed backend");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TestbedError::ChannelLost("backend stdout unavailable".to_string()))?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                let result = reader.read_line(&mut line).map(|_| line);
                let eof = matches!(&result, Ok(line) if line.is_empty()) || result.is_err();
                if tx.send(result).is_err() || eof {
                    break;
                }
            }
        });

        let mut testbed = Testbed {
            child: Some(child),
            stdin,
            replies: Some(rx),
            last_sent: None,
            scratch: None,
            caps: Vec::new(),
            exec_prefix: Vec::new(),
            timeouts,
            poisoned: false,
            stopped: false,
        };
        let banner = testbed
            .expect(timeouts.for_kind(CommandKind::Short))
            .and_then(|reply| reply);
        if let Err(err) = banner {
            testbed.poisoned = true;
            testbed.stop();
            return Err(err);
        }
        Ok(testbed)
    }

    pub fn scratch(&self) -> Option<&str> {
        self.scratch.as_deref()
    }

    pub fn capabilities(&self) -> &[String] {
        &self.caps
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.caps.iter().any(|cap| cap == name)
    }

    /// Value of a `key=value` capability.
    pub fn capability_value(&self, key: &str) -> Option<&str> {
        self.caps.iter().find_map(|cap| {
            cap.split_once('=')
                .filter(|(name, _)| *name == key)
                .map(|(_, value)| value)
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Boot/prepare the testbed and learn its capabilities.
    pub fn open(&mut self) -> TestbedResult<&[String]> {
        if self.scratch.is_some() {
            return Ok(&self.caps);
        }
        let fields = self.command("open", &[], CommandKind::Build)?;
        let scratch = single_field("open", fields)?;
        tracing::debug!(%scratch, "testbed opened");
        self.scratch = Some(scratch);
        self.refresh_session_info()?;
        Ok(&self.caps)
    }

    fn refresh_session_info(&mut self) -> TestbedResult<()> {
        let prefix = self.command("print-execute-command", &[], CommandKind::Short)?;
        self.exec_prefix = match prefix.first() {
            Some(word) => decode_argv(word)?,
            None => Vec::new(),
        };
        self.caps = self.command("capabilities", &[], CommandKind::Short)?;
        tracing::debug!(caps = ?self.caps, prefix = ?self.exec_prefix, "testbed session info");
        Ok(())
    }

    /// Create `<scratch>/<name>` inside the testbed and return its path.
    pub fn downtmp(&mut self, name: &str) -> TestbedResult<String> {
        let fields = self.command("downtmp", &[name], CommandKind::Short)?;
        single_field("downtmp", fields)
    }

    /// Copy a host file or directory (trailing `/`) into the testbed.
    pub fn copydown(&mut self, host: &str, tb: &str) -> TestbedResult<()> {
        self.command("copydown", &[host, tb], CommandKind::Copy)?;
        Ok(())
    }

    /// Copy a testbed file or directory (trailing `/`) to the host.
    pub fn copyup(&mut self, tb: &str, host: &str) -> TestbedResult<()> {
        self.command("copyup", &[tb, host], CommandKind::Copy)?;
        Ok(())
    }

    /// Run a command in the testbed through the backend's execute prefix.
    pub fn execute(&mut self, request: &ExecRequest<'_>) -> TestbedResult<CapturedOutput> {
        self.ensure_usable()?;
        if self.scratch.is_none() {
            return Err(TestbedError::Protocol("execute before open".to_string()));
        }
        let inner = wrap_argv(request.argv, request.env, request.cwd);
        let mut full = self.exec_prefix.clone();
        full.extend(inner);
        let command_line = format_command_line(request.argv);
        tracing::debug!(command = %format_command_line(&full), "testbed execute");

        let (program, args) = full
            .split_first()
            .ok_or_else(|| TestbedError::Protocol("empty command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        let timeout = self.timeouts.for_kind(request.kind);
        let result = process::run_with_deadline(&mut cmd, request.stdin, request.output, timeout);
        let output = match result {
            Ok(output) => output,
            Err(RunError::TimedOut) => {
                return Err(self.poison(TestbedError::ExecutionTimeout {
                    command: command_line,
                    timeout,
                }))
            }
            Err(RunError::Spawn(err)) | Err(RunError::Wait(err)) => {
                return Err(self.poison(TestbedError::Io(err)))
            }
        };
        tracing::debug!(exit_code = output.exit_code, "testbed command exited");

        if !self.exec_prefix.is_empty() {
            if output.exit_code == AUX_EXIT_TIMEOUT {
                return Err(self.poison(TestbedError::ExecutionTimeout {
                    command: command_line,
                    timeout,
                }));
            }
            if output.exit_code == AUX_EXIT_BRIDGE_FAILURE {
                return Err(self.poison(TestbedError::ChannelLost(format!(
                    "execute prefix failed running `{command_line}`: {}",
                    truncate_bytes(&output.stderr, 2048).trim()
                ))));
            }
        }
        Ok(output)
    }

    /// Run a short command that must succeed; returns its stdout.
    pub fn check_exec(&mut self, argv: &[String]) -> TestbedResult<String> {
        let env = EnvOverrides::new();
        let output = self.execute(&ExecRequest {
            argv,
            env: &env,
            cwd: None,
            stdin: None,
            kind: CommandKind::Short,
            output: OutputMode::Capture,
        })?;
        if output.exit_code != 0 {
            return Err(TestbedError::Backend(format!(
                "`{}` failed with status {}: {}",
                format_command_line(argv),
                output.exit_code,
                truncate_bytes(&output.stderr, 2048).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a command with host-side stdio files through the protocol itself.
    pub fn execute_with_files(
        &mut self,
        argv: &[String],
        stdin: &Path,
        stdout: &Path,
        stderr: &Path,
        cwd: &str,
    ) -> TestbedResult<i32> {
        let argv_word = encode_argv(argv);
        let stdin = stdin.display().to_string();
        let stdout = stdout.display().to_string();
        let stderr = stderr.display().to_string();
        let fields = self.command(
            "execute",
            &[&argv_word, &stdin, &stdout, &stderr, cwd],
            CommandKind::Build,
        )?;
        let status = single_field("execute", fields)?;
        status
            .parse()
            .map_err(|_| TestbedError::Protocol(format!("bad exit status `{status}'")))
    }

    /// Restore the testbed to its state at `open`.
    pub fn revert(&mut self) -> TestbedResult<()> {
        self.ensure_usable()?;
        if !self.has_capability("revert") {
            return Err(TestbedError::RevertUnsupported);
        }
        let fields = self.command("revert", &[], CommandKind::Build)?;
        self.scratch = Some(single_field("revert", fields)?);
        self.refresh_session_info()
    }

    pub fn prepare_reboot(&mut self) -> TestbedResult<()> {
        self.require_capability("reboot", "prepare-reboot")?;
        self.command("prepare-reboot", &[], CommandKind::Short)?;
        Ok(())
    }

    pub fn wait_reboot(&mut self) -> TestbedResult<()> {
        self.require_capability("reboot", "wait-reboot")?;
        self.command("wait-reboot", &[], CommandKind::Build)?;
        Ok(())
    }

    /// Hand the controlling terminal to an interactive shell in `dir`.
    pub fn shell(&mut self, dir: &str) -> TestbedResult<()> {
        self.command("shell", &[dir], CommandKind::Build)?;
        Ok(())
    }

    pub fn require_capability(&self, capability: &str, needed_by: &str) -> TestbedResult<()> {
        if self.has_capability(capability) {
            return Ok(());
        }
        Err(TestbedError::CapabilityMissing {
            capability: capability.to_string(),
            needed_by: needed_by.to_string(),
        })
    }

    /// Release the testbed session. Safe to call repeatedly.
    pub fn close(&mut self) -> TestbedResult<()> {
        if self.scratch.is_none() {
            return Ok(());
        }
        self.scratch = None;
        self.caps.clear();
        self.exec_prefix.clear();
        if self.poisoned {
            return Ok(());
        }
        self.command("close", &[], CommandKind::Short)?;
        Ok(())
    }

    /// Close the session and shut the backend server down. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "testbed close failed during stop");
        }
        if !self.poisoned {
            let _ = self.send("quit");
        }
        // Closing stdin is the cue for the server to clean up and exit.
        self.stdin = None;
        self.replies = None;
        if let Some(mut child) = self.child.take() {
            let grace = self.timeouts.for_kind(CommandKind::Short);
            match process::wait_deadline(&mut child, grace) {
                Ok(Some(status)) if !status.success() => {
                    tracing::warn!(status = %status, "testbed backend exited with failure");
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    tracing::warn!("testbed backend did not exit; terminating it");
                    process::terminate(&mut child, TERMINATE_GRACE);
                }
            }
        }
    }

    fn ensure_usable(&self) -> TestbedResult<()> {
        if self.poisoned {
            return Err(TestbedError::Poisoned);
        }
        Ok(())
    }

    fn poison(&mut self, err: TestbedError) -> TestbedError {
        if err.is_session_fatal() {
            self.poisoned = true;
        }
        err
    }

    fn command(
        &mut self,
        command: &str,
        args: &[&str],
        kind: CommandKind,
    ) -> TestbedResult<Vec<String>> {
        self.ensure_usable()?;
        let line = encode_request(command, args);
        if let Err(err) = self.send(&line) {
            return Err(self.poison(err));
        }
        let timeout = self.timeouts.for_kind(kind);
        let reply = match self.expect(timeout) {
            Ok(reply) => reply,
            Err(err) => return Err(self.poison(err)),
        };
        reply.map_err(|err| self.poison(err))
    }

    fn send(&mut self, line: &str) -> TestbedResult<()> {
        tracing::debug!(command = line, "sending command to testbed");
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| TestbedError::ChannelLost("backend stdin closed".to_string()))?;
        writeln!(stdin, "{line}")
            .and_then(|_| stdin.flush())
            .map_err(|err| TestbedError::ChannelLost(format!("cannot send to testbed: {err}")))?;
        self.last_sent = Some(line.to_string());
        Ok(())
    }

    /// Wait for one reply line. The outer result carries channel-level
    /// faults, the inner one the backend's verdict.
    fn expect(&mut self, timeout: Duration) -> TestbedResult<TestbedResult<Vec<String>>> {
        let sent = self.last_sent.clone().unwrap_or_else(|| "<banner>".to_string());
        let replies = self
            .replies
            .as_ref()
            .ok_or_else(|| TestbedError::ChannelLost("backend stdout closed".to_string()))?;
        let line = match replies.recv_timeout(timeout) {
            Ok(Ok(line)) => line,
            Ok(Err(err)) => return Err(TestbedError::ChannelLost(err.to_string())),
            Err(RecvTimeoutError::Timeout) => {
                return Err(TestbedError::ProtocolTimeout {
                    command: sent,
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(TestbedError::ChannelLost(
                    "unexpected eof from the testbed".to_string(),
                ))
            }
        };
        if line.is_empty() {
            return Err(TestbedError::ChannelLost(
                "unexpected eof from the testbed".to_string(),
            ));
        }
        let Some(line) = line.strip_suffix('\n') else {
            return Err(TestbedError::ChannelLost(
                "unterminated line from the testbed".to_string(),
            ));
        };
        tracing::debug!(reply = line, "got reply from testbed");
        let reply = parse_reply(line).map_err(|err| match err {
            TestbedError::Protocol(msg) => {
                TestbedError::Protocol(format!("sent `{sent}': {msg}"))
            }
            other => other,
        })?;
        Ok(reply.into_result())
    }
}

impl Drop for Testbed {
    fn drop(&mut self) {
        self.stop();
    }
}

fn single_field(command: &str, fields: Vec<String>) -> TestbedResult<String> {
    let count = fields.len();
    let mut fields = fields.into_iter();
    match (fields.next(), count) {
        (Some(field), 1) => Ok(field),
        _ => Err(TestbedError::Protocol(format!(
            "sent `{command}', got {count} result parameters, expected 1"
        ))),
    }
}

#[cfg(test)]
#[path = "testbed_tests.rs"]
mod tests;
