//! Testbed backend servers.
//!
//! `reprocheck-virt <backend>` reads protocol requests on stdin and answers
//! on stdout. The [`Server`] owns the generic parts (framing, argument
//! checks, copy and execute through the execute prefix); each [`Backend`]
//! only knows how to bring its environment up and down.
pub mod chroot;
pub mod null;
pub mod qemu;
pub mod termination;

use crate::error::{TestbedError, TestbedResult};
use crate::process;
use crate::protocol::{decode_argv, encode_argv, parse_request, Reply};
use crate::testbed::{wrap_argv, EnvOverrides};
use crate::util::format_command_line;
use std::fs::File;
use std::io::{BufRead, Write};
use std::path::Path;
use std::process::{Command, Stdio};

/// Server exit status after `quit` or end of input.
pub const EXIT_QUIT: i32 = 0;
/// Server exit status when a fatal fault aborts the protocol loop.
pub const EXIT_FATAL: i32 = 12;
/// Server exit status on an unexpected I/O failure of the protocol stream.
pub const EXIT_UNEXPECTED: i32 = 16;

/// One kind of isolated environment.
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Bring the testbed up; returns the scratch directory inside it.
    fn open(&mut self) -> TestbedResult<String>;

    /// Capability words, valid while open.
    fn capabilities(&self) -> Vec<String>;

    /// Argv prepended to any command that must run inside the testbed.
    fn execute_prefix(&self) -> Vec<String>;

    /// Restore the state at `open`; returns the new scratch directory.
    fn revert(&mut self) -> TestbedResult<String> {
        Err(TestbedError::RevertUnsupported)
    }

    /// Release everything `open` acquired. Must be idempotent.
    fn cleanup(&mut self) -> TestbedResult<()>;

    fn prepare_reboot(&mut self) -> TestbedResult<()> {
        Err(TestbedError::CapabilityMissing {
            capability: "reboot".to_string(),
            needed_by: "prepare-reboot".to_string(),
        })
    }

    fn wait_reboot(&mut self) -> TestbedResult<()> {
        Err(TestbedError::CapabilityMissing {
            capability: "reboot".to_string(),
            needed_by: "wait-reboot".to_string(),
        })
    }
}

/// Faults after which the server stops serving and exits [`EXIT_FATAL`].
fn ends_server(err: &TestbedError) -> bool {
    matches!(
        err,
        TestbedError::BootFailure(_)
            | TestbedError::ShellSetupFailure(_)
            | TestbedError::ChannelLost(_)
            | TestbedError::Poisoned
    )
}

enum Flow {
    Continue(Reply),
    Quit,
}

pub struct Server<B: Backend> {
    backend: B,
    scratch: Option<String>,
}

impl<B: Backend> Server<B> {
    pub fn new(backend: B) -> Self {
        Server {
            backend,
            scratch: None,
        }
    }

    /// Serve requests until `quit`, end of input or a fatal fault.
    /// Returns the process exit status.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> i32 {
        if write_line(&mut output, "ok").is_err() {
            return EXIT_UNEXPECTED;
        }
        let mut status = EXIT_QUIT;
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!(error = %err, "reading protocol input failed");
                    status = EXIT_UNEXPECTED;
                    break;
                }
            };
            tracing::debug!(request = %line, "received command");
            match self.handle_line(&line) {
                Ok(Flow::Continue(reply)) => {
                    if write_line(&mut output, &reply.encode()).is_err() {
                        status = EXIT_UNEXPECTED;
                        break;
                    }
                }
                Ok(Flow::Quit) => break,
                Err(err) => {
                    let message = crate::protocol::quote(&err.to_string());
                    let reply = format!("{} {message}", err.reply_keyword());
                    tracing::debug!(reply = %reply, "request failed");
                    if write_line(&mut output, &reply).is_err() {
                        status = EXIT_UNEXPECTED;
                        break;
                    }
                    if ends_server(&err) {
                        tracing::error!(error = %err, "fatal testbed fault");
                        status = EXIT_FATAL;
                        break;
                    }
                }
            }
        }
        self.shutdown();
        status
    }

    fn shutdown(&mut self) {
        self.scratch = None;
        if let Err(err) = self.backend.cleanup() {
            tracing::warn!(error = %err, backend = self.backend.name(), "cleanup failed");
        }
    }

    fn handle_line(&mut self, line: &str) -> TestbedResult<Flow> {
        let (command, args) = parse_request(line)?;
        let fields = match command.as_str() {
            "quit" => {
                expect_args(&command, &args, 0)?;
                return Ok(Flow::Quit);
            }
            "open" => {
                expect_args(&command, &args, 0)?;
                if self.scratch.is_some() {
                    return Err(TestbedError::Backend("testbed is already open".to_string()));
                }
                let scratch = self.backend.open()?;
                tracing::info!(backend = self.backend.name(), %scratch, "testbed open");
                self.scratch = Some(scratch.clone());
                vec![scratch]
            }
            "capabilities" => {
                expect_args(&command, &args, 0)?;
                self.require_open(&command)?;
                self.backend.capabilities()
            }
            "print-execute-command" => {
                expect_args(&command, &args, 0)?;
                self.require_open(&command)?;
                vec![encode_argv(&self.backend.execute_prefix())]
            }
            "downtmp" => {
                expect_args(&command, &args, 1)?;
                vec![self.downtmp(&args[0])?]
            }
            "execute" => {
                expect_args(&command, &args, 5)?;
                let status = self.execute_files(&args)?;
                vec![status.to_string()]
            }
            "copydown" => {
                expect_args(&command, &args, 2)?;
                self.require_open(&command)?;
                copy_paths(&args[0], &args[1])?;
                self.copydown(&args[0], &args[1])?;
                Vec::new()
            }
            "copyup" => {
                expect_args(&command, &args, 2)?;
                self.require_open(&command)?;
                copy_paths(&args[0], &args[1])?;
                self.copyup(&args[0], &args[1])?;
                Vec::new()
            }
            "revert" => {
                expect_args(&command, &args, 0)?;
                self.require_open(&command)?;
                if !self.backend.capabilities().iter().any(|cap| cap == "revert") {
                    return Err(TestbedError::Backend(
                        "`revert' when `revert' not advertised".to_string(),
                    ));
                }
                let scratch = self.backend.revert()?;
                self.scratch = Some(scratch.clone());
                vec![scratch]
            }
            "close" | "cleanup" => {
                expect_args(&command, &args, 0)?;
                self.require_open(&command)?;
                self.scratch = None;
                self.backend.cleanup()?;
                Vec::new()
            }
            "prepare-reboot" => {
                expect_args(&command, &args, 0)?;
                self.require_open(&command)?;
                self.backend.prepare_reboot()?;
                Vec::new()
            }
            "wait-reboot" => {
                expect_args(&command, &args, 0)?;
                self.require_open(&command)?;
                self.backend.wait_reboot()?;
                Vec::new()
            }
            "shell" => {
                expect_args(&command, &args, 1)?;
                self.require_open(&command)?;
                self.shell(&args[0])?;
                Vec::new()
            }
            other => {
                return Err(TestbedError::BadRequest(format!("unknown command `{other}'")));
            }
        };
        Ok(Flow::Continue(Reply::ok(fields)))
    }

    fn require_open(&self, command: &str) -> TestbedResult<&str> {
        self.scratch
            .as_deref()
            .ok_or_else(|| TestbedError::BadRequest(format!("`{command}' before `open'")))
    }

    fn downtmp(&mut self, name: &str) -> TestbedResult<String> {
        let scratch = self.require_open("downtmp")?.to_string();
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(TestbedError::BadRequest(format!(
                "downtmp name `{name}' must be a single path component"
            )));
        }
        let path = format!("{scratch}/{name}");
        let argv = vec!["mkdir".to_string(), "-p".to_string(), path.clone()];
        self.run_in_testbed(&argv, Stdio::null(), Stdio::null())?;
        Ok(path)
    }

    fn execute_files(&mut self, args: &[String]) -> TestbedResult<i32> {
        self.require_open("execute")?;
        let argv = decode_argv(&args[0])?;
        if argv.is_empty() {
            return Err(TestbedError::BadRequest("execute needs a command".to_string()));
        }
        let stdin = open_host(&args[1], false)?;
        let stdout = open_host(&args[2], true)?;
        let stderr = open_host(&args[3], true)?;
        let wrapped = wrap_argv(&argv, &EnvOverrides::new(), Some(&args[4]));
        let mut cmd = self.testbed_command(&wrapped)?;
        cmd.stdin(stdin).stdout(stdout).stderr(stderr);
        let status = cmd.status()?;
        Ok(process::exit_code(&status))
    }

    fn copydown(&mut self, host: &str, tb: &str) -> TestbedResult<()> {
        if host.ends_with('/') {
            let producer = host_command(&["tar", "-C", host, "-cf", "-", "."]);
            let consumer = self.testbed_command(&sh_argv(
                "mkdir -p \"$1\" && tar -C \"$1\" --no-same-owner -xf -",
                tb,
            ))?;
            run_pipeline(producer, consumer)
        } else {
            let source = open_host(host, false)?;
            let mut consumer = self.testbed_command(&sh_argv("cat > \"$1\"", tb))?;
            consumer.stdin(source);
            check_status(consumer.status()?, "copydown")
        }
    }

    fn copyup(&mut self, tb: &str, host: &str) -> TestbedResult<()> {
        if tb.ends_with('/') {
            std::fs::create_dir_all(host)?;
            let producer =
                self.testbed_command(&sh_argv("tar -C \"$1\" -cf - .", tb))?;
            let consumer = host_command(&["tar", "-C", host, "-xf", "-"]);
            run_pipeline(producer, consumer)
        } else {
            if let Some(parent) = Path::new(host).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let target = open_host(host, true)?;
            let mut producer = self.testbed_command(&sh_argv("cat \"$1\"", tb))?;
            producer.stdout(target);
            check_status(producer.status()?, "copyup")
        }
    }

    fn shell(&mut self, dir: &str) -> TestbedResult<()> {
        let tty = || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/tty")
                .map_err(|err| TestbedError::Backend(format!("open /dev/tty: {err}")))
        };
        let argv = sh_argv("cd \"$1\" && exec \"${SHELL:-/bin/sh}\" -i", dir);
        let mut cmd = self.testbed_command(&argv)?;
        cmd.stdin(tty()?).stdout(tty()?).stderr(tty()?);
        // The shell's own exit status is irrelevant to the session.
        let status = cmd.status()?;
        tracing::debug!(status = %status, "interactive shell exited");
        Ok(())
    }

    fn run_in_testbed(&self, argv: &[String], stdout: Stdio, stderr: Stdio) -> TestbedResult<()> {
        let mut cmd = self.testbed_command(argv)?;
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        check_status(cmd.status()?, &format_command_line(argv))
    }

    fn testbed_command(&self, argv: &[String]) -> TestbedResult<Command> {
        let mut full = self.backend.execute_prefix();
        full.extend(argv.iter().cloned());
        let (program, args) = full
            .split_first()
            .ok_or_else(|| TestbedError::BadRequest("empty command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

fn write_line<W: Write>(output: &mut W, line: &str) -> std::io::Result<()> {
    writeln!(output, "{line}")?;
    output.flush()
}

fn expect_args(command: &str, args: &[String], count: usize) -> TestbedResult<()> {
    if args.len() == count {
        return Ok(());
    }
    Err(TestbedError::BadRequest(format!(
        "`{command}' takes {count} arguments, got {}",
        args.len()
    )))
}

/// Both ends of a copy must agree on being directories (trailing `/`).
fn copy_paths(first: &str, second: &str) -> TestbedResult<()> {
    if first.ends_with('/') != second.ends_with('/') {
        return Err(TestbedError::BadRequest(format!(
            "directory copy needs trailing `/' on both `{first}' and `{second}'"
        )));
    }
    Ok(())
}

fn sh_argv(script: &str, arg: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-ec".to_string(),
        script.to_string(),
        "sh".to_string(),
        arg.to_string(),
    ]
}

fn host_command(argv: &[&str]) -> Command {
    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

fn open_host(path: &str, write: bool) -> TestbedResult<File> {
    let file = if write {
        File::create(path)
    } else {
        File::open(path)
    };
    file.map_err(|err| TestbedError::BadRequest(format!("open {path}: {err}")))
}

fn check_status(status: std::process::ExitStatus, what: &str) -> TestbedResult<()> {
    if status.success() {
        return Ok(());
    }
    Err(TestbedError::Backend(format!(
        "{what} failed with status {}",
        process::exit_code(&status)
    )))
}

/// Stream `producer`'s stdout into `consumer`'s stdin (a tar copy).
fn run_pipeline(mut producer: Command, mut consumer: Command) -> TestbedResult<()> {
    producer.stdin(Stdio::null()).stdout(Stdio::piped());
    let mut left = producer.spawn()?;
    let pipe = left
        .stdout
        .take()
        .ok_or_else(|| TestbedError::Backend("copy pipe unavailable".to_string()))?;
    consumer.stdin(Stdio::from(pipe)).stdout(Stdio::null());
    let right = consumer.spawn();
    let mut right = match right {
        Ok(child) => child,
        Err(err) => {
            let _ = left.kill();
            let _ = left.wait();
            return Err(err.into());
        }
    };
    let left_status = left.wait()?;
    let right_status = right.wait()?;
    check_status(left_status, "copy (sending side)")?;
    check_status(right_status, "copy (receiving side)")
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
