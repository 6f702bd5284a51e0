//! Child process execution with a hard deadline.
//!
//! Children are started in their own process group so a timeout can take
//! down everything they spawned (sudo, make, compilers) in one signal.
use crate::util::POLL_INTERVAL;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// How the command's stdout/stderr are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Capture,
    Inherit,
}

#[derive(Debug)]
pub enum RunError {
    Spawn(io::Error),
    TimedOut,
    Wait(io::Error),
}

/// Run `cmd` feeding it `stdin`, waiting at most `timeout`.
///
/// The whole process group is terminated on timeout and the child is reaped
/// before returning.
pub fn run_with_deadline(
    cmd: &mut Command,
    stdin: Option<&[u8]>,
    output: OutputMode,
    timeout: Duration,
) -> Result<CapturedOutput, RunError> {
    cmd.process_group(0);
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    match output {
        OutputMode::Capture => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        OutputMode::Inherit => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }
    let mut child = cmd.spawn().map_err(RunError::Spawn)?;

    let stdin_task = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => {
            let bytes = bytes.to_vec();
            Some(thread::spawn(move || {
                // The child may exit without reading everything.
                let _ = pipe.write_all(&bytes);
            }))
        }
        _ => None,
    };
    let stdout_task = child.stdout.take().map(spawn_drain);
    let stderr_task = child.stderr.take().map(spawn_drain);

    let deadline = Instant::now() + timeout;
    let status = match wait_deadline(&mut child, timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            kill_group(&child);
            let _ = child.wait();
            return Err(RunError::TimedOut);
        }
        Err(err) => {
            kill_group(&child);
            let _ = child.wait();
            return Err(RunError::Wait(err));
        }
    };

    // Background processes left in the group may hold the pipes open.
    if group_alive(&child) {
        tracing::debug!(pid = child.id(), "killing processes left behind by the command");
        kill_group(&child);
    }
    while !(finished(&stdin_task) && finished(&stdout_task) && finished(&stderr_task)) {
        if Instant::now() >= deadline {
            return Err(RunError::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }

    if let Some(task) = stdin_task {
        let _ = task.join();
    }
    let stdout = join_drain(stdout_task);
    let stderr = join_drain(stderr_task);
    Ok(CapturedOutput {
        exit_code: exit_code(&status),
        stdout,
        stderr,
    })
}

/// Poll the child until it exits or `timeout` passes.
pub fn wait_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Send SIGTERM to the child's process group, then SIGKILL after a grace
/// period if anything is left.
pub fn kill_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only sends a signal.
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    thread::sleep(POLL_INTERVAL * 4);
    // SAFETY: as above.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

/// Ask a single process to exit with SIGTERM, then SIGKILL it if it is still
/// running after `grace`. The child is reaped either way.
pub fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: kill(2) only sends a signal.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
    if !matches!(wait_deadline(child, grace), Ok(Some(_))) {
        tracing::warn!(pid = child.id(), "process ignored SIGTERM; killing it");
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// Whether any process is still a member of the child's process group.
fn group_alive(child: &Child) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(-pgid, 0) == 0 }
}

/// Whether a process id still refers to a live (non-zombie) process.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc != 0 {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

pub fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

fn spawn_drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn finished<T>(task: &Option<JoinHandle<T>>) -> bool {
    !matches!(task, Some(task) if !task.is_finished())
}

fn join_drain(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    task.and_then(|task| task.join().ok()).unwrap_or_default()
}
