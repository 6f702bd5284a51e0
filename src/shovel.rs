//! Command-Execution Proxy ("shovel").
//!
//! Runs one command through a shell that is only reachable over a narrow
//! terminal channel, with stdio bridged through files in a directory shared
//! between host and guest:
//!
//! ```text
//! <shared>/job.XXXX/stdin       host appends caller stdin, guest helper drains it
//! <shared>/job.XXXX/stdin_eof   byte count, written once caller stdin hits EOF
//! <shared>/job.XXXX/stdout      guest writes, host tails
//! <shared>/job.XXXX/stderr      guest writes, host tails
//! <shared>/job.XXXX/exit        exit status, renamed into place from exit.tmp
//! ```
//!
//! A terminal cannot signal half-close, so the guest helper stops copying
//! stdin either when `stdin_eof` says everything arrived or when `exit`
//! appears.
use crate::error::{TestbedError, TestbedResult, AUX_EXIT_BRIDGE_FAILURE, AUX_EXIT_REMAPPED_255};
use crate::util::{format_command_line, poll_until, shell_quote, POLL_INTERVAL};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// File name of the guest helper inside the shared directory.
pub const HELPER_NAME: &str = "eofcat";

const HELPER_SCRIPT: &str = r#"#!/bin/sh
# eofcat <input> <eof-count-file> <exit-flag-file>
in=$1 eof=$2 flag=$3 off=0
while :; do
    size=$(wc -c < "$in")
    if [ "$size" -gt "$off" ]; then
        tail -c +$((off + 1)) "$in" | head -c $((size - off))
        off=$size
    fi
    if [ -e "$eof" ] && [ "$off" -ge "$(cat "$eof")" ]; then
        break
    fi
    [ -e "$flag" ] && break
    sleep 0.05
done
"#;

/// Write the guest helper into the host side of the shared directory.
pub fn install_helper(host_shared: &Path) -> io::Result<PathBuf> {
    let path = host_shared.join(HELPER_NAME);
    std::fs::write(&path, HELPER_SCRIPT)?;
    Ok(path)
}

/// A line-oriented channel into a running remote shell.
pub trait ShellChannel {
    fn send_line(&mut self, line: &str) -> io::Result<()>;
}

/// Serial console exposed by QEMU as a unix socket.
pub struct UnixSocketChannel {
    stream: UnixStream,
}

impl UnixSocketChannel {
    pub fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        Ok(UnixSocketChannel { stream })
    }

    /// Discard whatever the remote side printed so the console never backs up.
    fn discard_pending(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "remote shell closed the console",
                    ))
                }
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

impl ShellChannel for UnixSocketChannel {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.discard_pending()?;
        self.stream.set_nonblocking(false)?;
        let result = self
            .stream
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|_| self.stream.flush());
        self.stream.set_nonblocking(true)?;
        result
    }
}

/// A `sh` on the local machine standing in for the remote shell.
pub struct LocalShellChannel {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl LocalShellChannel {
    pub fn spawn() -> io::Result<Self> {
        let mut child = Command::new("sh")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(LocalShellChannel { child, stdin })
    }
}

impl ShellChannel for LocalShellChannel {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "shell stdin closed"))?;
        writeln!(stdin, "{line}")?;
        stdin.flush()
    }
}

impl Drop for LocalShellChannel {
    fn drop(&mut self) {
        self.stdin = None;
        let _ = self.child.wait();
    }
}

/// Where the shared directory lives on each side.
#[derive(Debug, Clone)]
pub struct SharedDir {
    pub host: PathBuf,
    pub guest: String,
}

/// Put a non-blocking flag on `fd` so reads can observe the stop flag.
pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    // SAFETY: fcntl on a caller-owned open descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Run `argv` in the remote shell, bridging stdio. Returns the exit status
/// with remote 255 remapped.
pub fn run<C, R, O, E>(
    channel: &mut C,
    shared: &SharedDir,
    argv: &[String],
    stdin: R,
    stdout: O,
    stderr: E,
    timeout: Duration,
) -> TestbedResult<i32>
where
    C: ShellChannel,
    R: Read + Send + 'static,
    O: Write + Send + 'static,
    E: Write + Send + 'static,
{
    if argv.is_empty() {
        return Err(TestbedError::BadRequest("no command given".to_string()));
    }
    let job = tempfile::Builder::new()
        .prefix("job.")
        .tempdir_in(&shared.host)?;
    let job_name = job
        .path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| TestbedError::Backend("job directory has no name".to_string()))?;
    for name in ["stdin", "stdout", "stderr"] {
        File::create(job.path().join(name))?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let tasks = [
        spawn_forward_stdin(stdin, job.path().to_path_buf(), stop.clone()),
        spawn_tail(job.path().join("stdout"), stdout, stop.clone()),
        spawn_tail(job.path().join("stderr"), stderr, stop.clone()),
    ];

    let guest_job = format!("{}/{job_name}", shared.guest.trim_end_matches('/'));
    let helper = format!("{}/{HELPER_NAME}", shared.guest.trim_end_matches('/'));
    let line = format!(
        "cd {} && {{ sh {} stdin stdin_eof exit | {{ {} >stdout 2>stderr; echo $? >exit.tmp; mv exit.tmp exit; }}; }} </dev/null >/dev/null 2>&1 &",
        shell_quote(&guest_job),
        shell_quote(&helper),
        format_command_line(argv),
    );
    tracing::debug!(job = %job_name, command = %format_command_line(argv), "shovel start");

    let outcome = channel
        .send_line(&line)
        .map_err(|err| TestbedError::ChannelLost(format!("send command to remote shell: {err}")))
        .and_then(|_| wait_exit(&job.path().join("exit"), timeout, argv));

    if outcome.is_err() {
        // Releases the guest helper if the command never finished.
        let _ = File::create(job.path().join("exit"));
    }
    stop.store(true, Ordering::SeqCst);
    let mut io_failure = None;
    for task in tasks {
        match task.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => io_failure = io_failure.or(Some(err)),
            Err(_) => {
                io_failure = io_failure.or(Some(io::Error::other("shovel task panicked")))
            }
        }
    }
    let status = outcome?;
    if let Some(err) = io_failure {
        return Err(TestbedError::ChannelLost(format!("stdio bridge: {err}")));
    }
    tracing::debug!(job = %job_name, status, "shovel done");
    Ok(remap_status(status))
}

/// Remote 255 would be mistaken for a bridge failure.
pub fn remap_status(status: i32) -> i32 {
    if status == AUX_EXIT_BRIDGE_FAILURE {
        AUX_EXIT_REMAPPED_255
    } else {
        status
    }
}

fn wait_exit(path: &Path, timeout: Duration, argv: &[String]) -> TestbedResult<i32> {
    let found = poll_until(timeout, || match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    })?;
    let Some(text) = found else {
        return Err(TestbedError::ExecutionTimeout {
            command: format_command_line(argv),
            timeout,
        });
    };
    text.trim()
        .parse()
        .map_err(|_| TestbedError::Protocol(format!("bad exit status `{}'", text.trim())))
}

fn spawn_forward_stdin<R: Read + Send + 'static>(
    mut source: R,
    job: PathBuf,
    stop: Arc<AtomicBool>,
) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        let mut target = OpenOptions::new().append(true).open(job.join("stdin"))?;
        let mut buf = [0u8; 8192];
        let mut total: u64 = 0;
        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    target.write_all(&buf[..n])?;
                    target.flush()?;
                    total += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                // The command may have ended while the caller kept its stdin open.
                Err(_) if stop.load(Ordering::SeqCst) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        let tmp = job.join("stdin_eof.tmp");
        std::fs::write(&tmp, total.to_string())?;
        std::fs::rename(&tmp, job.join("stdin_eof"))
    })
}

fn spawn_tail<W: Write + Send + 'static>(
    path: PathBuf,
    mut sink: W,
    stop: Arc<AtomicBool>,
) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        let mut source = File::open(&path)?;
        let mut buf = [0u8; 8192];
        loop {
            // Sample the flag before reading so the final drain sees all output.
            let stopping = stop.load(Ordering::SeqCst);
            match source.read(&mut buf) {
                Ok(0) if stopping => break,
                Ok(0) => thread::sleep(POLL_INTERVAL),
                Ok(n) => sink.write_all(&buf[..n])?,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        sink.flush()
    })
}

#[cfg(test)]
#[path = "shovel_tests.rs"]
mod tests;
