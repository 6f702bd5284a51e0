//! Expect-style automation of a QEMU character device exposed as a unix
//! socket (serial consoles and the human monitor).
use crate::error::{TestbedError, TestbedResult};
use crate::util::{poll_until, truncate_bytes, POLL_INTERVAL};
use regex::bytes::Regex;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

/// Bytes of unmatched output kept for matching and error messages.
const BUFFER_LIMIT: usize = 64 * 1024;

pub struct Console {
    name: String,
    stream: UnixStream,
    buffer: Vec<u8>,
}

impl Console {
    /// Connect to `path`, waiting for QEMU to create the socket.
    pub fn connect(path: &Path, name: &str, timeout: Duration) -> TestbedResult<Self> {
        let stream = poll_until(timeout, || match UnixStream::connect(path) {
            Ok(stream) => Ok(Some(stream)),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        })?
        .ok_or_else(|| {
            TestbedError::BootFailure(format!(
                "{name} socket {} did not appear within {timeout:?}",
                path.display()
            ))
        })?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        tracing::debug!(console = name, "connected");
        Ok(Console {
            name: name.to_string(),
            stream,
            buffer: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&mut self, text: &str) -> TestbedResult<()> {
        tracing::debug!(console = %self.name, text = %text.trim_end(), "send");
        self.stream
            .write_all(text.as_bytes())
            .and_then(|_| self.stream.flush())
            .map_err(|err| TestbedError::ChannelLost(format!("write to {}: {err}", self.name)))
    }

    /// Wait until `pattern` matches the pending output. Output up to the end
    /// of the match is consumed and returned; `None` means `timeout` passed.
    pub fn expect(&mut self, pattern: &Regex, timeout: Duration) -> TestbedResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(found) = pattern.find(&self.buffer) {
                let end = found.end();
                let consumed: Vec<u8> = self.buffer.drain(..end).collect();
                tracing::debug!(console = %self.name, pattern = %pattern, "matched");
                return Ok(Some(consumed));
            }
            if Instant::now() >= deadline {
                tracing::debug!(
                    console = %self.name,
                    pattern = %pattern,
                    tail = %truncate_bytes(self.tail(), 512),
                    "no match before timeout"
                );
                return Ok(None);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(TestbedError::ChannelLost(format!(
                        "{} closed while waiting for `{pattern}`",
                        self.name
                    )))
                }
                Ok(n) => self.push(&chunk[..n]),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    return Err(TestbedError::ChannelLost(format!(
                        "read from {}: {err}",
                        self.name
                    )))
                }
            }
        }
    }

    /// Drop any output that arrived so far.
    pub fn clear(&mut self) -> TestbedResult<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(TestbedError::ChannelLost(format!("{} closed", self.name)))
                }
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    return Err(TestbedError::ChannelLost(format!(
                        "read from {}: {err}",
                        self.name
                    )))
                }
            }
        }
        self.buffer.clear();
        Ok(())
    }

    /// Most recent output, for error messages.
    pub fn tail(&self) -> &[u8] {
        let start = self.buffer.len().saturating_sub(512);
        &self.buffer[start..]
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > BUFFER_LIMIT {
            let excess = self.buffer.len() - BUFFER_LIMIT;
            self.buffer.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    fn pair(dir: &Path) -> (Console, UnixStream) {
        let path = dir.join("ttyS0");
        let listener = UnixListener::bind(&path).expect("bind");
        let console = Console::connect(&path, "ttyS0", Duration::from_secs(5)).expect("connect");
        let (peer, _) = listener.accept().expect("accept");
        (console, peer)
    }

    #[test]
    fn expect_matches_across_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut console, mut peer) = pair(dir.path());
        let writer = thread::spawn(move || {
            peer.write_all(b"Debian GNU/Linux\r\nvm lo").expect("write");
            thread::sleep(Duration::from_millis(120));
            peer.write_all(b"gin: ").expect("write");
            peer
        });
        let login = Regex::new(r"login:\s*").expect("regex");
        let seen = console
            .expect(&login, Duration::from_secs(5))
            .expect("expect")
            .expect("matched");
        assert!(seen.ends_with(b"login: "));
        drop(writer.join().expect("writer"));
    }

    #[test]
    fn expect_times_out_without_match() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut console, _peer) = pair(dir.path());
        let started = Instant::now();
        let never = Regex::new("never-printed").expect("regex");
        let result = console.expect(&never, Duration::from_millis(200)).expect("expect");
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn closed_peer_is_channel_lost() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut console, peer) = pair(dir.path());
        drop(peer);
        let pattern = Regex::new("x").expect("regex");
        assert!(matches!(
            console.expect(&pattern, Duration::from_secs(2)),
            Err(TestbedError::ChannelLost(_))
        ));
    }

    #[test]
    fn missing_socket_is_boot_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = Console::connect(&dir.path().join("absent"), "ttyS0", Duration::from_millis(150));
        assert!(matches!(result, Err(TestbedError::BootFailure(_))));
    }
}
