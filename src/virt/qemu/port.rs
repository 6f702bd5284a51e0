//! Free local port discovery shared between concurrent VM instances.
//!
//! Each candidate is guarded by an advisory lock file so two instances do
//! not settle on the same port; the lock is dropped as soon as the probe
//! has an answer.
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Directory holding the per-port lock files.
pub fn default_lock_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("reprocheck-ports")
}

/// First port in `base..base + range` nothing answers on, if any.
pub fn find_free_port(base: u16, range: u16, lock_dir: &Path) -> io::Result<Option<u16>> {
    std::fs::create_dir_all(lock_dir)?;
    for offset in 0..range {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        let lock_path = lock_dir.join(format!("port-{port}.lock"));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            tracing::debug!(port, "port lock held by another instance");
            continue;
        }
        let taken = port_in_use(port);
        let _ = lock.unlock();
        if taken {
            tracing::debug!(port, "port in use");
            continue;
        }
        return Ok(Some(port));
    }
    Ok(None)
}

fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}
