//! Work directory removal when the server is told to terminate.
//!
//! The driver escalates to SIGTERM when the server does not exit after its
//! stdin closes, typically because a backend operation hangs. The main
//! thread cannot be interrupted there, so termination signals are blocked in
//! every thread and picked up by a dedicated one with `sigwait`, which
//! removes every registered directory before exiting. Children spawned
//! through `std::process::Command` start with an empty signal mask.
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use tempfile::TempDir;

const SIGNALS: [libc::c_int; 3] = [libc::SIGTERM, libc::SIGINT, libc::SIGHUP];

static WORK_DIRS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

/// Route termination signals to a thread that cleans up and exits with
/// `128 + signal`. Call before spawning any other thread.
pub fn install() -> io::Result<()> {
    // SAFETY: sigset_t is plain data; sigemptyset initializes it.
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: `set` is a valid sigset_t for the calls below.
    unsafe {
        libc::sigemptyset(&mut set);
        for signal in SIGNALS {
            libc::sigaddset(&mut set, signal);
        }
    }
    // SAFETY: `set` is initialized and the old mask is not requested.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    thread::Builder::new()
        .name("termination".to_string())
        .spawn(move || {
            let mut signal: libc::c_int = 0;
            // SAFETY: `set` and `signal` outlive the call.
            while unsafe { libc::sigwait(&set, &mut signal) } != 0 {}
            tracing::warn!(signal, "terminated; removing work directories");
            remove_registered();
            std::process::exit(128 + signal);
        })?;
    Ok(())
}

fn remove_registered() {
    let dirs = match WORK_DIRS.lock() {
        Ok(mut dirs) => std::mem::take(&mut *dirs),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    for dir in dirs {
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %err, "cannot remove work directory");
            }
        }
    }
}

fn register(path: &Path) {
    if let Ok(mut dirs) = WORK_DIRS.lock() {
        dirs.push(path.to_path_buf());
    }
}

fn unregister(path: &Path) {
    if let Ok(mut dirs) = WORK_DIRS.lock() {
        dirs.retain(|dir| dir != path);
    }
}

#[cfg(test)]
fn is_registered(path: &Path) -> bool {
    WORK_DIRS
        .lock()
        .map(|dirs| dirs.iter().any(|dir| dir == path))
        .unwrap_or(false)
}

/// A temporary directory that is also removed if the server is terminated.
pub struct TrackedDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl TrackedDir {
    pub fn new(dir: TempDir) -> Self {
        let path = dir.path().to_path_buf();
        register(&path);
        TrackedDir {
            dir: Some(dir),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(mut self) -> io::Result<()> {
        unregister(&self.path);
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl Drop for TrackedDir {
    fn drop(&mut self) {
        unregister(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_dirs_register_until_closed() {
        let dir = TrackedDir::new(tempfile::tempdir().expect("tempdir"));
        let path = dir.path().to_path_buf();
        assert!(is_registered(&path));
        dir.close().expect("close");
        assert!(!is_registered(&path));
        assert!(!path.exists());
    }

    #[test]
    fn dropped_dirs_are_unregistered_and_removed() {
        let dir = TrackedDir::new(tempfile::tempdir().expect("tempdir"));
        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(!is_registered(&path));
        assert!(!path.exists());
    }
}
