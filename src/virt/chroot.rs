//! Backend that runs commands under `chroot(8)` into a prepared tree.
//!
//! The tree is not restored between sessions, so `revert` is not offered.
use super::null::running_as_root;
use super::termination::TrackedDir;
use super::Backend;
use crate::error::{TestbedError, TestbedResult};
use std::path::PathBuf;

pub struct ChrootBackend {
    root: PathBuf,
    scratch: Option<TrackedDir>,
}

impl ChrootBackend {
    pub fn new(root: PathBuf) -> Self {
        ChrootBackend {
            root,
            scratch: None,
        }
    }

    fn guest_path(&self, dir: &TrackedDir) -> String {
        let relative = dir.path().strip_prefix(&self.root).unwrap_or(dir.path());
        format!("/{}", relative.display())
    }
}

impl Backend for ChrootBackend {
    fn name(&self) -> &'static str {
        "chroot"
    }

    fn open(&mut self) -> TestbedResult<String> {
        if !self.root.join("bin/sh").exists() {
            return Err(TestbedError::BootFailure(format!(
                "{} has no /bin/sh; not a usable chroot",
                self.root.display()
            )));
        }
        let tmp = self.root.join("tmp");
        std::fs::create_dir_all(&tmp)?;
        let dir = TrackedDir::new(
            tempfile::Builder::new()
                .prefix("reprocheck.")
                .tempdir_in(&tmp)?,
        );
        let guest = self.guest_path(&dir);
        self.scratch = Some(dir);
        Ok(guest)
    }

    fn capabilities(&self) -> Vec<String> {
        let mut caps = Vec::new();
        if let Some(dir) = &self.scratch {
            caps.push(format!("downtmp-host={}", dir.path().display()));
        }
        if running_as_root() {
            caps.push("root-on-testbed".to_string());
        }
        caps
    }

    fn execute_prefix(&self) -> Vec<String> {
        vec!["chroot".to_string(), self.root.display().to_string()]
    }

    fn cleanup(&mut self) -> TestbedResult<()> {
        if let Some(dir) = self.scratch.take() {
            let path = dir.path().display().to_string();
            dir.close()
                .map_err(|err| TestbedError::Backend(format!("remove {path}: {err}")))?;
        }
        Ok(())
    }
}
