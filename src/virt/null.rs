//! Backend without isolation: commands run directly on the host.
use super::termination::TrackedDir;
use super::Backend;
use crate::error::{TestbedError, TestbedResult};

#[derive(Default)]
pub struct NullBackend {
    scratch: Option<TrackedDir>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn open(&mut self) -> TestbedResult<String> {
        let dir = TrackedDir::new(tempfile::Builder::new().prefix("reprocheck.").tempdir()?);
        let path = dir.path().display().to_string();
        self.scratch = Some(dir);
        Ok(path)
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
        Vec::new()
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
