//! QEMU human monitor (HMP) client.
use super::console::Console;
use crate::error::{TestbedError, TestbedResult};
use regex::bytes::Regex;
use std::path::Path;
use std::time::Duration;

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Device id given to the hot-attached base image.
pub const BASEIMAGE_DEVICE: &str = "virtio-baseimage";
const BASEIMAGE_DRIVE: &str = "drive-baseimage";

pub struct Monitor {
    console: Console,
    prompt: Regex,
}

impl Monitor {
    pub fn connect(path: &Path, timeout: Duration) -> TestbedResult<Self> {
        let console = Console::connect(path, "monitor", timeout)?;
        let mut monitor = Monitor {
            console,
            prompt: Regex::new(r"\(qemu\) ").expect("regex for monitor prompt"),
        };
        monitor.wait_prompt()?;
        Ok(monitor)
    }

    /// Run one monitor command and return what it printed.
    pub fn command(&mut self, line: &str) -> TestbedResult<String> {
        self.console.send(&format!("{line}\n"))?;
        let output = self.wait_prompt()?;
        // The monitor echoes the command line first.
        let output = output
            .split_once('\n')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();
        let output = output
            .trim_end_matches("(qemu) ")
            .replace('\r', "")
            .trim()
            .to_string();
        if looks_like_error(&output) {
            return Err(TestbedError::ChannelLost(format!(
                "monitor rejected `{line}`: {output}"
            )));
        }
        Ok(output)
    }

    /// Attach `image` as a read-only virtio disk with serial `BOOTIMAGE`.
    pub fn attach_baseimage(&mut self, image: &Path, format: &str) -> TestbedResult<()> {
        self.command(&format!(
            "drive_add 0 file={},if=none,readonly=on,serial=BOOTIMAGE,id={BASEIMAGE_DRIVE},format={format}",
            image.display()
        ))?;
        self.command(&format!(
            "device_add virtio-blk-pci,drive={BASEIMAGE_DRIVE},id={BASEIMAGE_DEVICE}"
        ))?;
        Ok(())
    }

    /// Remove the base image disk; it would duplicate the boot disk UUIDs
    /// on the next boot.
    pub fn detach_baseimage(&mut self) -> TestbedResult<()> {
        self.command(&format!("device_del {BASEIMAGE_DEVICE}"))?;
        Ok(())
    }

    fn wait_prompt(&mut self) -> TestbedResult<String> {
        match self.console.expect(&self.prompt, REPLY_TIMEOUT)? {
            Some(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            None => Err(TestbedError::ChannelLost(
                "monitor did not show its prompt".to_string(),
            )),
        }
    }
}

fn looks_like_error(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    ["error", "could not", "unknown command", "invalid"]
        .iter()
        .any(|needle| lower.contains(needle))
}
