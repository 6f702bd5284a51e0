//! Shared test infrastructure for integration tests.
// Each integration test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub fn reprocheck_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_reprocheck"))
}

pub fn virt_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_reprocheck-virt"))
}

/// Print a skip notice when `tool` is not on PATH.
pub fn skip_if_missing(tool: &str) -> bool {
    if which::which(tool).is_err() {
        eprintln!("Skipping: {tool} not available");
        return true;
    }
    false
}

/// A source tree with a Makefile-free build: everything is in the command.
pub struct SourceTree {
    pub dir: TempDir,
}

impl SourceTree {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create source tree");
        std::fs::write(dir.path().join("input.txt"), "hello\n").expect("write input");
        SourceTree { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run a check against the null testbed, comparing with `diff -r`.
    pub fn check(&self, build: &str, artifact: &str, extra: &[&str]) -> Output {
        let mut cmd = Command::new(reprocheck_bin());
        cmd.arg("--virt-program")
            .arg(virt_bin())
            .args(["--diff-tool", "diff -r"])
            .args(extra)
            .arg(self.path())
            .arg(build)
            .arg(artifact)
            .args(["--", "null"]);
        cmd.output().expect("run reprocheck")
    }
}

pub fn status(output: &Output) -> i32 {
    output.status.code().unwrap_or(-1)
}

pub fn describe(output: &Output) -> String {
    format!(
        "status {:?}\nstdout:\n{}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}
