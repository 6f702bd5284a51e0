//! Invocation contract of the external diff tool.
//!
//! The tool is run as `<tool> [options] <control-dir> <experiment-dir>`.
//! Exit 0 means identical, 1 means different; anything else (including a
//! signal) is a failure of the tool itself.
use crate::error::CheckError;
use crate::process::{self, OutputMode, RunError};
use crate::util::{format_command_line, truncate_bytes};
use serde::Serialize;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOutcome {
    Identical,
    Different,
}

#[derive(Debug, Clone)]
pub struct DiffReport {
    pub outcome: DiffOutcome,
    pub tool: Vec<String>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffTool {
    argv: Vec<String>,
}

impl DiffTool {
    /// Use the configured tool, else `diffoscope`, else `diff -r`.
    pub fn resolve(configured: Option<&[String]>) -> Result<Self, CheckError> {
        if let Some(argv) = configured {
            let Some(program) = argv.first() else {
                return Err(CheckError::Config("diff tool command is empty".to_string()));
            };
            which::which(program).map_err(|_| {
                CheckError::DiffToolFailure(format!("diff tool `{program}` not found"))
            })?;
            return Ok(DiffTool {
                argv: argv.to_vec(),
            });
        }
        if which::which("diffoscope").is_ok() {
            return Ok(DiffTool {
                argv: vec!["diffoscope".to_string()],
            });
        }
        if which::which("diff").is_ok() {
            tracing::warn!("diffoscope not found; falling back to `diff -r`");
            return Ok(DiffTool {
                argv: vec!["diff".to_string(), "-r".to_string()],
            });
        }
        Err(CheckError::DiffToolFailure(
            "neither diffoscope nor diff is available".to_string(),
        ))
    }

    pub fn compare(
        &self,
        control: &Path,
        experiment: &Path,
        timeout: Duration,
    ) -> Result<DiffReport, CheckError> {
        let mut argv = self.argv.clone();
        argv.push(control.display().to_string());
        argv.push(experiment.display().to_string());
        tracing::info!(command = %format_command_line(&argv), "running diff tool");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        let out = process::run_with_deadline(&mut cmd, None, OutputMode::Capture, timeout)
            .map_err(|err| match err {
                RunError::TimedOut => {
                    CheckError::DiffToolFailure(format!("timed out after {timeout:?}"))
                }
                RunError::Spawn(err) | RunError::Wait(err) => {
                    CheckError::DiffToolFailure(format!("run {}: {err}", argv[0]))
                }
            })?;
        let outcome = classify(out.exit_code).ok_or_else(|| {
            CheckError::DiffToolFailure(format!(
                "{} exited with status {}: {}",
                argv[0],
                out.exit_code,
                truncate_bytes(&out.stderr, 4096).trim()
            ))
        })?;
        Ok(DiffReport {
            outcome,
            tool: self.argv.clone(),
            output: String::from_utf8_lossy(&out.stdout).into_owned(),
        })
    }
}

pub fn classify(exit_code: i32) -> Option<DiffOutcome> {
    match exit_code {
        0 => Some(DiffOutcome::Identical),
        1 => Some(DiffOutcome::Different),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(script: &str) -> DiffTool {
        DiffTool {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string(), "difftool".to_string()],
        }
    }

    #[test]
    fn exit_codes_map_to_outcomes() {
        assert_eq!(classify(0), Some(DiffOutcome::Identical));
        assert_eq!(classify(1), Some(DiffOutcome::Different));
        assert_eq!(classify(2), None);
        assert_eq!(classify(137), None);
    }

    #[test]
    fn control_then_experiment_are_appended() {
        let report = tool("echo \"$1|$2\"; exit 1")
            .compare(Path::new("/s/control"), Path::new("/s/experiment"), Duration::from_secs(10))
            .expect("compare");
        assert_eq!(report.outcome, DiffOutcome::Different);
        assert_eq!(report.output.trim(), "/s/control|/s/experiment");
    }

    #[test]
    fn tool_errors_are_not_differences() {
        let err = tool("echo broken >&2; exit 2")
            .compare(Path::new("/a"), Path::new("/b"), Duration::from_secs(10))
            .expect_err("status 2");
        assert!(matches!(err, CheckError::DiffToolFailure(msg) if msg.contains("broken")));
    }

    #[test]
    fn configured_tool_must_exist() {
        let argv = vec!["reprocheck-no-such-diff-tool".to_string()];
        assert!(matches!(
            DiffTool::resolve(Some(&argv)),
            Err(CheckError::DiffToolFailure(_))
        ));
        assert!(matches!(DiffTool::resolve(Some(&[])), Err(CheckError::Config(_))));
    }
}
