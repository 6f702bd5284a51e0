//! Two-pass build orchestration.
//!
//! One testbed session per check: open, build the control pass, revert (or
//! close and reopen when the backend cannot revert), build the experiment
//! pass, then compare the two artifact sets with the diff tool. The testbed
//! is shut down on every exit path because [`Testbed`] cleans up on drop.
//!
//! Both passes build under the same build root, so only the `build_path`
//! variation changes where the build happens.
use crate::artifacts::{self, ArtifactSet};
use crate::config::Settings;
use crate::diff::{DiffOutcome, DiffTool};
use crate::error::{CheckError, TestbedError};
use crate::process::OutputMode;
use crate::testbed::{CommandKind, EnvOverrides, ExecRequest, Testbed};
use crate::util::truncate_bytes;
use crate::variations::{BuildPass, Registry, Role, Skipped, VariationContext};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Name of the backend server binary.
pub const VIRT_PROGRAM: &str = "reprocheck-virt";

/// Host and testbed directory holding the per-check build root.
const BUILD_ROOT_PARENT: &str = "/tmp";

/// Optional tools probed inside the testbed; each found one becomes a
/// `tool:<name>` capability.
pub const PROBED_TOOLS: [&str; 5] = ["faketime", "disorderfs", "setarch", "unshare", "sudo"];

/// Final result of a check that ran both passes.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub verdict: DiffOutcome,
    pub applied: Vec<&'static str>,
    pub skipped: Vec<Skipped>,
    pub reverted: bool,
    pub control: BTreeMap<String, String>,
    pub experiment: BTreeMap<String, String>,
    pub diff_tool: Vec<String>,
    pub diff_output: String,
    /// Set only when the artifacts were kept.
    pub store_dir: Option<PathBuf>,
}

impl CheckReport {
    pub fn is_reproducible(&self) -> bool {
        self.verdict == DiffOutcome::Identical
    }
}

/// Facts gathered once right after `open`.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    pub tool_caps: Vec<String>,
    pub arch: String,
}

/// Parse the probe script output: `tool:<name>` lines and one `arch:<m>`.
pub fn parse_probe(stdout: &str) -> Probe {
    let mut probe = Probe::default();
    for line in stdout.lines().map(str::trim) {
        if let Some(tool) = line.strip_prefix("tool:") {
            if PROBED_TOOLS.contains(&tool) {
                probe.tool_caps.push(format!("tool:{tool}"));
            }
        } else if let Some(arch) = line.strip_prefix("arch:") {
            probe.arch = arch.to_string();
        }
    }
    probe
}

fn probe_script() -> String {
    format!(
        "for t in {}; do if command -v \"$t\" >/dev/null 2>&1; then echo \"tool:$t\"; fi; done; echo \"arch:$(uname -m)\"",
        PROBED_TOOLS.join(" ")
    )
}

/// Locate the backend server: explicit path, sibling of this executable,
/// then `PATH`.
pub fn virt_program(explicit: Option<&Path>) -> Result<PathBuf, CheckError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name(VIRT_PROGRAM);
        if sibling.is_file() {
            return Ok(sibling);
        }
    }
    which::which(VIRT_PROGRAM)
        .map_err(|_| CheckError::Config(format!("cannot find {VIRT_PROGRAM}; use --virt-program")))
}

/// Where copied-up artifacts live for the duration of the check.
enum Store {
    Kept(PathBuf),
    Temporary(TempDir),
}

impl Store {
    fn path(&self) -> &Path {
        match self {
            Store::Kept(path) => path,
            Store::Temporary(dir) => dir.path(),
        }
    }
}

pub struct Orchestrator<'a> {
    settings: &'a Settings,
    registry: Registry,
}

impl<'a> Orchestrator<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Orchestrator {
            settings,
            registry: Registry::builtin(),
        }
    }

    pub fn run(&self) -> Result<CheckReport, CheckError> {
        let settings = self.settings;
        let source = std::fs::canonicalize(&settings.source_root).map_err(|err| {
            CheckError::Config(format!("source root {}: {err}", settings.source_root.display()))
        })?;
        let diff_tool = DiffTool::resolve(settings.diff_tool.as_deref())?;
        let store = match &settings.store_dir {
            Some(dir) => {
                for role in Role::BOTH {
                    let stale = dir.join(role.as_str());
                    if stale.exists() {
                        std::fs::remove_dir_all(&stale).map_err(|err| {
                            CheckError::Config(format!("clear {}: {err}", stale.display()))
                        })?;
                    }
                }
                Store::Kept(dir.clone())
            }
            None => Store::Temporary(
                tempfile::Builder::new()
                    .prefix("reprocheck-store.")
                    .tempdir()
                    .map_err(TestbedError::Io)?,
            ),
        };

        let mut backend = vec![virt_program(settings.virt_program.as_deref())?
            .display()
            .to_string()];
        backend.extend(settings.testbed.iter().cloned());
        let mut testbed = Testbed::start(&backend, settings.timeouts)?;
        testbed.open()?;

        let probe = self.probe(&mut testbed)?;
        let mut caps = testbed.capabilities().to_vec();
        caps.extend(probe.tool_caps.iter().cloned());
        tracing::debug!(caps = ?caps, arch = %probe.arch, "testbed facts");

        let resolution = self.registry.resolve(&settings.selection, &caps)?;
        let applied = resolution.active_names();
        tracing::info!(variations = ?applied, "resolved variations");
        let ctx = VariationContext {
            arch: probe.arch.clone(),
            suggested_user: testbed
                .capability_value("suggested-normal-user")
                .map(str::to_string),
        };

        // The name is reserved on the host; inside the testbed the same path
        // is recreated for every pass.
        let build_root = tempfile::Builder::new()
            .prefix("reprocheck-build.")
            .tempdir_in(BUILD_ROOT_PARENT)
            .map_err(TestbedError::Io)?;
        let root = build_root.path().display().to_string();

        let mut sets: Vec<ArtifactSet> = Vec::with_capacity(2);
        let mut reverted = false;
        for role in Role::BOTH {
            if role == Role::Experiment {
                reverted = reset(&mut testbed)?;
            }
            let pass = resolution.build_pass(role, &ctx, &settings.build_command, &root);
            prepare_root(&mut testbed, &root)?;
            let collected = self
                .run_pass(&mut testbed, &source, &root, &pass)
                .and_then(|()| {
                    artifacts::collect(
                        &mut testbed,
                        role,
                        &pass.build_dir,
                        &settings.artifact,
                        store.path(),
                    )
                });
            remove_root(&mut testbed, &root);
            sets.push(collected?);
        }
        testbed.stop();

        let (control, experiment) = (&sets[0], &sets[1]);
        let diff = diff_tool.compare(
            &control.root,
            &experiment.root,
            settings.timeouts.for_kind(CommandKind::Build),
        )?;
        if diff.outcome == DiffOutcome::Identical && !control.same_content(experiment) {
            tracing::warn!("diff tool reported identical artifacts with different digests");
        }
        Ok(CheckReport {
            verdict: diff.outcome,
            applied,
            skipped: resolution.skipped.clone(),
            reverted,
            control: control.digests(),
            experiment: experiment.digests(),
            diff_tool: diff.tool,
            diff_output: diff.output,
            store_dir: match &store {
                Store::Kept(path) => Some(path.clone()),
                Store::Temporary(_) => None,
            },
        })
    }

    fn probe(&self, testbed: &mut Testbed) -> Result<Probe, CheckError> {
        let argv = vec!["sh".to_string(), "-c".to_string(), probe_script()];
        let stdout = testbed.check_exec(&argv)?;
        Ok(parse_probe(&stdout))
    }

    /// Stage the source, run hooks and the build for one pass.
    fn run_pass(
        &self,
        testbed: &mut Testbed,
        source: &Path,
        root: &str,
        pass: &BuildPass,
    ) -> Result<(), CheckError> {
        tracing::info!(role = %pass.role, build_dir = %pass.build_dir, "starting pass");
        testbed.copydown(
            &format!("{}/", source.display()),
            &format!("{}/", pass.build_dir),
        )?;
        for hook in &pass.pre_build {
            run_hook(testbed, hook, root, &pass.build_dir)?;
        }

        let out = testbed.execute(&ExecRequest {
            argv: &pass.argv,
            env: &pass.env,
            cwd: Some(&pass.build_dir),
            stdin: None,
            kind: CommandKind::Build,
            output: OutputMode::Capture,
        });

        // Undo hooks even when the build failed, so mounts do not linger.
        for hook in &pass.post_build {
            if let Err(err) = run_hook(testbed, hook, root, &pass.build_dir) {
                tracing::warn!(role = %pass.role, error = %err, "post-build hook failed");
            }
        }
        let out = out?;
        tracing::debug!(
            role = %pass.role,
            stdout = %truncate_bytes(&out.stdout, 4096),
            stderr = %truncate_bytes(&out.stderr, 4096),
            "build output"
        );
        if out.exit_code != 0 {
            tracing::error!(
                role = %pass.role,
                status = out.exit_code,
                stderr = %truncate_bytes(&out.stderr, 4096).trim(),
                "build failed"
            );
            return Err(CheckError::BuildFailure {
                role: pass.role,
                exit_code: out.exit_code,
            });
        }
        Ok(())
    }
}

/// Bring the testbed back to a pristine state. Returns whether an in-place
/// revert was used rather than a fresh session.
fn reset(testbed: &mut Testbed) -> Result<bool, CheckError> {
    match testbed.revert() {
        Ok(()) => Ok(true),
        Err(TestbedError::RevertUnsupported) => {
            tracing::info!("testbed cannot revert; closing and reopening");
            testbed.close()?;
            testbed.open()?;
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

/// Create an empty build root in the testbed, readable by every user.
fn prepare_root(testbed: &mut Testbed, root: &str) -> Result<(), CheckError> {
    let argv = vec![
        "sh".to_string(),
        "-ec".to_string(),
        "rm -rf \"$1\"; mkdir -p \"$1\"; chmod 755 \"$1\"".to_string(),
        "sh".to_string(),
        root.to_string(),
    ];
    testbed.check_exec(&argv)?;
    Ok(())
}

/// Best effort: a poisoned session is torn down by the backend anyway.
fn remove_root(testbed: &mut Testbed, root: &str) {
    if testbed.is_poisoned() {
        return;
    }
    let argv = vec!["rm".to_string(), "-rf".to_string(), root.to_string()];
    if let Err(err) = testbed.check_exec(&argv) {
        tracing::warn!(root, error = %err, "cannot remove build root");
    }
}

/// Hooks run as `sh -ec <script> sh <build_dir>` from the build root.
fn run_hook(
    testbed: &mut Testbed,
    script: &str,
    root: &str,
    build_dir: &str,
) -> Result<(), CheckError> {
    let argv = vec![
        "sh".to_string(),
        "-ec".to_string(),
        script.to_string(),
        "sh".to_string(),
        build_dir.to_string(),
    ];
    let env = EnvOverrides::new();
    let out = testbed.execute(&ExecRequest {
        argv: &argv,
        env: &env,
        cwd: Some(root),
        stdin: None,
        kind: CommandKind::Short,
        output: OutputMode::Capture,
    })?;
    if out.exit_code != 0 {
        return Err(CheckError::Testbed(TestbedError::Backend(format!(
            "hook `{script}` failed with status {}: {}",
            out.exit_code,
            truncate_bytes(&out.stderr, 2048).trim()
        ))));
    }
    Ok(())
}
