//! Variation registry.
//!
//! Each variation describes how the control and the experiment pass differ
//! along one dimension of the build environment. The active variations are
//! folded, in declaration order, into a [`BuildPass`] per role.
use crate::error::{CheckError, TestbedError};
use crate::testbed::{env_argv, EnvOverrides};
use serde::Serialize;
use std::fmt;

/// Which of the two builds a projection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Control,
    Experiment,
}

impl Role {
    pub const BOTH: [Role; 2] = [Role::Control, Role::Experiment];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Control => "control",
            Role::Experiment => "experiment",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about the opened testbed that projections may depend on.
#[derive(Debug, Clone, Default)]
pub struct VariationContext {
    pub arch: String,
    pub suggested_user: Option<String>,
}

/// One variation's contribution to a pass.
///
/// Hooks are `sh -ec` scripts run inside the testbed from the build root,
/// with the build directory as `$1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub env: EnvOverrides,
    /// Wrappers that need the testbed's privileges; applied outermost. The
    /// pass environment is applied again inside them, since wrappers such as
    /// `sudo` reset variables like `PATH`.
    pub outer_prefix: Vec<String>,
    pub exec_prefix: Vec<String>,
    pub build_dir: Option<String>,
    pub pre_build: Vec<String>,
    pub post_build: Vec<String>,
}

impl Projection {
    fn with_env(pairs: &[(&str, Option<&str>)]) -> Self {
        let env = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.map(str::to_string)))
            .collect();
        Projection {
            env,
            ..Projection::default()
        }
    }
}

pub trait Variation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capabilities the testbed must advertise for the experiment projection.
    fn required_capabilities(&self) -> &'static [&'static str] {
        &[]
    }

    fn project(&self, role: Role, ctx: &VariationContext) -> Projection;
}

/// Base PATH both passes start from.
pub const BASE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
/// Build directory name under the build root unless overridden.
pub const DEFAULT_BUILD_DIR: &str = "build";

struct Environment;

impl Variation for Environment {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        match role {
            Role::Control => Projection::with_env(&[("CAPTURE_ENVIRONMENT", None)]),
            Role::Experiment => Projection::with_env(&[(
                "CAPTURE_ENVIRONMENT",
                Some("i_capture_the_environment"),
            )]),
        }
    }
}

struct BuildPath;

impl Variation for BuildPath {
    fn name(&self) -> &'static str {
        "build_path"
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        Projection {
            build_dir: Some(match role {
                Role::Control => DEFAULT_BUILD_DIR.to_string(),
                Role::Experiment => "build-experiment".to_string(),
            }),
            ..Projection::default()
        }
    }
}

struct Kernel;

impl Variation for Kernel {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["tool:setarch"]
    }

    fn project(&self, role: Role, ctx: &VariationContext) -> Projection {
        match role {
            Role::Control => Projection::default(),
            Role::Experiment => Projection {
                exec_prefix: vec![
                    "setarch".to_string(),
                    ctx.arch.clone(),
                    "--uname-2.6".to_string(),
                ],
                ..Projection::default()
            },
        }
    }
}

struct FileOrdering;

impl Variation for FileOrdering {
    fn name(&self) -> &'static str {
        "fileordering"
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["tool:disorderfs"]
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        match role {
            Role::Control => Projection::default(),
            Role::Experiment => Projection {
                pre_build: vec![
                    "mv \"$1\" \"$1.orig\"; mkdir \"$1\"; disorderfs --shuffle-dirents=yes \"$1.orig\" \"$1\""
                        .to_string(),
                ],
                post_build: vec![
                    "fusermount -u \"$1\"; rmdir \"$1\"; mv \"$1.orig\" \"$1\"".to_string(),
                ],
                ..Projection::default()
            },
        }
    }
}

struct Home;

impl Variation for Home {
    fn name(&self) -> &'static str {
        "home"
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        let home = match role {
            Role::Control => "/nonexistent/first-build",
            Role::Experiment => "/nonexistent/second-build",
        };
        Projection::with_env(&[("HOME", Some(home))])
    }
}

struct Locales;

impl Variation for Locales {
    fn name(&self) -> &'static str {
        "locales"
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        match role {
            Role::Control => Projection::with_env(&[
                ("LANG", Some("C.UTF-8")),
                ("LANGUAGE", Some("en_US:en")),
                ("LC_ALL", None),
            ]),
            Role::Experiment => Projection::with_env(&[
                ("LANG", Some("fr_CH.UTF-8")),
                ("LANGUAGE", Some("fr_CH:fr")),
                ("LC_ALL", Some("fr_CH.UTF-8")),
            ]),
        }
    }
}

struct ExecPath;

impl Variation for ExecPath {
    fn name(&self) -> &'static str {
        "exec_path"
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        let path = match role {
            Role::Control => BASE_PATH.to_string(),
            Role::Experiment => format!("{BASE_PATH}:/i_capture_the_path"),
        };
        Projection::with_env(&[("PATH", Some(path.as_str()))])
    }
}

struct Time;

impl Variation for Time {
    fn name(&self) -> &'static str {
        "time"
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["tool:faketime"]
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        match role {
            Role::Control => Projection::default(),
            Role::Experiment => Projection {
                exec_prefix: vec!["faketime".to_string(), "+373days".to_string()],
                ..Projection::default()
            },
        }
    }
}

struct Timezone;

impl Variation for Timezone {
    fn name(&self) -> &'static str {
        "timezone"
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        let tz = match role {
            Role::Control => "GMT+12",
            Role::Experiment => "GMT-14",
        };
        Projection::with_env(&[("TZ", Some(tz))])
    }
}

struct Umask;

impl Variation for Umask {
    fn name(&self) -> &'static str {
        "umask"
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        let mask = match role {
            Role::Control => "0022",
            Role::Experiment => "0002",
        };
        Projection {
            exec_prefix: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("umask {mask}; exec \"$@\""),
                "sh".to_string(),
            ],
            ..Projection::default()
        }
    }
}

struct DomainHost;

impl Variation for DomainHost {
    fn name(&self) -> &'static str {
        "domain_host"
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["root-on-testbed", "tool:unshare"]
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        match role {
            Role::Control => Projection::default(),
            Role::Experiment => Projection {
                outer_prefix: vec![
                    "unshare".to_string(),
                    "--uts".to_string(),
                    "--".to_string(),
                    "sh".to_string(),
                    "-c".to_string(),
                    "hostname i-capture-the-hostname; domainname i-capture-the-domain; exec \"$@\""
                        .to_string(),
                    "sh".to_string(),
                ],
                ..Projection::default()
            },
        }
    }
}

struct UserGroup;

impl Variation for UserGroup {
    fn name(&self) -> &'static str {
        "user_group"
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["root-on-testbed", "suggested-normal-user", "tool:sudo"]
    }

    fn project(&self, role: Role, ctx: &VariationContext) -> Projection {
        let (Role::Experiment, Some(user)) = (role, ctx.suggested_user.as_deref()) else {
            return Projection::default();
        };
        Projection {
            outer_prefix: vec![
                "sudo".to_string(),
                "-E".to_string(),
                "-u".to_string(),
                user.to_string(),
                "--".to_string(),
            ],
            pre_build: vec![format!("chown -R {user} \"$1\"")],
            ..Projection::default()
        }
    }
}

struct Shell;

impl Variation for Shell {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn project(&self, role: Role, _ctx: &VariationContext) -> Projection {
        let shell = match role {
            Role::Control => "/bin/sh",
            Role::Experiment => "/bin/bash",
        };
        Projection::with_env(&[("SHELL", Some(shell))])
    }
}

/// How the user picked variations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Only(Vec<String>),
    Except(Vec<String>),
}

impl Selection {
    pub fn includes(&self, name: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Only(names) => names.iter().any(|n| n == name),
            Selection::Except(names) => !names.iter().any(|n| n == name),
        }
    }
}

/// A variation left out because the testbed cannot support it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub name: &'static str,
    pub missing: String,
}

/// Everything needed to run one pass, fixed before the pass starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPass {
    pub role: Role,
    pub env: EnvOverrides,
    pub argv: Vec<String>,
    pub build_dir: String,
    pub pre_build: Vec<String>,
    pub post_build: Vec<String>,
}

pub struct Registry {
    variations: Vec<Box<dyn Variation>>,
}

impl Registry {
    pub fn builtin() -> Self {
        Registry {
            variations: vec![
                Box::new(Environment),
                Box::new(BuildPath),
                Box::new(Kernel),
                Box::new(FileOrdering),
                Box::new(Home),
                Box::new(Locales),
                Box::new(ExecPath),
                Box::new(Time),
                Box::new(Timezone),
                Box::new(Umask),
                Box::new(DomainHost),
                Box::new(UserGroup),
                Box::new(Shell),
            ],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.variations.iter().map(|v| v.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Variation> {
        self.variations
            .iter()
            .find(|v| v.name() == name)
            .map(|v| v.as_ref())
    }

    /// Reject names that are not registered.
    pub fn validate_names(&self, names: &[String]) -> Result<(), CheckError> {
        let unknown: Vec<&str> = names
            .iter()
            .filter(|name| self.get(name).is_none())
            .map(String::as_str)
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        Err(CheckError::Config(format!(
            "unknown variation(s): {} (known: {})",
            unknown.join(", "),
            self.names().join(", ")
        )))
    }

    /// Pick the active variations for a testbed with `caps`.
    ///
    /// A variation the user named explicitly fails hard when a capability
    /// is missing; one enabled by default is skipped with a warning.
    pub fn resolve(&self, selection: &Selection, caps: &[String]) -> Result<Resolution<'_>, CheckError> {
        match selection {
            Selection::All => {}
            Selection::Only(names) | Selection::Except(names) => self.validate_names(names)?,
        }
        let explicit = matches!(selection, Selection::Only(_));
        let mut active = Vec::new();
        let mut skipped = Vec::new();
        for variation in &self.variations {
            if !selection.includes(variation.name()) {
                continue;
            }
            let missing = variation
                .required_capabilities()
                .iter()
                .find(|cap| !has_capability(caps, cap));
            match missing {
                None => active.push(variation.as_ref()),
                Some(cap) if explicit => {
                    return Err(CheckError::Testbed(TestbedError::CapabilityMissing {
                        capability: cap.to_string(),
                        needed_by: format!("variation `{}`", variation.name()),
                    }))
                }
                Some(cap) => {
                    tracing::warn!(
                        variation = variation.name(),
                        capability = *cap,
                        "testbed lacks capability; skipping variation"
                    );
                    skipped.push(Skipped {
                        name: variation.name(),
                        missing: cap.to_string(),
                    });
                }
            }
        }
        Ok(Resolution { active, skipped })
    }
}

/// `name` matches a bare capability or the key of a `name=value` one.
fn has_capability(caps: &[String], name: &str) -> bool {
    caps.iter()
        .any(|cap| cap == name || cap.split_once('=').is_some_and(|(key, _)| key == name))
}

pub struct Resolution<'a> {
    active: Vec<&'a dyn Variation>,
    pub skipped: Vec<Skipped>,
}

impl Resolution<'_> {
    pub fn active_names(&self) -> Vec<&'static str> {
        self.active.iter().map(|v| v.name()).collect()
    }

    /// Fold every active projection for `role` into one pass building under
    /// `root`, a directory both passes share.
    pub fn build_pass(
        &self,
        role: Role,
        ctx: &VariationContext,
        build_command: &str,
        root: &str,
    ) -> BuildPass {
        let mut env = EnvOverrides::new();
        let mut outer = Vec::new();
        let mut inner = Vec::new();
        let mut build_dir = DEFAULT_BUILD_DIR.to_string();
        let mut pre_build = Vec::new();
        let mut post_build = Vec::new();
        for variation in &self.active {
            let projection = variation.project(role, ctx);
            if is_noop(*variation, ctx) {
                tracing::warn!(variation = variation.name(), "variation changes nothing");
            }
            env.extend(projection.env);
            outer.extend(projection.outer_prefix);
            inner.extend(projection.exec_prefix);
            if let Some(dir) = projection.build_dir {
                build_dir = dir;
            }
            pre_build.extend(projection.pre_build);
            // Undo in reverse order of setup.
            post_build.splice(0..0, projection.post_build);
        }
        let wrapped = !outer.is_empty();
        let mut argv = outer;
        if wrapped {
            argv.extend(env_argv(&env));
        }
        argv.extend(inner);
        argv.extend([
            "sh".to_string(),
            "-ec".to_string(),
            build_command.to_string(),
        ]);
        BuildPass {
            role,
            env,
            argv,
            build_dir: format!("{}/{build_dir}", root.trim_end_matches('/')),
            pre_build,
            post_build,
        }
    }
}

/// Whether a variation projects the same thing for both roles.
pub fn is_noop(variation: &dyn Variation, ctx: &VariationContext) -> bool {
    variation.project(Role::Control, ctx) == variation.project(Role::Experiment, ctx)
}
