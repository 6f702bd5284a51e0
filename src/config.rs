//! Run settings: `.reprocheck.toml` merged with command-line arguments.
//!
//! Command-line values always win over the file.
use crate::cli::CheckArgs;
use crate::error::CheckError;
use crate::testbed::Timeouts;
use crate::variations::{Registry, Selection};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_NAME: &str = ".reprocheck.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub basics: Basics,
    #[serde(default)]
    pub timeouts: Option<Timeouts>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Basics {
    pub build_command: Option<String>,
    pub artifact: Option<String>,
    pub source_root: Option<PathBuf>,
    pub variations: Option<Vec<String>>,
    pub dont_vary: Option<Vec<String>>,
    pub verbosity: Option<u8>,
    pub testbed: Option<Vec<String>>,
    pub diff_tool: Option<Vec<String>>,
    pub store_dir: Option<PathBuf>,
}

/// Fully resolved settings for one check.
#[derive(Debug, Clone)]
pub struct Settings {
    pub source_root: PathBuf,
    pub build_command: String,
    pub artifact: String,
    pub selection: Selection,
    pub testbed: Vec<String>,
    pub virt_program: Option<PathBuf>,
    pub diff_tool: Option<Vec<String>>,
    pub store_dir: Option<PathBuf>,
    pub timeouts: Timeouts,
    pub verbosity: u8,
    pub json: bool,
}

pub fn load_file(path: &Path) -> Result<FileConfig> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let config: FileConfig =
        toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

/// The explicit config path, else the default file in the source root.
pub fn find_config(explicit: Option<&Path>, source_root: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let candidate = source_root.join(DEFAULT_CONFIG_NAME);
    candidate.is_file().then_some(candidate)
}

pub fn resolve(args: &CheckArgs, registry: &Registry) -> Result<Settings, CheckError> {
    let lookup_root = args.source_root.clone().unwrap_or_else(|| PathBuf::from("."));
    let file = match find_config(args.config.as_deref(), &lookup_root) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            load_file(&path).map_err(|err| CheckError::Config(format!("{err:#}")))?
        }
        None => FileConfig::default(),
    };
    merge(args, file, registry)
}

/// Variation names with blanks dropped, so `--variations ""` selects none.
fn name_list(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn merge(args: &CheckArgs, file: FileConfig, registry: &Registry) -> Result<Settings, CheckError> {
    let basics = file.basics;
    let source_root = args
        .source_root
        .clone()
        .or(basics.source_root)
        .unwrap_or_else(|| PathBuf::from("."));
    let build_command = args
        .build_command
        .clone()
        .or(basics.build_command)
        .ok_or_else(|| CheckError::Config("no build command given".to_string()))?;
    let artifact = args
        .artifact
        .clone()
        .or(basics.artifact)
        .ok_or_else(|| CheckError::Config("no artifact pattern given".to_string()))?;

    let selection = match (&args.variations, &args.dont_vary) {
        (Some(only), _) => Selection::Only(name_list(only)),
        (None, Some(except)) => Selection::Except(name_list(except)),
        (None, None) => match (basics.variations, basics.dont_vary) {
            (Some(_), Some(_)) => {
                return Err(CheckError::Config(
                    "`variations` and `dont_vary` are mutually exclusive".to_string(),
                ))
            }
            (Some(only), None) => Selection::Only(name_list(&only)),
            (None, Some(except)) => Selection::Except(name_list(&except)),
            (None, None) => Selection::All,
        },
    };
    match &selection {
        Selection::All => {}
        Selection::Only(names) | Selection::Except(names) => registry.validate_names(names)?,
    }

    let testbed = if args.testbed.is_empty() {
        basics.testbed.unwrap_or_else(|| vec!["null".to_string()])
    } else {
        args.testbed.clone()
    };
    if testbed.is_empty() {
        return Err(CheckError::Config("testbed command is empty".to_string()));
    }

    let diff_tool = match &args.diff_tool {
        Some(line) => Some(
            shell_words::split(line)
                .map_err(|err| CheckError::Config(format!("parse --diff-tool: {err}")))?,
        ),
        None => basics.diff_tool,
    };

    let mut timeouts = file.timeouts.unwrap_or_default();
    if let Some(secs) = args.build_timeout {
        timeouts.build_secs = secs;
    }

    let verbosity = if args.verbose > 0 {
        args.verbose
    } else {
        basics.verbosity.unwrap_or(0)
    };

    Ok(Settings {
        source_root,
        build_command,
        artifact,
        selection,
        testbed,
        virt_program: args.virt_program.clone(),
        diff_tool,
        store_dir: args.store_dir.clone().or(basics.store_dir),
        timeouts,
        verbosity,
        json: args.json,
    })
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
