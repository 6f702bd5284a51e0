//! Error taxonomy shared by the testbed driver, the backends and the
//! orchestrator.
//!
//! Session-fatal faults poison the testbed they came from: the caller must
//! clean up and abort instead of retrying on the same session.
use std::time::Duration;

use crate::variations::Role;

/// Exit status: both builds produced identical artifacts.
pub const EXIT_REPRODUCIBLE: i32 = 0;
/// Exit status: the diff tool found a difference between the passes.
pub const EXIT_DIFFERENT: i32 = 1;
/// Exit status: invalid arguments or configuration (clap uses the same value).
pub const EXIT_USAGE: i32 = 2;
/// Exit status: the build command failed or produced no artifact.
pub const EXIT_BUILD_FAILURE: i32 = 3;
/// Exit status: the testbed could not be driven.
pub const EXIT_TESTBED_FAILURE: i32 = 4;
/// Exit status: the diff tool itself failed.
pub const EXIT_DIFF_TOOL_FAILURE: i32 = 5;

/// Exit status reported by an execute prefix when the command timed out.
pub const AUX_EXIT_TIMEOUT: i32 = 254;
/// Exit status reported by an execute prefix when the bridge failed.
pub const AUX_EXIT_BRIDGE_FAILURE: i32 = 255;
/// Remote 255 is reported as this value so it cannot be mistaken for a
/// bridge failure.
pub const AUX_EXIT_REMAPPED_255: i32 = 253;

#[derive(Debug, thiserror::Error)]
pub enum TestbedError {
    #[error("testbed failed to boot: {0}")]
    BootFailure(String),

    #[error("could not establish a shell in the testbed: {0}")]
    ShellSetupFailure(String),

    #[error("timed out after {timeout:?} waiting for reply to `{command}`")]
    ProtocolTimeout { command: String, timeout: Duration },

    #[error("command `{command}` timed out after {timeout:?}")]
    ExecutionTimeout { command: String, timeout: Duration },

    #[error("lost channel to the testbed: {0}")]
    ChannelLost(String),

    #[error("testbed does not support revert")]
    RevertUnsupported,

    #[error("testbed lacks capability `{capability}` required by {needed_by}")]
    CapabilityMissing {
        capability: String,
        needed_by: String,
    },

    #[error("testbed rejected request: {0}")]
    BadRequest(String),

    #[error("testbed reported an internal error: {0}")]
    Backend(String),

    #[error("testbed protocol violation: {0}")]
    Protocol(String),

    #[error("testbed session is unusable after an earlier fatal error")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TestbedError {
    /// Whether the session that produced this error can no longer be trusted.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            TestbedError::RevertUnsupported
                | TestbedError::BadRequest(_)
                | TestbedError::CapabilityMissing { .. }
        )
    }

    /// Short reply form used on the backend protocol stream.
    pub fn reply_keyword(&self) -> &'static str {
        match self {
            TestbedError::BadRequest(_) => "bad-pkg",
            _ => "error",
        }
    }
}

pub type TestbedResult<T> = Result<T, TestbedError>;

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Testbed(#[from] TestbedError),

    #[error("{role} build failed with exit status {exit_code}")]
    BuildFailure { role: Role, exit_code: i32 },

    #[error("{role} build produced no artifact matching `{pattern}`")]
    ArtifactMissing { role: Role, pattern: String },

    #[error("diff tool failed: {0}")]
    DiffToolFailure(String),

    #[error("{0}")]
    Config(String),
}

impl CheckError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CheckError::Testbed(_) => EXIT_TESTBED_FAILURE,
            CheckError::BuildFailure { .. } | CheckError::ArtifactMissing { .. } => {
                EXIT_BUILD_FAILURE
            }
            CheckError::DiffToolFailure(_) => EXIT_DIFF_TOOL_FAILURE,
            CheckError::Config(_) => EXIT_USAGE,
        }
    }
}
