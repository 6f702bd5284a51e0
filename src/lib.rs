//! Reproducibility checking: build a source tree twice in a testbed under
//! controlled variations and compare the artifacts.
pub mod artifacts;
pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod protocol;
pub mod shovel;
pub mod testbed;
pub mod util;
pub mod variations;
pub mod virt;
