//! Conformance harness for container runtime CLIs
//!
//! Drives a CLI binary through tables of scenarios (plain invocations and
//! interactive console scripts) and checks exit codes and output.

pub mod cli;
pub mod commands;
pub mod common;
pub mod harness;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use harness::{Scenario, ScenarioRunner, SuiteFile, TestEnv};
