//! Scenario-driven conformance harness
//!
//! Loads the suite environment, expands YAML scenario tables, runs each
//! invocation of the CLI under test (plain or through a console script) and
//! asserts on exit codes and captured output.

pub mod console;
pub mod environment;
pub mod identity;
pub mod privilege;
pub mod process;
pub mod pty;
pub mod report;
pub mod resources;
pub mod runner;
pub mod scenario;
pub mod suite;
pub mod template;

pub use console::{run_console, ConsoleSession, ConsoleTiming};
pub use environment::TestEnv;
pub use privilege::{PrivilegeGuard, PrivilegeSwitcher};
pub use process::{run_program, ProcessRunner, RunOptions};
pub use report::{Failure, GroupReport, ScenarioReport, Status, SuiteReport};
pub use resources::{ResourceSet, ResourceSpec};
pub use runner::{GroupBuilder, ScenarioRunner};
pub use scenario::{
    ConsoleMode, ConsoleOp, ExecutionResult, ExecutionState, OutputMatch, OutputStream,
    RunFailure, Scenario,
};
pub use suite::SuiteFile;
pub use template::Vars;
