//! Scenario outcomes and suite reports

use std::fmt;
use std::time::Duration;

use colored::Colorize;
use serde::Serialize;

use super::scenario::{ExecutionResult, ExecutionState, OutputMatch, RunFailure};

/// Why a scenario failed
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// Environment, privilege, resource or template problem before spawning
    Setup { message: String },
    /// The CLI binary could not be started
    Spawn { message: String },
    /// The process outlived its timeout
    Timeout {
        after: Duration,
        result: ExecutionResult,
    },
    /// A console script step failed
    Console {
        failure: RunFailure,
        result: ExecutionResult,
    },
    /// Completed, but not as expected
    Mismatch {
        expected_exit: i32,
        actual_exit: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        missing_output: Option<OutputMatch>,
        result: ExecutionResult,
    },
}

impl Failure {
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Failure::Setup { .. } | Failure::Spawn { .. } => None,
            Failure::Timeout { result, .. }
            | Failure::Console { result, .. }
            | Failure::Mismatch { result, .. } => Some(result),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Setup { message } => write!(f, "setup failed: {message}")?,
            Failure::Spawn { message } => write!(f, "{message}")?,
            Failure::Timeout { after, .. } => {
                write!(f, "timed out after {:.1}s", after.as_secs_f64())?
            }
            Failure::Console { failure, .. } => write!(f, "console script failed: {failure}")?,
            Failure::Mismatch {
                expected_exit,
                actual_exit,
                missing_output,
                ..
            } => {
                if expected_exit != actual_exit {
                    write!(f, "expected exit {expected_exit}, got {actual_exit}")?;
                }
                if let Some(output) = missing_output {
                    if expected_exit != actual_exit {
                        write!(f, "; ")?;
                    }
                    write!(f, "{:?} not found in {:?}", output.pattern, output.stream)?;
                }
            }
        }
        if let Some(result) = self.result() {
            write!(f, "\n{}", result.diagnostics())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Passed,
    Failed,
    Skipped,
}

/// Outcome of one scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub status: Status,
    pub state: ExecutionState,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl ScenarioReport {
    pub fn passed(name: impl Into<String>, state: ExecutionState, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status: Status::Passed,
            state,
            duration,
            failure: None,
            skip_reason: None,
        }
    }

    pub fn failed(
        name: impl Into<String>,
        state: ExecutionState,
        duration: Duration,
        failure: Failure,
    ) -> Self {
        Self {
            name: name.into(),
            status: Status::Failed,
            state,
            duration,
            failure: Some(failure),
            skip_reason: None,
        }
    }

    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::Skipped,
            state: ExecutionState::Pending,
            duration: Duration::ZERO,
            failure: None,
            skip_reason: Some(reason.into()),
        }
    }

    /// A scenario that never reached spawn
    pub fn setup_failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(
            name,
            ExecutionState::Pending.advance(ExecutionState::SetupFailed),
            Duration::ZERO,
            Failure::Setup {
                message: message.into(),
            },
        )
    }
}

/// Outcome of one group
#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub name: String,
    pub scenarios: Vec<ScenarioReport>,
    /// Resources that could not be released
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub release_errors: Vec<String>,
}

/// Outcome of a whole suite
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub name: String,
    pub groups: Vec<GroupReport>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl SuiteReport {
    fn count(&self, status: Status) -> usize {
        self.groups
            .iter()
            .flat_map(|g| &g.scenarios)
            .filter(|s| s.status == status)
            .count()
    }

    pub fn passed(&self) -> usize {
        self.count(Status::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(Status::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Status::Skipped)
    }

    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.scenarios.len()).sum()
    }

    /// True when nothing executed failed
    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    /// Print the human-readable report to stdout
    pub fn print(&self, verbose: bool) {
        println!(
            "\n{} {}",
            "Suite:".blue().bold(),
            self.name.white().bold()
        );

        for group in &self.groups {
            println!("\n{}", format!("{}:", group.name).cyan());
            for scenario in &group.scenarios {
                let timing = format!("({} ms)", scenario.duration.as_millis());
                match scenario.status {
                    Status::Passed => {
                        println!("  {} {} {}", "✓".green(), scenario.name, timing.dimmed())
                    }
                    Status::Skipped => println!(
                        "  {} {} {}",
                        "-".yellow(),
                        scenario.name,
                        scenario.skip_reason.as_deref().unwrap_or("skipped").dimmed()
                    ),
                    Status::Failed => {
                        println!("  {} {} {}", "✗".red(), scenario.name.red(), timing.dimmed());
                        if let Some(failure) = &scenario.failure {
                            let text = if verbose {
                                failure.to_string()
                            } else {
                                failure.to_string().lines().next().unwrap_or_default().to_string()
                            };
                            for line in text.lines() {
                                println!("      {line}");
                            }
                        }
                    }
                }
            }
            for error in &group.release_errors {
                println!("  {} {}", "!".yellow(), error);
            }
        }

        let summary = format!(
            "{} passed, {} failed, {} skipped ({:.1}s)",
            self.passed(),
            self.failed(),
            self.skipped(),
            self.duration.as_secs_f64()
        );
        if self.success() {
            println!("\n{} {}", "✓".green().bold(), summary.green().bold());
        } else {
            println!("\n{} {}", "✗".red().bold(), summary.red().bold());
            if !verbose {
                println!("  {}", "Re-run with --verbose for captured output".dimmed());
            }
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
