//! Scenario data model
//!
//! A [`Scenario`] is one fully specified CLI invocation plus its expected
//! outcome. Suite files are deserialized into `suite::*` types and expanded
//! into scenarios; nothing here is mutated once built.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::lossy_tail;

/// One step of a console script
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleOp {
    /// Wait until the session output contains the pattern
    Expect(String),
    /// Write the text followed by a newline to the session input
    SendLine(String),
}

impl fmt::Display for ConsoleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleOp::Expect(p) => write!(f, "expect {}", quoted(p)),
            ConsoleOp::SendLine(t) => write!(f, "send_line {}", quoted(t)),
        }
    }
}

/// Bytes of console text kept in messages
const SHOWN_TEXT: usize = 200;

/// Quoted console text, cut down for messages and logs
pub(crate) fn quoted(text: &str) -> String {
    format!("{:?}", lossy_tail(text.as_bytes(), SHOWN_TEXT))
}

/// How the console engine connects to the child
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleMode {
    /// Pseudo-terminal as controlling terminal, stderr merged into stdout
    #[default]
    Pty,
    /// Plain pipes; closing input delivers EOF
    Pipe,
}

/// Which captured stream an output expectation looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    #[default]
    Stdout,
    Stderr,
    /// stdout followed by stderr
    Combined,
}

/// Substring expectation on captured output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputMatch {
    pub pattern: String,
    pub stream: OutputStream,
}

impl OutputMatch {
    pub fn stdout(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            stream: OutputStream::Stdout,
        }
    }

    /// Whether the designated stream of `result` contains the pattern
    pub fn matches(&self, result: &ExecutionResult) -> bool {
        let haystack = match self.stream {
            OutputStream::Stdout => String::from_utf8_lossy(&result.stdout).into_owned(),
            OutputStream::Stderr => String::from_utf8_lossy(&result.stderr).into_owned(),
            OutputStream::Combined => format!(
                "{}{}",
                String::from_utf8_lossy(&result.stdout),
                String::from_utf8_lossy(&result.stderr)
            ),
        };
        haystack.contains(&self.pattern)
    }
}

/// A fully specified test case
#[derive(Debug, Clone, Serialize)]
pub struct Scenario {
    /// Report name; not required to be unique
    pub name: String,
    /// CLI subcommand (`run`, `exec`, `shell`, ...)
    pub command: String,
    pub args: Vec<String>,
    /// Bytes fed to stdin, closed afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Vec<u8>>,
    /// Interactive script; non-empty selects the console engine
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub console: Vec<ConsoleOp>,
    pub console_mode: ConsoleMode,
    pub expect_exit: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_output: Option<OutputMatch>,
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
    /// Overrides the configured process timeout
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// Skipped unless the environment enables disabled scenarios
    pub requires_network: bool,
}

/// URI schemes that make the CLI reach out to a registry
pub const NETWORK_SCHEMES: &[&str] = &["docker://", "library://", "shub://", "oras://"];

impl Scenario {
    /// Start a scenario with the given name, command and expected exit code
    pub fn new(name: impl Into<String>, command: impl Into<String>, expect_exit: i32) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            stdin: None,
            console: Vec::new(),
            console_mode: ConsoleMode::default(),
            expect_exit,
            expect_output: None,
            privileged: false,
            dir: None,
            env: Vec::new(),
            timeout: None,
            requires_network: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self.requires_network = self.references_network();
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn console(mut self, ops: Vec<ConsoleOp>) -> Self {
        self.console = ops;
        self
    }

    pub fn console_mode(mut self, mode: ConsoleMode) -> Self {
        self.console_mode = mode;
        self
    }

    pub fn expect_output(mut self, output: OutputMatch) -> Self {
        self.expect_output = Some(output);
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn requires_network(mut self, requires: bool) -> Self {
        self.requires_network = requires;
        self
    }

    /// Whether any argument is a registry URI
    pub fn references_network(&self) -> bool {
        self.args
            .iter()
            .any(|a| NETWORK_SCHEMES.iter().any(|s| a.starts_with(s)))
    }

    pub fn is_console(&self) -> bool {
        !self.console.is_empty()
    }
}

/// Why an execution did not complete normally
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    /// The process outlived its timeout and was killed
    TimedOut { after: Duration },
    /// A console `expect` did not match in time
    ExpectTimedOut { pattern: String, after: Duration },
    /// A console `expect` ran after the child closed its output
    ProcessExited { pattern: String },
    /// Writing to the child failed
    Io { message: String },
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::TimedOut { after } => {
                write!(f, "process timed out after {:.1}s", after.as_secs_f64())
            }
            RunFailure::ExpectTimedOut { pattern, after } => write!(
                f,
                "expected {:?} within {:.1}s but it never appeared",
                pattern,
                after.as_secs_f64()
            ),
            RunFailure::ProcessExited { pattern } => {
                write!(f, "process exited before {pattern:?} appeared")
            }
            RunFailure::Io { message } => write!(f, "I/O with child failed: {message}"),
        }
    }
}

/// What a single invocation produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    /// Exit code; `128 + signal` for signal deaths, `-1` when killed on timeout
    pub exit_code: i32,
    #[serde(serialize_with = "serialize_lossy")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "serialize_lossy")]
    pub stderr: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
}

fn serialize_lossy<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

impl ExecutionResult {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Whether the child's own exit status is meaningful
    pub fn completed(&self) -> bool {
        self.error.is_none()
    }

    /// Captured streams formatted for a failure message
    pub fn diagnostics(&self) -> String {
        format!(
            "--- stdout ---\n{}\n--- stderr ---\n{}",
            lossy_tail(&self.stdout, 64 * 1024),
            lossy_tail(&self.stderr, 64 * 1024)
        )
    }
}

/// Per-scenario lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "exit_code", rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed(i32),
    TimedOut,
    SetupFailed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed(_) | ExecutionState::TimedOut | ExecutionState::SetupFailed
        )
    }

    /// Only completed executions take part in assertions
    pub fn is_assertable(self) -> bool {
        matches!(self, ExecutionState::Completed(_))
    }

    /// Advance the state machine; terminal states never move again
    pub fn advance(self, next: ExecutionState) -> ExecutionState {
        match (self, next) {
            (ExecutionState::Pending, ExecutionState::Running) => next,
            (ExecutionState::Pending, ExecutionState::SetupFailed) => next,
            (ExecutionState::Running, n) if n.is_terminal() => next,
            (current, _) => current,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Pending => write!(f, "pending"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Completed(code) => write!(f, "completed (exit {code})"),
            ExecutionState::TimedOut => write!(f, "timed out"),
            ExecutionState::SetupFailed => write!(f, "setup failed"),
        }
    }
}
