//! Process runner
//!
//! Spawns the CLI under test, feeds stdin, drains stdout and stderr on their
//! own tasks and waits for exit under a timeout. A child that outlives its
//! timeout is killed together with its process group and always reaped.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::common::{Error, Result};

use super::scenario::{ExecutionResult, RunFailure};

/// Options for a single invocation
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Working directory of the child
    pub dir: Option<PathBuf>,
    /// Extra environment on top of the inherited one
    pub env: Vec<(String, String)>,
    /// Bytes written to stdin before it is closed; `None` means /dev/null
    pub stdin: Option<Vec<u8>>,
    /// Spawn the child with uid/gid 0 (needs an elevated privilege scope)
    pub privileged: bool,
    /// Upper bound for the child's lifetime
    pub timeout: Duration,
    /// How long output readers may keep draining after the child is gone
    pub drain_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dir: None,
            env: Vec::new(),
            stdin: None,
            privileged: false,
            timeout: Duration::from_secs(300),
            drain_grace: Duration::from_millis(500),
        }
    }
}

/// Growable byte buffer shared between a reader task and its consumer
///
/// The reader marks the buffer closed once its stream hits EOF.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    data: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // a panicked writer cannot leave the Vec in a broken state
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find `pattern` at or after byte offset `from`
    ///
    /// Returns the offset just past the match.
    pub fn find_from(&self, from: usize, pattern: &[u8]) -> Option<usize> {
        let data = self.lock();
        if from > data.len() {
            return None;
        }
        if pattern.is_empty() {
            return Some(from);
        }
        data[from..]
            .windows(pattern.len())
            .position(|w| w == pattern)
            .map(|pos| from + pos + pattern.len())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Copy a stream into a capture buffer until EOF or error
pub(crate) async fn drain_into<R>(mut reader: R, buffer: CaptureBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.append(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Output reader stopped");
                break;
            }
        }
    }
    buffer.close();
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Exited(i32),
    TimedOut,
}

/// Map an exit status to a shell-style exit code
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Wait for the child, killing it once `timeout` has elapsed
///
/// The child is reaped on every path.
pub(crate) async fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<WaitOutcome> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(WaitOutcome::Exited(exit_code(status))),
        Ok(Err(e)) => {
            kill_tree(child).await;
            Err(Error::Io(e))
        }
        Err(_) => {
            tracing::warn!(
                pid = child.id(),
                timeout_secs = timeout.as_secs_f64(),
                "Child exceeded its timeout, killing process group"
            );
            kill_tree(child).await;
            Ok(WaitOutcome::TimedOut)
        }
    }
}

/// SIGKILL the child's process group, then the child itself, and reap it
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Children are spawned as group leaders, so the pid names the group
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!(pid, error = %e, "Failed to signal process group");
        }
    }
    // kill() also waits, which reaps the child
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Child already gone");
    }
}

/// Await a helper task for at most `grace`, aborting it afterwards
pub(crate) async fn join_with_grace<T>(mut handle: JoinHandle<T>, grace: Duration) -> Option<T> {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Helper task failed");
            None
        }
        Err(_) => {
            handle.abort();
            None
        }
    }
}

/// Apply the options shared by pipe and console invocations
pub(crate) fn configure(cmd: &mut Command, options: &RunOptions) {
    if let Some(dir) = &options.dir {
        cmd.current_dir(dir);
    }
    cmd.envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    #[cfg(unix)]
    if options.privileged {
        cmd.uid(0).gid(0);
    }
    cmd.kill_on_drop(true);
}

/// Run `program` with `args` and capture its outcome
pub async fn run_program(
    program: &Path,
    args: &[String],
    options: &RunOptions,
) -> Result<ExecutionResult> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if options.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    configure(&mut cmd, options);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| Error::spawn(program, e))?;
    tracing::debug!(
        program = %program.display(),
        ?args,
        pid = child.id(),
        "Spawned child"
    );

    let stdout = CaptureBuffer::new();
    let stderr = CaptureBuffer::new();
    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(drain_into(pipe, stdout.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain_into(pipe, stderr.clone())));

    let stdin_task = match (child.stdin.take(), options.stdin.clone()) {
        (Some(mut pipe), Some(input)) => Some(tokio::spawn(async move {
            let written = pipe.write_all(&input).await;
            // dropping the pipe delivers EOF to the child
            drop(pipe);
            written
        })),
        _ => None,
    };

    let outcome = wait_or_kill(&mut child, options.timeout).await?;

    for task in [stdout_task, stderr_task].into_iter().flatten() {
        join_with_grace(task, options.drain_grace).await;
    }

    let mut error = match outcome {
        WaitOutcome::Exited(_) => None,
        WaitOutcome::TimedOut => Some(RunFailure::TimedOut {
            after: options.timeout,
        }),
    };

    if let Some(task) = stdin_task {
        match join_with_grace(task, options.drain_grace).await {
            Some(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::debug!("Child closed stdin before reading all input");
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Writing stdin failed");
                error.get_or_insert(RunFailure::Io {
                    message: format!("stdin: {e}"),
                });
            }
            _ => {}
        }
    }

    let exit_code = match outcome {
        WaitOutcome::Exited(code) => code,
        WaitOutcome::TimedOut => -1,
    };

    tracing::debug!(
        program = %program.display(),
        exit_code,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "Child finished"
    );

    Ok(ExecutionResult {
        exit_code,
        stdout: stdout.snapshot(),
        stderr: stderr.snapshot(),
        error,
    })
}

/// Runs subcommands of one CLI binary
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run `<program> <command> <args...>`
    pub async fn run(
        &self,
        command: &str,
        args: &[String],
        options: &RunOptions,
    ) -> Result<ExecutionResult> {
        run_program(&self.program, &argv(command, args), options).await
    }
}

/// Subcommand followed by its arguments
pub(crate) fn argv(command: &str, args: &[String]) -> Vec<String> {
    std::iter::once(command.to_string())
        .chain(args.iter().cloned())
        .collect()
}
