//! Console automation
//!
//! Drives an interactive child through a script of [`ConsoleOp`]s. Output is
//! accumulated by a reader into a [`CaptureBuffer`]; `expect` polls that
//! buffer from a cursor, so every match consumes the output before it and a
//! later `expect` only sees newer text.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::common::{Error, Result};

use super::process::{
    configure, drain_into, join_with_grace, wait_or_kill, CaptureBuffer, RunOptions, WaitOutcome,
};
use super::pty::{self, Pty};
use super::scenario::{quoted, ConsoleMode, ConsoleOp, ExecutionResult, RunFailure};

/// Write side of the session
enum ConsoleInput {
    Pty(Arc<File>),
    Pipe(ChildStdin),
}

/// An interactive session with a spawned child
pub struct ConsoleSession {
    child: Child,
    input: Option<ConsoleInput>,
    /// Everything the child printed (stdout, plus stderr in pty mode)
    transcript: CaptureBuffer,
    /// stderr in pipe mode
    errors: Option<CaptureBuffer>,
    tasks: Vec<JoinHandle<()>>,
    cursor: usize,
    poll_interval: Duration,
    started: Instant,
    /// Lifetime budget of the child, script included
    timeout: Duration,
}

impl ConsoleSession {
    /// Spawn `program` with `args` attached to a pty or to pipes
    pub async fn spawn(
        program: &Path,
        args: &[String],
        mode: ConsoleMode,
        options: &RunOptions,
        poll_interval: Duration,
    ) -> Result<Self> {
        match mode {
            ConsoleMode::Pty => Self::spawn_pty(program, args, options, poll_interval),
            ConsoleMode::Pipe => Self::spawn_pipe(program, args, options, poll_interval),
        }
    }

    fn spawn_pty(
        program: &Path,
        args: &[String],
        options: &RunOptions,
        poll_interval: Duration,
    ) -> Result<Self> {
        let Pty {
            master,
            slave,
            slave_path,
        } = Pty::open()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));
        configure(&mut cmd, options);
        cmd.env("TERM", "dumb");
        unsafe {
            cmd.pre_exec(pty::become_session_leader);
        }

        let child = cmd.spawn().map_err(|e| Error::spawn(program, e))?;
        // The command still holds slave descriptors; the master only sees a
        // hangup once every slave copy outside the child is closed.
        drop(cmd);

        tracing::debug!(
            program = %program.display(),
            ?args,
            pid = child.id(),
            tty = %slave_path.display(),
            "Spawned console child on pty"
        );

        let transcript = CaptureBuffer::new();
        let reader = master.try_clone()?;
        spawn_pty_reader(reader, transcript.clone())?;

        Ok(Self {
            child,
            input: Some(ConsoleInput::Pty(Arc::new(master))),
            transcript,
            errors: None,
            tasks: Vec::new(),
            cursor: 0,
            poll_interval,
            started: Instant::now(),
            timeout: options.timeout,
        })
    }

    fn spawn_pipe(
        program: &Path,
        args: &[String],
        options: &RunOptions,
        poll_interval: Duration,
    ) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        configure(&mut cmd, options);
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| Error::spawn(program, e))?;
        tracing::debug!(
            program = %program.display(),
            ?args,
            pid = child.id(),
            "Spawned console child on pipes"
        );

        let transcript = CaptureBuffer::new();
        let errors = CaptureBuffer::new();
        let mut tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            tasks.push(tokio::spawn(drain_into(stdout, transcript.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(drain_into(stderr, errors.clone())));
        }
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("Failed to get console stdin".to_string()))?;

        Ok(Self {
            child,
            input: Some(ConsoleInput::Pipe(stdin)),
            transcript,
            errors: Some(errors),
            tasks,
            cursor: 0,
            poll_interval,
            started: Instant::now(),
            timeout: options.timeout,
        })
    }

    /// Part of the process timeout not yet used
    fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    fn timed_out(&self) -> RunFailure {
        RunFailure::TimedOut {
            after: self.timeout,
        }
    }

    /// Wait until the unconsumed output contains `pattern`
    ///
    /// Gives up after `timeout` or when the process timeout runs out,
    /// whichever comes first.
    pub async fn expect(&mut self, pattern: &str, timeout: Duration) -> std::result::Result<(), RunFailure> {
        let budget = self.remaining();
        let process_bound = budget <= timeout;
        let deadline = Instant::now() + budget.min(timeout);
        loop {
            // read the flag first: the reader closes only after its last append
            let closed = self.transcript.is_closed();
            if let Some(end) = self.transcript.find_from(self.cursor, pattern.as_bytes()) {
                self.cursor = end;
                tracing::debug!(pattern, "Console expectation matched");
                return Ok(());
            }
            if closed {
                return Err(RunFailure::ProcessExited {
                    pattern: pattern.to_string(),
                });
            }
            if Instant::now() >= deadline {
                if process_bound {
                    return Err(self.timed_out());
                }
                return Err(RunFailure::ExpectTimedOut {
                    pattern: pattern.to_string(),
                    after: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Write `text` and a newline to the child
    ///
    /// A child that stops reading fails the write once the process timeout
    /// runs out.
    pub async fn send_line(&mut self, text: &str) -> std::result::Result<(), RunFailure> {
        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        let budget = self.remaining();
        let timed_out = self.timed_out();

        let write = async {
            match self.input.as_mut() {
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "console input already closed",
                )),
                Some(ConsoleInput::Pipe(stdin)) => match stdin.write_all(&line).await {
                    Ok(()) => stdin.flush().await,
                    Err(e) => Err(e),
                },
                Some(ConsoleInput::Pty(master)) => {
                    let master = Arc::clone(master);
                    // the blocked thread returns once finish kills the child
                    tokio::task::spawn_blocking(move || (&*master).write_all(&line))
                        .await
                        .unwrap_or_else(|e| Err(std::io::Error::other(e)))
                }
            }
        };

        let written = tokio::time::timeout(budget, write).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(RunFailure::Io {
                    message: format!("send_line {}: {e}", quoted(text)),
                })
            }
            Err(_) => {
                tracing::warn!(bytes = text.len() + 1, "Console input blocked until the process timeout");
                return Err(timed_out);
            }
        }
        tracing::debug!(text = %quoted(text), "Console line sent");
        Ok(())
    }

    /// Interpret `ops` in order, stopping at the first failure
    ///
    /// Returns how many operations completed, and the failure if any.
    pub async fn run_script(
        &mut self,
        ops: &[ConsoleOp],
        expect_timeout: Duration,
    ) -> (usize, Option<RunFailure>) {
        for (i, op) in ops.iter().enumerate() {
            let step = match op {
                ConsoleOp::Expect(pattern) => self.expect(pattern, expect_timeout).await,
                ConsoleOp::SendLine(text) => self.send_line(text).await,
            };
            if let Err(failure) = step {
                tracing::debug!(step = i + 1, %op, %failure, "Console script stopped");
                return (i, Some(failure));
            }
        }
        (ops.len(), None)
    }

    /// Close input, wait for the child and collect the result
    ///
    /// `timeout` is measured from spawn. A `script_failure` means the scenario
    /// already failed: the child is killed right away unless it has exited
    /// (or, when its output already closed, within `drain_grace`).
    pub async fn finish(
        mut self,
        timeout: Duration,
        drain_grace: Duration,
        script_failure: Option<RunFailure>,
    ) -> Result<ExecutionResult> {
        // pipe: EOF to the child; pty: no more writes from us
        self.input.take();

        let budget = match &script_failure {
            None => timeout.saturating_sub(self.started.elapsed()),
            // output closed, the child is exiting or already a zombie
            Some(RunFailure::ProcessExited { .. }) => drain_grace,
            Some(_) => Duration::ZERO,
        };
        let outcome = wait_or_kill(&mut self.child, budget).await?;

        let deadline = Instant::now() + drain_grace;
        let buffers: Vec<&CaptureBuffer> =
            std::iter::once(&self.transcript).chain(self.errors.iter()).collect();
        while buffers.iter().any(|b| !b.is_closed()) && Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval.min(Duration::from_millis(20))).await;
        }
        for task in self.tasks.drain(..) {
            join_with_grace(task, Duration::ZERO).await;
        }

        let (exit_code, error) = match (outcome, script_failure) {
            (WaitOutcome::Exited(code), None) => (code, None),
            (WaitOutcome::Exited(code), Some(failure)) => (code, Some(failure)),
            (WaitOutcome::TimedOut, Some(failure)) => (-1, Some(failure)),
            (WaitOutcome::TimedOut, None) => (-1, Some(RunFailure::TimedOut { after: timeout })),
        };

        Ok(ExecutionResult {
            exit_code,
            stdout: self.transcript.snapshot(),
            stderr: self.errors.map(|b| b.snapshot()).unwrap_or_default(),
            error,
        })
    }
}

/// Blocking reader on its own thread; pty masters are plain descriptors
fn spawn_pty_reader(mut master: File, buffer: CaptureBuffer) -> Result<()> {
    std::thread::Builder::new()
        .name("console-pty-reader".to_string())
        .spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match master.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => buffer.append(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) if pty::is_hangup(&e) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "pty reader stopped");
                        break;
                    }
                }
            }
            buffer.close();
        })
        .map(|_| ())
        .map_err(|e| Error::Pty(format!("failed to start reader thread: {e}")))
}

/// Console timing knobs
#[derive(Debug, Clone, Copy)]
pub struct ConsoleTiming {
    pub expect_timeout: Duration,
    pub poll_interval: Duration,
}

/// Spawn, run the script and collect the result in one call
pub async fn run_console(
    program: &Path,
    args: &[String],
    mode: ConsoleMode,
    script: &[ConsoleOp],
    options: &RunOptions,
    timing: ConsoleTiming,
) -> Result<ExecutionResult> {
    let mut session =
        ConsoleSession::spawn(program, args, mode, options, timing.poll_interval).await?;
    let (_, failure) = session.run_script(script, timing.expect_timeout).await;
    session
        .finish(options.timeout, options.drain_grace, failure)
        .await
}
