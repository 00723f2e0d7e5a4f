//! Subprocess execution with concurrently pumped pipes.
//!
//! A child that writes more than a pipe buffer's worth of output blocks
//! until somebody reads it.  If the parent is at the same time blocked
//! writing the child's stdin (or reading the other output stream), neither
//! side makes progress.  [`ProcessRunner`] therefore starts one task per
//! pipe before awaiting any of them:
//!
//! - **stdin**: write the whole payload, then close the pipe so the child
//!   sees end-of-input (the pipe is closed immediately when there is no
//!   payload),
//! - **stdout** / **stderr**: read to end-of-file into a buffer.
//!
//! The three tasks are joined, the child is always waited on, and only then
//! is the first pipe fault (stdin, stdout, stderr order) reported.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::error::{ProcessError, Result};
use crate::invocation::{ProcessInvocation, ProcessOutcome};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Anything that can execute a [`ProcessInvocation`].
///
/// [`ProcessRunner`] is the real implementation; tests substitute recording
/// fakes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the invocation to completion and return its outcome.
    async fn run(&self, invocation: &ProcessInvocation) -> Result<ProcessOutcome>;
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Spawns one child process per call.  No process reuse.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    /// Upper bound on the whole exchange.  `None` waits forever.
    timeout: Option<Duration>,
}

impl ProcessRunner {
    /// A runner without a time limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the child and fail with [`ProcessError::Timeout`] when it runs
    /// longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_optional_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &ProcessInvocation) -> Result<ProcessOutcome> {
        let command_line = invocation.to_string();
        if invocation.arguments().is_empty() {
            return Err(ProcessError::EmptyArguments {
                command: command_line,
            });
        }

        debug!(
            command = %command_line,
            stdin_len = invocation.stdin_bytes().map_or(0, <[u8]>::len),
            "spawning process"
        );

        let mut child = Command::new(invocation.command())
            .args(invocation.arguments())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let input = invocation.stdin_bytes().map(<[u8]>::to_vec).unwrap_or_default();
        let stdin_task = tokio::spawn(write_stdin(child.stdin.take(), input));
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let exchange = async {
            let (stdin_res, stdout_res, stderr_res) =
                tokio::join!(stdin_task, stdout_task, stderr_task);
            // Reap the child even when a pipe task failed.
            let status = child.wait().await;
            (stdin_res, stdout_res, stderr_res, status)
        };

        let joined = match self.timeout {
            Some(limit) => {
                let bounded = tokio::time::timeout(limit, exchange).await;
                match bounded {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            command = %command_line,
                            timeout_secs = limit.as_secs(),
                            "process timed out, killing"
                        );
                        if let Err(e) = child.start_kill() {
                            debug!(error = %e, "kill after timeout failed");
                        }
                        if let Err(e) = child.wait().await {
                            debug!(error = %e, "wait after kill failed");
                        }
                        return Err(ProcessError::Timeout {
                            command: command_line,
                            seconds: limit.as_secs(),
                        });
                    }
                }
            }
            None => exchange.await,
        };

        let (stdin_res, stdout_res, stderr_res, status) = joined;
        let pipe_fault = |stream: &'static str, reason: String| ProcessError::Pipe {
            command: command_line.clone(),
            stream,
            reason,
        };

        flatten(stdin_res).map_err(|reason| pipe_fault("stdin", reason))?;
        let stdout = flatten(stdout_res).map_err(|reason| pipe_fault("stdout", reason))?;
        let stderr = flatten(stderr_res).map_err(|reason| pipe_fault("stderr", reason))?;
        let status = status.map_err(|source| ProcessError::Wait {
            command: command_line.clone(),
            source,
        })?;

        let outcome = ProcessOutcome {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        };
        debug!(
            command = %command_line,
            exit_code = outcome.exit_code,
            stdout_len = outcome.stdout.len(),
            stderr_len = outcome.stderr.len(),
            "process finished"
        );
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Pipe tasks
// ---------------------------------------------------------------------------

async fn write_stdin(pipe: Option<ChildStdin>, input: Vec<u8>) -> std::io::Result<()> {
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    if !input.is_empty() {
        pipe.write_all(&input).await?;
        pipe.flush().await?;
    }
    // Dropping the handle closes the pipe: the child sees EOF.
    drop(pipe);
    Ok(())
}

async fn read_stream<R>(pipe: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Collapse a joined pipe task into its value or a printable fault.
fn flatten<T>(
    joined: std::result::Result<std::io::Result<T>, JoinError>,
) -> std::result::Result<T, String> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("pipe task did not complete: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
