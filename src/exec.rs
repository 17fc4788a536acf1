//! Subprocess execution with wall-clock deadlines.
//!
//! Every external command the pipeline runs goes through
//! [`run_with_timeout`]: output is drained concurrently with a byte cap, and
//! a command that outlives its deadline has its whole process group killed,
//! not just the direct child. Timing out is a normal terminal state, so the
//! partial output collected up to the kill is preserved in the result.

use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::env::ExecutionEnvironment;

/// File name the extracted script is written under inside an environment.
pub const SCRIPT_FILENAME: &str = "solution.py";

/// How long the output pipes may stay open after the child itself is done.
/// A background process that inherited stdout holds the pipe open past its
/// parent's exit; once this grace runs out the whole group is killed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Drain bound after the group has been killed; past it collection is
/// abandoned and the streams come back empty.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Errors from launching a command. Failures of the command itself are not
/// errors; they come back inside [`ExecutionResult`].
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command could not be spawned at all.
    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    /// Waiting on the child failed.
    #[error("Process error: {0}")]
    Wait(String),

    /// IO error while preparing the command.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The observable outcome of one command run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Captured standard output, possibly capped.
    pub stdout: String,
    /// Captured standard error, possibly capped.
    pub stderr: String,
    /// Exit code; `None` when the process timed out or died on a signal.
    pub exit_code: Option<i32>,
    /// Wall-clock time from spawn to reap.
    pub duration: Duration,
    /// True when the deadline expired and the process group was killed.
    pub timed_out: bool,
    /// True when stdout hit the byte cap.
    pub stdout_truncated: bool,
    /// True when stderr hit the byte cap.
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// True for a clean zero exit within the deadline.
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs a command to completion or to its deadline, whichever comes first.
///
/// The command is placed in its own process group so that a timeout kill
/// reaches every descendant, including children the script spawned itself.
/// Each output stream is captured up to `max_output_bytes`; past the cap the
/// stream is still drained (so the child never blocks on a full pipe) but
/// the excess is dropped and the truncation flag set.
///
/// Draining after exit is bounded too: a background process that inherited
/// an output pipe cannot hold the call open. Once the drain grace runs out
/// the whole process group is killed and whatever was captured so far is
/// returned.
///
/// # Errors
///
/// Returns `ExecError::Spawn` when the binary cannot be started. A nonzero
/// exit or a timeout is reported in the `ExecutionResult`, not as an error.
pub async fn run_with_timeout(
    mut command: Command,
    limit: Duration,
    max_output_bytes: usize,
) -> Result<ExecutionResult, ExecError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| ExecError::Spawn(e.to_string()))?;
    let pid = child.id();

    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(read_capped(pipe, max_output_bytes)));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(read_capped(pipe, max_output_bytes)));
    let stdout_abort = stdout_task.as_ref().map(|handle| handle.abort_handle());
    let stderr_abort = stderr_task.as_ref().map(|handle| handle.abort_handle());

    let (exit_code, timed_out) = match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => (status.code(), false),
        Ok(Err(e)) => return Err(ExecError::Wait(e.to_string())),
        Err(_) => {
            warn!(
                "Command exceeded {}s deadline, killing process group",
                limit.as_secs()
            );
            kill_process_group(pid);
            // Reap the child so the kill cannot leave a zombie behind.
            let _ = child.wait().await;
            (None, true)
        }
    };

    // Pipe EOF lags the exit when a background process inherited a stream;
    // the drain runs under its own deadline rather than waiting it out.
    let mut drain = tokio::spawn(async move {
        let stdout = collect_stream(stdout_task).await;
        let stderr = collect_stream(stderr_task).await;
        (stdout, stderr)
    });

    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) =
        match tokio::time::timeout(DRAIN_GRACE, &mut drain).await {
            Ok(joined) => streams_or_empty(joined),
            Err(_) => {
                warn!(
                    "Output pipes still open {}s after exit, killing process group",
                    DRAIN_GRACE.as_secs()
                );
                kill_process_group(pid);
                match tokio::time::timeout(KILL_DRAIN_GRACE, &mut drain).await {
                    Ok(joined) => streams_or_empty(joined),
                    Err(_) => {
                        if let Some(handle) = stdout_abort {
                            handle.abort();
                        }
                        if let Some(handle) = stderr_abort {
                            handle.abort();
                        }
                        streams_or_empty(drain.await)
                    }
                }
            }
        };

    Ok(ExecutionResult {
        stdout,
        stderr,
        exit_code,
        duration: start.elapsed(),
        timed_out,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Writes the extracted script into the environment and runs it under the
/// environment's virtualenv interpreter.
///
/// # Errors
///
/// Returns `ExecError` when the script cannot be written or the interpreter
/// cannot be spawned. Script failures and timeouts come back in the result.
pub async fn execute_script(
    env: &ExecutionEnvironment,
    script: &str,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ExecutionResult, ExecError> {
    let script_path = env.root().join(SCRIPT_FILENAME);
    std::fs::write(&script_path, script)?;

    info!(
        "Executing {} (timeout {}s)",
        script_path.display(),
        timeout.as_secs()
    );

    let mut command = Command::new(env.venv_python());
    command.arg(&script_path).current_dir(env.root());

    let result = run_with_timeout(command, timeout, max_output_bytes).await?;

    if result.timed_out {
        warn!("Script timed out after {:?}", result.duration);
    } else {
        debug!(
            "Script finished with exit code {:?} in {:?}",
            result.exit_code, result.duration
        );
    }

    Ok(result)
}

/// Kill the process group rooted at `pid`. The child was started with
/// `process_group(0)`, so its pid doubles as the group id.
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

/// Drains one output stream, keeping at most `cap` bytes.
async fn read_capped<R>(mut pipe: R, cap: usize) -> (Vec<u8>, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];

    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buffer.len() < cap {
                    let take = n.min(cap - buffer.len());
                    buffer.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(e) => {
                warn!("Error reading process output: {}", e);
                break;
            }
        }
    }

    (buffer, truncated)
}

async fn collect_stream(task: Option<JoinHandle<(Vec<u8>, bool)>>) -> (String, bool) {
    match task {
        Some(handle) => match handle.await {
            Ok((bytes, truncated)) => (String::from_utf8_lossy(&bytes).to_string(), truncated),
            Err(_) => (String::new(), false),
        },
        None => (String::new(), false),
    }
}

/// Unwraps a finished drain task, mapping an aborted or panicked drain to
/// empty streams.
fn streams_or_empty(
    joined: Result<((String, bool), (String, bool)), JoinError>,
) -> ((String, bool), (String, bool)) {
    joined.unwrap_or_else(|_| ((String::new(), false), (String::new(), false)))
}
