//! Child process supervision for job worker commands.
//!
//! A [`CommandRunner`] wraps one `sh -c <cmd>` invocation: the job body goes
//! in on stdin (then stdin is closed), stdout comes back as a bounded stream
//! of byte chunks, and completion is surfaced as a single [`WaitEvent`]. The
//! runner never decides queue semantics; it only reports what the child did.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Grace period between SIGTERM and the SIGKILL escalation.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Read buffer size for the stdout pump.
const STDOUT_CHUNK: usize = 8 * 1024;

/// Capacity of the stdout chunk channel. Bounded so a worker that floods
/// stdout faster than the broker drains it blocks in the pipe, not in memory.
const STDOUT_CHANNEL: usize = 16;

/// Errors raised by the command harness itself.
///
/// A non-zero exit status is *not* an error here; it is reported through
/// [`WaitEvent::status`].
#[derive(Debug, Error)]
pub enum CommandError {
    /// The shell command string was empty or blank.
    #[error("empty shell command")]
    EmptyCommand,

    /// `start_with_stdin` was called more than once.
    #[error("command already started")]
    AlreadyStarted,

    /// The completion event was requested before the child was started.
    #[error("command not started")]
    NotStarted,

    /// The child could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on the child failed inside the OS.
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),

    /// The wait task died before reporting completion.
    #[error("worker completion event lost")]
    WaitLost,
}

/// The single completion event of a supervised child.
#[derive(Debug)]
pub struct WaitEvent {
    /// Exit code; `0` iff the child exited cleanly with code 0. A child
    /// killed by a signal reports `-1`.
    pub status: i32,

    /// Harness-internal wait failure. Never set for a plain non-zero exit.
    pub error: Option<CommandError>,
}

/// One worker command invocation.
///
/// Built with [`build`](CommandRunner::build), started once with
/// [`start_with_stdin`](CommandRunner::start_with_stdin). Stdout chunks
/// arrive on the receiver returned by `build`; the channel closes when the
/// child closes its stdout.
pub struct CommandRunner {
    command: Option<Command>,
    stdout_tx: Option<mpsc::Sender<Vec<u8>>>,
    wait_rx: Option<oneshot::Receiver<WaitEvent>>,
    pid: Option<Pid>,
    terminated: AtomicBool,
    exited: Arc<AtomicBool>,
}

impl CommandRunner {
    /// Prepares a runner for `sh -c <shell_cmd>` plus the stdout chunk
    /// stream. Fails if the command string is blank.
    pub fn build(shell_cmd: &str) -> Result<(Self, mpsc::Receiver<Vec<u8>>), CommandError> {
        if shell_cmd.trim().is_empty() {
            return Err(CommandError::EmptyCommand);
        }

        let mut command = Command::new("sh");
        command.arg("-c").arg(shell_cmd);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        // Stderr is inherited: worker diagnostics land on the broker's own
        // stderr and are not part of the job result.

        let (stdout_tx, stdout_rx) = mpsc::channel(STDOUT_CHANNEL);
        let runner = CommandRunner {
            command: Some(command),
            stdout_tx: Some(stdout_tx),
            wait_rx: None,
            pid: None,
            terminated: AtomicBool::new(false),
            exited: Arc::new(AtomicBool::new(false)),
        };
        Ok((runner, stdout_rx))
    }

    /// Spawns the child, writes `body` to its stdin and closes it, and starts
    /// the stdout pump and the wait task.
    pub fn start_with_stdin(&mut self, body: Vec<u8>) -> Result<(), CommandError> {
        let mut command = self.command.take().ok_or(CommandError::AlreadyStarted)?;
        let mut child = command.spawn().map_err(CommandError::Spawn)?;
        self.pid = child.id().map(|raw| Pid::from_raw(raw as i32));

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // EPIPE here just means the worker exited without reading its
                // stdin, which is its prerogative.
                if let Err(error) = stdin.write_all(&body).await {
                    debug!(%error, "short write to worker stdin");
                }
                // Dropping stdin closes it.
            });
        }

        if let (Some(mut stdout), Some(tx)) = (child.stdout.take(), self.stdout_tx.take()) {
            tokio::spawn(async move {
                let mut buf = [0u8; STDOUT_CHUNK];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                // Dropping the sender closes the chunk stream.
            });
        }

        let (wait_tx, wait_rx) = oneshot::channel();
        let exited = Arc::clone(&self.exited);
        tokio::spawn(async move {
            let event = match child.wait().await {
                Ok(status) => WaitEvent {
                    status: status.code().unwrap_or(-1),
                    error: None,
                },
                Err(error) => WaitEvent {
                    status: -1,
                    error: Some(CommandError::Wait(error)),
                },
            };
            exited.store(true, Ordering::SeqCst);
            let _ = wait_tx.send(event);
        });
        self.wait_rx = Some(wait_rx);
        Ok(())
    }

    /// Takes the completion event receiver. Yields exactly one [`WaitEvent`].
    pub fn wait_event(&mut self) -> Result<oneshot::Receiver<WaitEvent>, CommandError> {
        self.wait_rx.take().ok_or(CommandError::NotStarted)
    }

    /// Sends SIGTERM to the child if it is still running, and schedules a
    /// SIGKILL after [`KILL_GRACE`] in case the child ignores it.
    ///
    /// Idempotent: only the first call signals; later calls are no-ops, as is
    /// terminating a child that has already exited (ESRCH is ignored).
    pub fn terminate(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pid = pid.as_raw(), "terminating worker");
        if let Err(errno) = kill(pid, Signal::SIGTERM) {
            debug!(pid = pid.as_raw(), %errno, "SIGTERM not delivered");
        }
        let exited = Arc::clone(&self.exited);
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            if !exited.load(Ordering::SeqCst) {
                debug!(pid = pid.as_raw(), "escalating to SIGKILL");
                let _ = kill(pid, Signal::SIGKILL);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drains the chunk stream into one buffer until it closes.
    async fn collect_stdout(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn cat_echoes_stdin_to_stdout() {
        let (mut runner, stdout) = CommandRunner::build("cat").unwrap();
        runner.start_with_stdin(b"hello\n".to_vec()).unwrap();
        let wait = runner.wait_event().unwrap();

        assert_eq!(collect_stdout(stdout).await, b"hello\n");
        let event = wait.await.unwrap();
        assert_eq!(event.status, 0);
        assert!(event.error.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_status_not_an_error() {
        let (mut runner, stdout) = CommandRunner::build("false").unwrap();
        runner.start_with_stdin(Vec::new()).unwrap();
        let wait = runner.wait_event().unwrap();

        assert!(collect_stdout(stdout).await.is_empty());
        let event = wait.await.unwrap();
        assert_eq!(event.status, 1);
        assert!(event.error.is_none());
    }

    #[tokio::test]
    async fn missing_binary_exits_127() {
        let (mut runner, stdout) = CommandRunner::build("/no/such/binary-here").unwrap();
        runner.start_with_stdin(Vec::new()).unwrap();
        let wait = runner.wait_event().unwrap();

        drop(stdout);
        assert_eq!(wait.await.unwrap().status, 127);
    }

    #[tokio::test]
    async fn chunk_order_is_preserved() {
        let (mut runner, stdout) = CommandRunner::build("printf one; printf two").unwrap();
        runner.start_with_stdin(Vec::new()).unwrap();
        let _ = runner.wait_event().unwrap();

        assert_eq!(collect_stdout(stdout).await, b"onetwo");
    }

    #[tokio::test]
    async fn terminate_stops_a_hung_worker() {
        let (mut runner, stdout) = CommandRunner::build("sleep 30").unwrap();
        runner.start_with_stdin(Vec::new()).unwrap();
        let wait = runner.wait_event().unwrap();

        runner.terminate();
        // A second call must be harmless.
        runner.terminate();

        let event = tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("worker did not die after SIGTERM")
            .unwrap();
        assert_ne!(event.status, 0);
        drop(stdout);
    }

    #[tokio::test]
    async fn empty_command_is_rejected_at_build() {
        assert!(matches!(
            CommandRunner::build("   "),
            Err(CommandError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (mut runner, _stdout) = CommandRunner::build("true").unwrap();
        runner.start_with_stdin(Vec::new()).unwrap();
        assert!(matches!(
            runner.start_with_stdin(Vec::new()),
            Err(CommandError::AlreadyStarted)
        ));
    }
}
