//! Child process supervision.
//!
//! Wraps spawning and terminating one external process with deterministic
//! exit reporting: clean exit, exit code, or termination by signal.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Capacity of the stdout line fan-out channel.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Errors from child process operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// A second launch was attempted while a child is still live.
    #[error("Process already launched")]
    AlreadyLaunched,

    #[error("Failed to spawn process: {reason}")]
    SpawnFailed { reason: String },

    /// The process exited with a nonzero code; `stderr` carries its
    /// accumulated error output.
    #[error("Process exited with code {code}: {stderr}")]
    ExitCode { code: i32, stderr: String },

    /// The process was terminated by a signal, so no exit code exists.
    #[error("Process terminated by {signal}")]
    Signal { signal: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProcessError> for outway_core::Error {
    fn from(err: ProcessError) -> Self {
        Self::ForwardingProcess(err.to_string())
    }
}

/// Supervisor for one external process.
///
/// At most one live OS process exists per supervisor at any time; a second
/// [`launch`](Self::launch) without an intervening exit fails fast with
/// [`ProcessError::AlreadyLaunched`].
pub struct ProcessSupervisor {
    /// Executable path.
    binary: PathBuf,
    /// Mirror child stdout/stderr into our own logs. Off by default so
    /// proxy details stay out of logs and telemetry.
    mirror_output: AtomicBool,
    /// Fan-out of child stdout lines, independent of final-result capture.
    line_tx: broadcast::Sender<String>,
    /// PID of the live child, `None` when nothing is running.
    live: watch::Sender<Option<u32>>,
    /// Set by a [`stop`](Self::stop) that found no live process yet; a
    /// launch that is mid-spawn consumes it and terminates itself as
    /// soon as it claims the slot.
    stop_pending: AtomicBool,
}

impl ProcessSupervisor {
    /// Create a supervisor for the given executable.
    pub fn new(binary: PathBuf) -> Self {
        let (line_tx, _) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        let (live, _) = watch::channel(None);
        Self {
            binary,
            mirror_output: AtomicBool::new(false),
            line_tx,
            live,
            stop_pending: AtomicBool::new(false),
        }
    }

    /// Enable or disable mirroring of child output into our logs.
    pub fn set_mirror_output(&self, enabled: bool) {
        self.mirror_output.store(enabled, Ordering::Relaxed);
    }

    /// Subscribe to child stdout lines. Subscribe before `launch` to
    /// observe output from the very first line.
    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.line_tx.subscribe()
    }

    /// Whether a child process is currently live.
    pub fn is_live(&self) -> bool {
        self.live.borrow().is_some()
    }

    /// Spawn the process and wait for it to exit.
    ///
    /// Resolves with the accumulated stdout (when `capture_stdout`) on a
    /// clean exit, [`ProcessError::ExitCode`] on a nonzero exit, or
    /// [`ProcessError::Signal`] when terminated by a signal.
    pub async fn launch(
        &self,
        args: &[String],
        capture_stdout: bool,
    ) -> Result<String, ProcessError> {
        // Claim the single process slot before spawning.
        let mut claimed = false;
        self.live.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(0);
                claimed = true;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ProcessError::AlreadyLaunched);
        }

        let mut child = match Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.live.send_replace(None);
                // Nothing came up, so any pending stop is satisfied.
                self.stop_pending.store(false, Ordering::SeqCst);
                return Err(ProcessError::SpawnFailed {
                    reason: e.to_string(),
                });
            }
        };
        let pid = child.id().unwrap_or(0);
        self.live.send_replace(Some(pid));
        debug!(binary = %self.binary.display(), pid, "process launched");
        // A stop() that raced this spawn found no pid to signal; honor
        // it now that the slot is claimed.
        if self.stop_pending.swap(false, Ordering::SeqCst) {
            debug!(pid, "stop was requested during spawn, terminating");
            send_sigterm(pid);
        }

        let mirror = self.mirror_output.load(Ordering::Relaxed);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_reader = async {
            let mut collected = String::new();
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if mirror {
                        info!(pid, "stdout: {line}");
                    }
                    if capture_stdout {
                        collected.push_str(&line);
                        collected.push('\n');
                    }
                    let _ = self.line_tx.send(line);
                }
            }
            collected
        };
        // stderr is always accumulated so exit-code errors can carry it.
        let stderr_reader = async {
            let mut collected = String::new();
            if let Some(err) = stderr {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if mirror {
                        warn!(pid, "stderr: {line}");
                    }
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        };

        let (stdout_text, stderr_text) = tokio::join!(stdout_reader, stderr_reader);
        let status = child.wait().await;
        self.live.send_replace(None);

        let status = match status {
            Ok(status) => status,
            Err(e) => return Err(e.into()),
        };
        debug!(pid, ?status, "process exited");
        if status.success() {
            return Ok(stdout_text);
        }
        match status.code() {
            Some(code) => Err(ProcessError::ExitCode {
                code,
                stderr: stderr_text.trim().to_string(),
            }),
            None => Err(ProcessError::Signal {
                signal: signal_name(&status),
            }),
        }
    }

    /// Send a termination signal and wait for the in-flight launch to
    /// settle.
    ///
    /// When no process is live the stop is latched instead: a launch that
    /// is mid-spawn (slot claimed, pid not yet visible) or that claims
    /// the slot next consumes the latch and terminates itself, so a stop
    /// racing a relaunch never leaks a process.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        self.stop_pending.store(true, Ordering::SeqCst);
        let pid = *self.live.borrow();
        let Some(pid) = pid else {
            return Ok(());
        };

        // pid 0 means the slot is claimed but the pid is not yet known;
        // the launch consumes the pending stop itself once it is.
        if pid != 0 {
            self.stop_pending.store(false, Ordering::SeqCst);
            send_sigterm(pid);
        }

        let mut rx = self.live.subscribe();
        while rx.borrow_and_update().is_some() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: pid was obtained from our own Child handle. kill(2) with
    // SIGTERM is safe to call on an owned subprocess.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid, error = %err, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(pid: u32) {
    warn!(pid, "graceful termination is not supported on this platform");
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(libc::SIGTERM) => "SIGTERM".to_string(),
        Some(libc::SIGKILL) => "SIGKILL".to_string(),
        Some(libc::SIGINT) => "SIGINT".to_string(),
        Some(n) => format!("signal {n}"),
        None => "unknown signal".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(_status: &std::process::ExitStatus) -> String {
    "unknown signal".to_string()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sh() -> ProcessSupervisor {
        ProcessSupervisor::new("/bin/sh".into())
    }

    fn sh_args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn clean_exit_captures_stdout() {
        let supervisor = sh();
        let out = supervisor
            .launch(&sh_args("echo hello"), true)
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
        assert!(!supervisor.is_live());
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code_and_stderr() {
        let supervisor = sh();
        let err = supervisor
            .launch(&sh_args("echo oops >&2; exit 3"), false)
            .await
            .unwrap_err();
        match err {
            ProcessError::ExitCode { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_launch_fails_fast() {
        let supervisor = std::sync::Arc::new(sh());
        let sup = std::sync::Arc::clone(&supervisor);
        let first = tokio::spawn(async move { sup.launch(&sh_args("exec sleep 5"), false).await });
        // Give the first launch time to claim the slot.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let err = supervisor
            .launch(&sh_args("echo nope"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyLaunched));
        supervisor.stop().await.unwrap();
        let result = first.await.unwrap();
        assert!(matches!(result, Err(ProcessError::Signal { .. })));
    }

    #[tokio::test]
    async fn stop_without_launch_is_noop() {
        let supervisor = sh();
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pending_stop_terminates_the_next_launch() {
        let supervisor = sh();
        // Stop before anything is live: the stop is latched.
        supervisor.stop().await.unwrap();
        let err = supervisor
            .launch(&sh_args("exec sleep 30"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Signal { .. }));
        // The latch is consumed; later launches run normally.
        let out = supervisor.launch(&sh_args("echo ok"), true).await.unwrap();
        assert_eq!(out, "ok\n");
    }

    #[tokio::test]
    async fn stop_terminates_by_signal() {
        let supervisor = std::sync::Arc::new(sh());
        let sup = std::sync::Arc::clone(&supervisor);
        let launched =
            tokio::spawn(async move { sup.launch(&sh_args("exec sleep 30"), false).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        supervisor.stop().await.unwrap();
        let err = launched.await.unwrap().unwrap_err();
        match err {
            ProcessError::Signal { signal } => assert_eq!(signal, "SIGTERM"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_typed() {
        let supervisor = ProcessSupervisor::new("/nonexistent/definitely-missing".into());
        let err = supervisor.launch(&[], false).await.unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
        // The slot is released, so a later launch may be attempted.
        assert!(!supervisor.is_live());
    }

    #[tokio::test]
    async fn line_listener_sees_output() {
        let supervisor = sh();
        let mut lines = supervisor.subscribe_lines();
        supervisor
            .launch(&sh_args("echo one; echo two"), false)
            .await
            .unwrap();
        assert_eq!(lines.recv().await.unwrap(), "one");
        assert_eq!(lines.recv().await.unwrap(), "two");
    }
}
