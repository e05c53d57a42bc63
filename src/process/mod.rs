//! Process supervision for the query server child process.
//!
//! The supervisor owns the worker process below the RPC layer: spawn with a
//! resolved executable path and arguments, detect unexpected exit, and kill
//! the whole process tree when a graceful stop is refused. Graceful shutdown
//! itself travels over the RPC layer and is coordinated by the query server
//! client; this module only provides the bounded wait and the hard kill.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::watch;

/// Result type for supervisor operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors that can occur while supervising the server process.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The executable is missing, unauthorized, or otherwise unspawnable.
    /// Fatal to this start attempt; the configuration must be fixed.
    #[error("failed to spawn query server process: {0}")]
    Spawn(#[source] io::Error),

    /// The spawned process exposed no pid or stdio handles.
    #[error("query server process started without {0}")]
    MissingHandle(&'static str),
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExitInfo {
    /// Exit code, if the process terminated normally.
    pub code: Option<i32>,
    /// Terminating signal, on Unix.
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Callback invoked once when the process exits, with its exit status.
pub type ExitCallback = Box<dyn FnOnce(ExitInfo) + Send + 'static>;

/// Portable "terminate the whole process tree" handle.
///
/// On Unix the child is spawned as its own process group leader, so the tree
/// dies with one `killpg`. Elsewhere we fall back to the pid tracked at spawn
/// time and the platform task killer.
#[derive(Debug, Clone, Copy)]
pub struct ProcessGroup {
    pid: u32,
}

impl ProcessGroup {
    #[cfg(unix)]
    pub fn terminate_tree(&self) {
        unsafe {
            libc::killpg(self.pid as i32, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    pub fn terminate_tree(&self) {
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &self.pid.to_string()])
            .output();
    }
}

/// A running query server process.
pub struct SupervisedProcess {
    pid: u32,
    group: ProcessGroup,
    alive: Arc<AtomicBool>,
    stdio: Option<(ChildStdin, ChildStdout)>,
    exit: watch::Receiver<Option<ExitInfo>>,
    _watch_task: tokio::task::JoinHandle<()>,
}

/// Spawn the server executable with piped stdio.
///
/// `on_exit` fires exactly once, from a background task, as soon as the
/// process exits for any reason -- crash, kill, or clean shutdown.
pub fn spawn(
    program: &Path,
    args: &[String],
    env: &[(String, String)],
    on_exit: ExitCallback,
) -> ProcessResult<SupervisedProcess> {
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(ProcessError::Spawn)?;

    let pid = child.id().ok_or(ProcessError::MissingHandle("a pid"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or(ProcessError::MissingHandle("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(ProcessError::MissingHandle("stdout"))?;

    let alive = Arc::new(AtomicBool::new(true));
    let (exit_tx, exit_rx) = watch::channel(None);

    let watch_task = tokio::spawn({
        let alive = alive.clone();
        async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    tracing::warn!(error = %e, "could not observe query server exit");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            // Callback first: anyone who observes the process as exited --
            // via `is_alive` or `wait_exited` -- sees the died-handler's
            // effects already applied.
            on_exit(info);
            alive.store(false, Ordering::SeqCst);
            let _ = exit_tx.send(Some(info));
        }
    });

    Ok(SupervisedProcess {
        pid,
        group: ProcessGroup { pid },
        alive,
        stdio: Some((stdin, stdout)),
        exit: exit_rx,
        _watch_task: watch_task,
    })
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Take the stdio pair for the transport. Available exactly once.
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        self.stdio.take()
    }

    /// Wait up to `timeout` for the process to exit. Returns whether it did.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        if !self.is_alive() {
            return true;
        }
        let mut exit = self.exit.clone();
        tokio::time::timeout(timeout, async move {
            loop {
                if exit.borrow().is_some() {
                    return;
                }
                if exit.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// The exit status, if the process has exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Forcibly terminate the process and its descendants. No-op once the
    /// process has exited.
    pub fn terminate_tree(&self) {
        if self.is_alive() {
            tracing::debug!(pid = self.pid, "terminating query server process tree");
            self.group.terminate_tree();
        }
    }
}
