//! Child process plumbing shared by the IPC and stdio transports.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use botkernel_protocols::KernelError;

use super::TransportEvent;

/// How to launch a module process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub module_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Spawn the process with piped stdio. Stderr lines are logged.
pub(super) fn spawn_child(
    command: &ProcessCommand,
) -> Result<(Child, ChildStdin, ChildStdout), KernelError> {
    info!(
        module_id = %command.module_id,
        program = %command.program.display(),
        "Starting module process"
    );

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .current_dir(&command.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            KernelError::Transport(format!(
                "failed to start {}: {}",
                command.program.display(),
                e
            ))
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| KernelError::Transport("failed to capture stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| KernelError::Transport("failed to capture stdout".to_string()))?;

    if let Some(stderr) = child.stderr.take() {
        let module_id = command.module_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(module_id = %module_id, "[stderr] {}", line);
            }
        });
    }

    Ok((child, stdin, stdout))
}

/// Owner of a running child process.
///
/// A reaper task holds the [`Child`], reports its exit as
/// [`TransportEvent::Exited`] and performs termination on request.
pub(super) struct ChildControl {
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

impl ChildControl {
    /// Start reaping `child`.
    ///
    /// On kill the process receives SIGTERM; with a `grace` window it is
    /// force-killed if still alive afterwards.
    pub(super) fn reap(
        module_id: String,
        mut child: Child,
        events: mpsc::UnboundedSender<TransportEvent>,
        grace: Option<Duration>,
    ) -> Self {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited) = watch::channel(false);

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    debug!(module_id = %module_id, ?code, "Module process exited");
                    let _ = events.send(TransportEvent::Exited(code));
                }
                _ = kill_rx => {
                    terminate(&mut child);
                    match grace {
                        Some(grace) => {
                            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                                warn!(module_id = %module_id, "Module ignored SIGTERM, killing");
                                let _ = child.kill().await;
                            }
                        }
                        None => {
                            let _ = child.wait().await;
                        }
                    }
                    debug!(module_id = %module_id, "Module process terminated");
                }
            }
            exited_tx.send_replace(true);
        });

        Self {
            kill_tx: Mutex::new(Some(kill_tx)),
            exited,
        }
    }

    /// Request termination. With `wait`, resolve once the process is gone.
    pub(super) async fn kill(&self, wait: bool) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
        if wait {
            let mut exited = self.exited.clone();
            let _ = exited.wait_for(|done| *done).await;
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, "SIGTERM failed: {}", e);
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}
