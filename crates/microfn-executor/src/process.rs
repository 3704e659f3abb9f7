//! Interpreter process launch, combined output capture, and hard timeout.
//!
//! Children are spawned into their own process group so that a timeout can
//! SIGKILL the whole tree; killing only the direct child would leak anything
//! the handler forked.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use microfn_common::{Result, SandboxError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::warn;

pub struct CapturedRun {
    /// stdout and stderr lines merged in arrival order.
    pub lines: Vec<String>,
    pub status: ExitStatus,
}

/// Run `command` to completion, capturing combined output line-by-line.
///
/// On timeout the process group is killed, the child reaped, and a distinct
/// [`SandboxError::Timeout`] returned. Spawn failures surface as transport
/// errors; the caller never needs to special-case a crashed interpreter
/// beyond an absent result document.
pub async fn run_captured(mut command: Command, limit: Duration) -> Result<CapturedRun> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::Transport(format!("failed to spawn interpreter: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Transport("child stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Transport("child stderr not captured".into()))?;

    let collect = async {
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut lines = Vec::new();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line {
                    Ok(Some(line)) => lines.push(line),
                    Ok(None) => out_done = true,
                    Err(err) => {
                        warn!(error = %err, "error reading child stdout");
                        out_done = true;
                    }
                },
                line = err_lines.next_line(), if !err_done => match line {
                    Ok(Some(line)) => lines.push(line),
                    Ok(None) => err_done = true,
                    Err(err) => {
                        warn!(error = %err, "error reading child stderr");
                        err_done = true;
                    }
                },
            }
        }

        let status = child.wait().await?;
        Ok::<_, std::io::Error>((lines, status))
    };

    match tokio::time::timeout(limit, collect).await {
        Ok(Ok((lines, status))) => Ok(CapturedRun { lines, status }),
        Ok(Err(err)) => Err(SandboxError::Transport(format!(
            "failed waiting for interpreter: {err}"
        ))),
        Err(_elapsed) => {
            kill_process_group(&mut child);
            // Reap so the kill cannot leave a zombie behind.
            let _ = child.wait().await;
            Err(SandboxError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}

/// Kill the entire process group of `child` via `killpg(SIGKILL)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that
/// its PGID equals its PID. No-op if the child has already exited.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Ok(pid) = i32::try_from(pid) {
            let pgid = nix::unistd::Pid::from_raw(pid);
            let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    // Without process groups the direct child is the best we can do.
    let _ = child.start_kill();
}
