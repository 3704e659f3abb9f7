//! Warm interpreter supervision.
//!
//! The server keeps exactly one interpreter child alive, running a generated
//! host shim that holds the loaded handler and speaks newline-delimited JSON
//! over stdin/stdout. Requests carry a numeric id; a background reader task
//! routes each response line to the caller waiting on that id. A response
//! arriving after its caller timed out finds no waiter and is dropped, so
//! stale results can never be attributed to a later invocation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use microfn_common::{InvocationError, Result, RuntimeKind, SandboxError};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

const PYTHON_HOST: &str = include_str!("../templates/host.py");
const NODE_HOST: &str = include_str!("../templates/host.js");

/// One response line from the shim.
#[derive(Debug, Deserialize)]
pub struct ShimReply {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<InvocationError>,
    #[serde(default)]
    pub logs: Vec<String>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ShimReply>>>>;

pub struct RuntimeHost {
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    // Held so kill_on_drop tears the interpreter down with the host.
    _child: Child,
    // Keeps the generated shim file alive for the child's lifetime.
    _shim_dir: tempfile::TempDir,
}

impl RuntimeHost {
    /// Spawn the warm interpreter with a freshly materialized shim.
    pub async fn spawn(runtime: RuntimeKind, code_path: &Path) -> Result<Self> {
        let shim_dir = tempfile::Builder::new()
            .prefix("microfn-host-")
            .tempdir()
            .map_err(|e| SandboxError::Transport(format!("failed to create shim dir: {e}")))?;

        let (shim_name, shim_source) = match runtime {
            RuntimeKind::Js => ("host.js", NODE_HOST),
            RuntimeKind::Python => ("host.py", PYTHON_HOST),
        };
        let shim_path = shim_dir.path().join(shim_name);
        tokio::fs::write(&shim_path, shim_source).await?;

        let mut child = Command::new(runtime.interpreter())
            .arg(&shim_path)
            .env("MICROFN_CODE_PATH", code_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Transport(format!("failed to spawn warm interpreter: {e}"))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Transport("shim stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Transport("shim stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Transport("shim stderr not captured".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(route_replies(stdout, pending.clone()));
        tokio::spawn(forward_shim_stderr(stderr));

        info!(runtime = %runtime, code_path = %code_path.display(), "warm interpreter started");

        Ok(Self {
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            _child: child,
            _shim_dir: shim_dir,
        })
    }

    /// Ask the shim to (re)load the code file and resolve `handler`.
    /// Returns the shim's error message on failure.
    pub async fn load(&self, handler: &str, limit: Duration) -> Result<std::result::Result<(), String>> {
        let reply = self
            .request(json!({ "op": "load", "handler": handler }), limit)
            .await?;
        if reply.ok {
            Ok(Ok(()))
        } else {
            let message = reply
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "load failed without detail".into());
            Ok(Err(message))
        }
    }

    /// Run one invocation through the warm handler.
    pub async fn invoke(&self, event: Value, limit: Duration) -> Result<ShimReply> {
        self.request(json!({ "op": "invoke", "event": event }), limit)
            .await
    }

    async fn request(&self, mut body: Value, limit: Duration) -> Result<ShimReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        body["id"] = json!(id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut line = serde_json::to_vec(&body)?;
        line.push(b'\n');
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(err) = stdin.write_all(&line).await {
                self.pending.lock().await.remove(&id);
                return Err(SandboxError::Transport(format!(
                    "failed writing to warm interpreter: {err}"
                )));
            }
            if let Err(err) = stdin.flush().await {
                self.pending.lock().await.remove(&id);
                return Err(SandboxError::Transport(format!(
                    "failed writing to warm interpreter: {err}"
                )));
            }
        }

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                // Reader task gone: the interpreter exited or closed stdout.
                self.pending.lock().await.remove(&id);
                Err(SandboxError::Transport(
                    "warm interpreter closed its output stream".into(),
                ))
            }
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                Err(SandboxError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }
}

async fn route_replies(stdout: tokio::process::ChildStdout, pending: PendingMap) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let reply: ShimReply = match serde_json::from_str(&line) {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(error = %err, "unparseable line from warm interpreter");
                        continue;
                    }
                };
                match pending.lock().await.remove(&reply.id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(id = reply.id, "dropping stale shim reply"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "error reading warm interpreter output");
                break;
            }
        }
    }
    // Wake every waiter with a closed channel rather than letting them hang.
    pending.lock().await.clear();
    warn!("warm interpreter output stream closed");
}

async fn forward_shim_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "microfn_runtime::shim", "{line}");
    }
}
