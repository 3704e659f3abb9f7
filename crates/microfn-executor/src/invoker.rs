//! The cold-path invoker: materialize, spawn, demultiplex, reclaim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use microfn_common::protocol::{self, DemuxedOutput};
use microfn_common::{
    response, FunctionExecutor, InvocationError, InvocationOutcome, InvocationRequest, Result,
    SandboxError,
};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::process::{run_captured, CapturedRun};
use crate::runner::runner_for;
use crate::workspace::EphemeralWorkspace;

pub const DEFAULT_MAX_CONCURRENCY: usize = 32;

#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Upper bound on live interpreter processes.
    pub max_concurrency: usize,
    /// Root directory for ephemeral workspaces; system temp when unset.
    pub workspace_root: Option<std::path::PathBuf>,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            workspace_root: None,
        }
    }
}

/// Result document emitted by a bootstrap script. Load and handler failures
/// are caught inside the bootstrap and reported through the same shape, so
/// the parent handles every child outcome uniformly.
#[derive(Debug, Deserialize)]
struct RunnerDocument {
    ok: bool,
    #[serde(default)]
    response: serde_json::Value,
    #[serde(default)]
    error: Option<InvocationError>,
}

/// One-process-per-invocation executor.
///
/// Invocations share no mutable state; isolation is total by construction.
/// A semaphore bounds the number of live interpreter processes — when it is
/// exhausted new work is rejected with [`SandboxError::Capacity`] rather
/// than queued, keeping latency bounded under bursts.
pub struct Invoker {
    permits: Arc<Semaphore>,
    workspace_root: Option<std::path::PathBuf>,
}

impl Invoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            workspace_root: config.workspace_root,
        }
    }

    #[instrument(skip(self, request), fields(runtime = %request.runtime, handler = %request.handler))]
    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutcome> {
        request.validate()?;

        let _permit = self
            .permits
            .try_acquire()
            .map_err(|_| SandboxError::Capacity)?;

        let started = Instant::now();
        let workspace = match &self.workspace_root {
            Some(root) => EphemeralWorkspace::create_in(root)?,
            None => EphemeralWorkspace::create()?,
        };

        let run = self.run_in_workspace(&request, &workspace).await;
        let result_doc = match &run {
            Ok(_) => read_result_file(&workspace).await,
            Err(_) => None,
        };

        // Unconditional reclamation: success, handler failure, transport
        // failure, and timeout all pass through here.
        workspace.reclaim().await;

        let captured = run?;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let outcome = assemble_outcome(captured, result_doc, duration_ms);
        info!(
            status = ?outcome.status,
            duration_ms = outcome.duration_ms,
            "invocation finished"
        );
        Ok(outcome)
    }

    async fn run_in_workspace(
        &self,
        request: &InvocationRequest,
        workspace: &EphemeralWorkspace,
    ) -> Result<CapturedRun> {
        let runner = runner_for(request.runtime);

        workspace
            .write_file(request.runtime.code_file_name(), &request.code)
            .await?;
        workspace
            .write_file("event.json", serde_json::to_vec(&request.event)?)
            .await?;
        workspace
            .write_file(
                request.runtime.runner_file_name(),
                runner.bootstrap(&request.handler),
            )
            .await?;

        let mut command = Command::new(request.runtime.interpreter());
        command
            .arg(request.runtime.runner_file_name())
            .current_dir(workspace.path());

        run_captured(command, Duration::from_millis(request.timeout_ms)).await
    }
}

async fn read_result_file(workspace: &EphemeralWorkspace) -> Option<String> {
    tokio::fs::read_to_string(workspace.result_path()).await.ok()
}

/// Combine captured output and the result document into one outcome.
///
/// The out-of-band result file is authoritative; a sentinel-framed result on
/// the combined stream is honored when the file is absent. A missing or
/// unparseable document degrades to a synthesized 500, never to an error
/// propagated at the transport level.
fn assemble_outcome(
    captured: CapturedRun,
    result_doc: Option<String>,
    duration_ms: f64,
) -> InvocationOutcome {
    let DemuxedOutput {
        logs,
        framed_result,
    } = protocol::demux_lines(&captured.lines);

    let raw = result_doc.or(framed_result);
    let document = raw.as_deref().map(serde_json::from_str::<RunnerDocument>);

    match document {
        Some(Ok(doc)) if doc.ok => {
            InvocationOutcome::success(response::normalize(doc.response), logs, duration_ms)
        }
        Some(Ok(doc)) => {
            let error = doc.error.unwrap_or_else(|| InvocationError {
                message: "handler failed without detail".into(),
                stack: None,
            });
            InvocationOutcome::failure(error.message, error.stack, logs, duration_ms)
        }
        Some(Err(err)) => {
            warn!(error = %err, "malformed result document from sandbox");
            InvocationOutcome::failure(
                format!("malformed result from sandbox: {err}"),
                None,
                logs,
                duration_ms,
            )
        }
        None => InvocationOutcome::failure(
            format!(
                "sandbox produced no result (interpreter exited with {})",
                captured.status
            ),
            None,
            logs,
            duration_ms,
        ),
    }
}

#[async_trait]
impl FunctionExecutor for Invoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutcome> {
        Invoker::invoke(self, request).await
    }
}
