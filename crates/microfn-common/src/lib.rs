// Shared types for the function invocation sandbox: the request/result
// contract, the error taxonomy, and the result-framing protocol used by
// both the ephemeral gateway and the persistent runtime.

use std::collections::BTreeMap;
use std::fmt::Display;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

pub mod protocol;
pub mod response;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Load Error: {0}")]
    Load(String),

    #[error("invocation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("too many concurrent invocations")]
    Capacity,

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Define the primary Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Interpreter family a handler is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeKind {
    #[serde(rename = "js", alias = "javascript", alias = "node")]
    Js,
    #[serde(rename = "python", alias = "py")]
    Python,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Js => "js",
            RuntimeKind::Python => "python",
        }
    }

    /// Interpreter binary used to run handlers of this kind.
    pub fn interpreter(&self) -> &'static str {
        match self {
            RuntimeKind::Js => "node",
            RuntimeKind::Python => "python3",
        }
    }

    /// File name the user code is materialized under.
    pub fn code_file_name(&self) -> &'static str {
        match self {
            RuntimeKind::Js => "handler.js",
            RuntimeKind::Python => "handler.py",
        }
    }

    /// File name of the generated bootstrap script.
    pub fn runner_file_name(&self) -> &'static str {
        match self {
            RuntimeKind::Js => "runner.js",
            RuntimeKind::Python => "runner.py",
        }
    }
}

impl Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_HANDLER_NAME: &str = "handler";
pub const DEFAULT_GATEWAY_TIMEOUT_MS: u64 = 7_000;
pub const DEFAULT_RUNTIME_TIMEOUT_MS: u64 = 30_000;

/// One request to execute user code against one event. Immutable per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub runtime: RuntimeKind,
    pub code: String,
    #[serde(default)]
    pub event: serde_json::Value,
    #[serde(default = "default_handler_name", alias = "handlerName")]
    pub handler: String,
    #[serde(default = "default_gateway_timeout", alias = "timeoutMs")]
    pub timeout_ms: u64,
}

fn default_handler_name() -> String {
    DEFAULT_HANDLER_NAME.to_string()
}

fn default_gateway_timeout() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_MS
}

impl InvocationRequest {
    /// Request-shape validation. Runs before any process is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(SandboxError::Validation("code must not be empty".into()));
        }
        if !is_valid_handler_name(&self.handler) {
            return Err(SandboxError::Validation(format!(
                "invalid handler name: {:?}",
                self.handler
            )));
        }
        if self.timeout_ms == 0 {
            return Err(SandboxError::Validation(
                "timeoutMs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Handler names are interpolated into generated bootstrap scripts, so they
/// are restricted to identifiers valid in both supported runtimes.
pub fn is_valid_handler_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Normalized handler response. Every handler return value is coerced into
/// this shape (see [`response::normalize`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerResponse {
    #[serde(rename = "statusCode", default = "default_status_code")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_status_code() -> u16 {
    200
}

impl Default for HandlerResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }
}

impl HandlerResponse {
    /// Synthesized 500 response used when the sandboxed side failed in a way
    /// the caller can only observe as a diagnostic body.
    pub fn internal_error(body: impl Into<String>) -> Self {
        Self {
            status_code: 500,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Success,
    Error,
}

/// Error detail carried inline in an [`InvocationOutcome`]. Handler failures
/// are part of the result payload, never a transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// The result of one invocation, cold or warm path alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub status: InvocationStatus,
    pub duration_ms: f64,
    pub response: HandlerResponse,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InvocationError>,
}

impl InvocationOutcome {
    pub fn success(response: HandlerResponse, logs: Vec<String>, duration_ms: f64) -> Self {
        Self {
            status: InvocationStatus::Success,
            duration_ms,
            response,
            logs,
            error: None,
        }
    }

    pub fn failure(
        message: impl Into<String>,
        stack: Option<String>,
        logs: Vec<String>,
        duration_ms: f64,
    ) -> Self {
        let message = message.into();
        Self {
            status: InvocationStatus::Error,
            duration_ms,
            response: HandlerResponse::internal_error(message.clone()),
            logs,
            error: Some(InvocationError { message, stack }),
        }
    }
}

/// Seam between HTTP surfaces and the execution backends.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutcome>;
}
