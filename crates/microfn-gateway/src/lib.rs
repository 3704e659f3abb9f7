// API types for the invocation gateway

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use microfn_common::{
    HandlerResponse, InvocationError, InvocationOutcome, InvocationStatus, SandboxError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Too many requests")]
    TooManyRequests,
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Validation(msg) => ApiError::BadRequest(msg),
            SandboxError::Capacity => ApiError::TooManyRequests,
            // Timeout keeps its distinct message through the Internal wrapper.
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "ok": false, "error": { "message": self.to_string() } });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Wire shape of a completed invocation, success or handler failure alike.
/// Handler failures still travel as HTTP 200; only gateway-level errors
/// ([`ApiError`]) change the transport status.
#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub request_id: String,
    pub ok: bool,
    pub response: HandlerResponse,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<InvocationError>,
    pub duration_ms: f64,
}

impl From<InvocationOutcome> for InvokeResponse {
    fn from(outcome: InvocationOutcome) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            ok: outcome.status == InvocationStatus::Success,
            response: outcome.response,
            logs: outcome.logs,
            error: outcome.error,
            duration_ms: outcome.duration_ms,
        }
    }
}
