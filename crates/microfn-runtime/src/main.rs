use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use microfn_common::{
    is_valid_handler_name, response, InvocationOutcome, RuntimeKind, SandboxError,
    DEFAULT_HANDLER_NAME, DEFAULT_RUNTIME_TIMEOUT_MS,
};
use microfn_executor::runner_for;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

mod host;
mod registry;
#[cfg(test)]
mod tests;

use host::RuntimeHost;
use registry::{HandlerRegistry, HandlerState};

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    registry: Arc<HandlerRegistry>,
    host: Arc<RuntimeHost>,
    config: Arc<Config>,
}

#[derive(Debug, Clone)]
struct Config {
    port: u16,
    runtime: RuntimeKind,
    code_path: PathBuf,
    handler: String,
    invoke_timeout_ms: u64,
}

impl Config {
    fn from_env() -> Self {
        let runtime = match std::env::var("FUNCTION_RUNTIME") {
            Ok(raw) => match raw.to_ascii_lowercase().as_str() {
                "js" | "javascript" | "node" => RuntimeKind::Js,
                "python" | "py" => RuntimeKind::Python,
                other => {
                    warn!(runtime = other, "unknown runtime, defaulting to python");
                    RuntimeKind::Python
                }
            },
            Err(_) => RuntimeKind::Python,
        };

        let code_path = std::env::var("FUNCTION_CODE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| match runtime {
                RuntimeKind::Js => PathBuf::from("/function/code.js"),
                RuntimeKind::Python => PathBuf::from("/function/code.py"),
            });

        Self {
            port: env_parsed("PORT", 3000),
            runtime,
            code_path,
            handler: std::env::var("FUNCTION_HANDLER")
                .unwrap_or_else(|_| DEFAULT_HANDLER_NAME.to_string()),
            invoke_timeout_ms: env_parsed("MICROFN_INVOKE_TIMEOUT_MS", DEFAULT_RUNTIME_TIMEOUT_MS),
        }
    }
}

fn env_parsed<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(%name, %raw, "unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,microfn_runtime=debug".into()),
        )
        .init();

    let config = Config::from_env();
    let host = Arc::new(RuntimeHost::spawn(config.runtime, &config.code_path).await?);
    let state = AppState {
        registry: Arc::new(HandlerRegistry::new()),
        host,
        config: Arc::new(config.clone()),
    };

    // Best-effort initial load; a missing code file just leaves the
    // registration unloaded until the first write-code.
    let (loaded, error) = load_and_record(&state, &config.handler).await;
    if loaded {
        info!(handler = %config.handler, "loaded function handler at startup");
    } else {
        warn!(error = ?error, "no handler loaded at startup");
    }

    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, runtime = %config.runtime, code_path = %config.code_path.display(), "function runtime listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/invoke", post(invoke_handler))
        .route("/write-code", post(write_code_handler))
        .route("/reload", post(reload_handler))
        .fallback(not_found_handler)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Invocation result as it travels over HTTP, tagged with a request id.
#[derive(Debug, Serialize)]
struct WarmInvokeResponse {
    request_id: String,
    #[serde(flatten)]
    outcome: InvocationOutcome,
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot().await;
    let (handler, loaded_at) = match &snapshot {
        HandlerState::Loaded { handler, loaded_at } => {
            (handler.clone(), Some(loaded_at.to_rfc3339()))
        }
        HandlerState::Unloaded { .. } => (state.config.handler.clone(), None),
    };
    Json(json!({
        "status": "healthy",
        "runtime": state.config.runtime.as_str(),
        "handler": handler,
        "codeLoaded": snapshot.is_loaded(),
        "loadedAt": loaded_at,
        "error": snapshot.error(),
    }))
}

async fn invoke_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> axum::response::Response {
    // The `event` field when present, otherwise the whole body is the event.
    let event = body.get("event").cloned().unwrap_or(body);

    let snapshot = state.registry.snapshot().await;
    if !snapshot.is_loaded() {
        let message = snapshot
            .error()
            .unwrap_or("function not loaded")
            .to_string();
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": message })),
        )
            .into_response();
    }

    let started = Instant::now();
    let limit = Duration::from_millis(state.config.invoke_timeout_ms);
    let run = state.host.invoke(event, limit).await;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    let outcome = match run {
        Ok(reply) if reply.ok => {
            InvocationOutcome::success(response::normalize(reply.result), reply.logs, duration_ms)
        }
        Ok(reply) => {
            let (message, stack) = match reply.error {
                Some(error) => (error.message, error.stack),
                None => ("handler failed without detail".to_string(), None),
            };
            InvocationOutcome::failure(message, stack, reply.logs, duration_ms)
        }
        // The handler keeps running after a timeout; cancellation is
        // cooperative only. Its late reply is dropped by id.
        Err(err @ SandboxError::Timeout { .. }) => {
            InvocationOutcome::failure(err.to_string(), None, Vec::new(), duration_ms)
        }
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "error": err.to_string() })),
            )
                .into_response();
        }
    };

    Json(WarmInvokeResponse {
        request_id: Uuid::new_v4().to_string(),
        outcome,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct WriteCodeRequest {
    #[serde(default)]
    code: String,
    #[serde(default)]
    handler: Option<String>,
}

async fn write_code_handler(
    State(state): State<AppState>,
    Json(request): Json<WriteCodeRequest>,
) -> impl IntoResponse {
    if request.code.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Missing code field" })),
        );
    }
    let handler = request
        .handler
        .unwrap_or_else(|| state.config.handler.clone());
    if !is_valid_handler_name(&handler) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": format!("invalid handler name '{handler}'") })),
        );
    }

    let _guard = state.registry.write_guard().await;

    let code = runner_for(state.config.runtime).ensure_exported(&request.code, &handler);
    if let Some(parent) = state.config.code_path.parent() {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": format!("failed to persist code: {err}") })),
            );
        }
    }
    if let Err(err) = tokio::fs::write(&state.config.code_path, code).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": format!("failed to persist code: {err}") })),
        );
    }

    let (success, error) = load_and_record(&state, &handler).await;
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "success": success, "error": error })))
}

async fn reload_handler(State(state): State<AppState>) -> impl IntoResponse {
    let _guard = state.registry.write_guard().await;

    // Retry the last requested handler name even if its load failed.
    let handler = state
        .registry
        .requested_handler()
        .await
        .unwrap_or_else(|| state.config.handler.clone());

    let (success, error) = load_and_record(&state, &handler).await;
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "success": success, "error": error })))
}

/// Drive one load through the shim and record the resulting registration.
async fn load_and_record(state: &AppState, handler: &str) -> (bool, Option<String>) {
    state.registry.note_requested(handler).await;
    match state.host.load(handler, LOAD_TIMEOUT).await {
        Ok(Ok(())) => {
            state.registry.mark_loaded(handler).await;
            (true, None)
        }
        Ok(Err(message)) => {
            warn!(error = %message, "handler load failed");
            state.registry.mark_unloaded(message.clone()).await;
            (false, Some(message))
        }
        Err(err) => {
            let message = err.to_string();
            warn!(error = %message, "handler load failed at transport level");
            state.registry.mark_unloaded(message.clone()).await;
            (false, Some(message))
        }
    }
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not found",
            "endpoints": {
                "GET /health": "Health check",
                "POST /invoke": "Execute function",
                "POST /write-code": "Replace function code and reload",
                "POST /reload": "Reload function code",
            },
        })),
    )
}
