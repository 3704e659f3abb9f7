use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    extract::State,
    routing::{get, post},
    Json, Router,
};
use microfn_common::{FunctionExecutor, InvocationRequest};
use microfn_executor::{Invoker, InvokerConfig, DEFAULT_MAX_CONCURRENCY};
use microfn_gateway::{ApiError, InvokeResponse};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};


#[derive(Clone)]
struct AppState {
    executor: Arc<dyn FunctionExecutor>,
}

#[derive(Debug, Clone)]
struct Config {
    port: u16,
    max_concurrency: usize,
    workspace_root: Option<PathBuf>,
}

impl Config {
    fn from_env() -> Self {
        Self {
            port: env_parsed("MICROFN_PORT", 8090),
            max_concurrency: env_parsed("MICROFN_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY),
            workspace_root: std::env::var("MICROFN_WORKSPACE_ROOT")
                .ok()
                .map(PathBuf::from),
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
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,microfn_gateway_server=debug".into()),
        )
        .init();

    let config = Config::from_env();
    let state = AppState {
        executor: Arc::new(Invoker::new(InvokerConfig {
            max_concurrency: config.max_concurrency,
            workspace_root: config.workspace_root.clone(),
        })),
    };

    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, max_concurrency = config.max_concurrency, "invocation gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/invoke", post(invoke_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn invoke_handler(
    State(state): State<AppState>,
    body: Result<Json<InvocationRequest>, JsonRejection>,
) -> Result<Json<InvokeResponse>, ApiError> {
    // Malformed bodies (bad JSON, unknown runtime, missing fields) are
    // validation failures, not an unprocessable-entity class of their own.
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let outcome = state.executor.invoke(request).await?;
    Ok(Json(outcome.into()))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "runtimes": ["js", "python"],
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
