use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use microfn_common::RuntimeKind;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::host::RuntimeHost;
use crate::registry::HandlerRegistry;
use crate::{create_app, AppState, Config};

struct TestServer {
    app: Router,
    code_dir: tempfile::TempDir,
}

async fn test_server(runtime: RuntimeKind, invoke_timeout_ms: u64) -> TestServer {
    let _ = tracing_subscriber::fmt::try_init();
    let code_dir = tempfile::tempdir().unwrap();
    let code_path = code_dir.path().join(match runtime {
        RuntimeKind::Js => "code.js",
        RuntimeKind::Python => "code.py",
    });
    let host = RuntimeHost::spawn(runtime, &code_path).await.unwrap();
    let config = Config {
        port: 0,
        runtime,
        code_path,
        handler: "handler".into(),
        invoke_timeout_ms,
    };
    let state = AppState {
        registry: Arc::new(HandlerRegistry::new()),
        host: Arc::new(host),
        config: Arc::new(config),
    };
    TestServer {
        app: create_app(state),
        code_dir,
    }
}

fn interpreter_available(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn write_code(app: &Router, code: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(post("/write-code", json!({ "code": code })))
        .await
        .unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

#[tokio::test]
async fn health_starts_unloaded() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    let response = server.app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["runtime"], "python");
    assert_eq!(body["codeLoaded"], false);
}

#[tokio::test]
async fn unknown_route_lists_endpoints() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    let response = server.app.clone().oneshot(get("/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Not found");
    assert!(body["endpoints"]["POST /invoke"].is_string());
}

#[tokio::test]
async fn invoke_before_load_is_a_structured_500() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    let response = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": {} })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn write_code_then_invoke_runs_fresh_code() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    let (status, body) = write_code(&server.app, "def handler(event):\n    return 1\n").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let response = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": {} })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["response"]["statusCode"], 200);
    assert_eq!(body["response"]["body"], "1");
    assert!(body["request_id"].as_str().is_some());

    // A second write must fully replace the first handler.
    let (status, _) = write_code(&server.app, "def handler(event):\n    return 2\n").await;
    assert_eq!(status, StatusCode::OK);

    let response = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": {} })))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["response"]["body"], "2");
}

#[tokio::test]
async fn health_reports_loaded_at_once_loaded() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    let response = server.app.clone().oneshot(get("/health")).await.unwrap();
    assert!(body_json(response).await["loadedAt"].is_null());

    let (status, _) = write_code(&server.app, "def handler(event):\n    return 1\n").await;
    assert_eq!(status, StatusCode::OK);

    let response = server.app.clone().oneshot(get("/health")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["codeLoaded"], true);
    assert!(body["loadedAt"].is_string());
}

#[tokio::test]
async fn reload_retries_the_last_requested_handler_name() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    // A custom-named handler whose first load fails.
    let response = server
        .app
        .clone()
        .oneshot(post(
            "/write-code",
            json!({ "code": "def process(event\n    return 1\n", "handler": "process" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Fix the backing file out of band; reload must retry "process",
    // not fall back to the configured default name.
    tokio::fs::write(
        server.code_dir.path().join("code.py"),
        "def process(event):\n    return \"fixed\"\n",
    )
    .await
    .unwrap();

    let response = server
        .app
        .clone()
        .oneshot(post("/reload", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], true);

    let response = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": {} })))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["response"]["body"], "fixed");
}

#[tokio::test]
async fn bad_code_unloads_and_reports_through_health() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    let (status, _) = write_code(&server.app, "def handler(event):\n    return 1\n").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = write_code(&server.app, "def handler(event\n    return 1\n").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());

    let response = server.app.clone().oneshot(get("/health")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["codeLoaded"], false);
    assert!(body["error"].is_string());

    // The previous handler must not keep serving.
    let response = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": {} })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn missing_code_field_is_rejected() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    let response = server
        .app
        .clone()
        .oneshot(post("/write-code", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Missing code field");
}

#[tokio::test]
async fn whole_body_is_the_event_when_no_event_field() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    let (status, _) =
        write_code(&server.app, "def handler(event):\n    return event[\"x\"]\n").await;
    assert_eq!(status, StatusCode::OK);

    let response = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "x": 7 })))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["response"]["body"], "7");
}

#[tokio::test]
async fn concurrent_invocations_keep_logs_scoped() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 10_000).await;

    let code = r#"
import time
def handler(event):
    print("marker:" + event["marker"])
    time.sleep(0.2)
    return event["marker"]
"#;
    let (status, _) = write_code(&server.app, code).await;
    assert_eq!(status, StatusCode::OK);

    let first = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": { "marker": "alpha" } })));
    let second = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": { "marker": "omega" } })));
    let (first, second) = tokio::join!(first, second);

    let first = body_json(first.unwrap()).await;
    let second = body_json(second.unwrap()).await;

    assert_eq!(first["response"]["body"], "alpha");
    let first_logs = first["logs"].as_array().unwrap();
    assert!(first_logs.contains(&json!("marker:alpha")));
    assert!(!first_logs.contains(&json!("marker:omega")));

    assert_eq!(second["response"]["body"], "omega");
    let second_logs = second["logs"].as_array().unwrap();
    assert!(second_logs.contains(&json!("marker:omega")));
    assert!(!second_logs.contains(&json!("marker:alpha")));
}

#[tokio::test]
async fn hung_handler_times_out_within_bound() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 500).await;

    let code = "import time\ndef handler(event):\n    time.sleep(60)\n";
    let (status, _) = write_code(&server.app, code).await;
    assert_eq!(status, StatusCode::OK);

    let started = Instant::now();
    let response = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": {} })))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("timed out after 500ms"));
}

#[tokio::test]
async fn js_code_without_exports_is_invocable() {
    if !interpreter_available("node") {
        return;
    }
    let server = test_server(RuntimeKind::Js, 5_000).await;

    let code = r#"
async function handler(event) {
    console.log("js marker");
    return { statusCode: 200, body: "from js" };
}
"#;
    let (status, body) = write_code(&server.app, code).await;
    assert_eq!(status, StatusCode::OK, "load failed: {body}");

    let response = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": {} })))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["response"]["body"], "from js");
    assert!(body["logs"]
        .as_array()
        .unwrap()
        .contains(&json!("js marker")));
}

#[tokio::test]
async fn reload_picks_up_changed_file() {
    if !interpreter_available("python3") {
        return;
    }
    let server = test_server(RuntimeKind::Python, 5_000).await;

    let (status, _) = write_code(&server.app, "def handler(event):\n    return \"old\"\n").await;
    assert_eq!(status, StatusCode::OK);

    // Mutate the backing file out of band, then reload.
    let response = server.app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(body_json(response).await["codeLoaded"], true);

    let server_state_path = server.code_dir.path().join("code.py");
    tokio::fs::write(&server_state_path, "def handler(event):\n    return \"new\"\n")
        .await
        .unwrap();

    let response = server
        .app
        .clone()
        .oneshot(post("/reload", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], true);

    let response = server
        .app
        .clone()
        .oneshot(post("/invoke", json!({ "event": {} })))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["response"]["body"], "new");
}
