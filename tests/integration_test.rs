//! Integration tests for llamactl using mock inference servers.
//!
//! These tests drive the real app (router + management API) and spawn
//! actual mock-server child processes through the registry.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use llamactl::{Config, Registry};
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

/// Port allocator for instances. Starts high to avoid system services.
static NEXT_PORT: AtomicU16 = AtomicU16::new(22000);

fn allocate_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.instances.state_dir = dir.path().join("state");
    config.instances.log_dir = dir.path().join("logs");
    config.instances.max_running_instances = 2;
    config.instances.start_timeout_seconds = 30;
    config.instances.default_restart_delay_seconds = 1;
    config.instances.llama_executable = env!("CARGO_BIN_EXE_mock-server").to_string();
    config.instances.mlx_executable = env!("CARGO_BIN_EXE_mock-server").to_string();
    config
}

async fn build_test_app(config: Config) -> (Router, Arc<Registry>) {
    llamactl::build_app(config).await.expect("build_app failed")
}

/// Options body for creating an instance backed by the mock server.
fn options_body(port: u16, extra_args: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "port": port,
        "host": "127.0.0.1",
        "backend_type": "llama_cpp",
        "backend_options": {
            "model": "/models/test.gguf",
            "extra_args": extra_args
        }
    })
}

async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

async fn create_instance(app: &Router, name: &str, options: serde_json::Value) {
    let (status, _) = send_json(
        app,
        "POST",
        &format!("/api/v1/instances/{}", name),
        Some(options),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create {} failed", name);
}

async fn instance_status(app: &Router, name: &str) -> serde_json::Value {
    let (status, json) = send_json(app, "GET", &format!("/api/v1/instances/{}", name), None).await;
    assert_eq!(status, StatusCode::OK);
    json
}

async fn chat(app: &Router, model: &str) -> (StatusCode, serde_json::Value) {
    send_json(
        app,
        "POST",
        "/v1/chat/completions",
        Some(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hello"}]
        })),
    )
    .await
}

/// Poll the instance status until `pred` holds or the timeout expires.
async fn wait_for_status<F>(app: &Router, name: &str, timeout: Duration, pred: F) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let status = instance_status(app, name).await;
        if pred(&status) {
            return status;
        }
        if std::time::Instant::now() >= deadline {
            panic!("timed out waiting for {} to reach state, last: {}", name, status);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
#[serial]
async fn test_create_and_route_on_demand() {
    let dir = TempDir::new().unwrap();
    let (app, registry) = build_test_app(test_config(&dir)).await;

    let port = allocate_port();
    create_instance(&app, "small", options_body(port, &[])).await;

    // Instance is created stopped; routing starts it on demand
    let status = instance_status(&app, "small").await;
    assert_eq!(status["running"], false);

    let (status_code, json) = chat(&app, "small").await;
    assert_eq!(status_code, StatusCode::OK);
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["model"], "small");
    assert!(
        json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap()
            .contains("hello")
    );

    let status = instance_status(&app, "small").await;
    assert_eq!(status["running"], true);
    assert!(status["last_used_at"].is_string());

    registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
#[serial]
async fn test_cap_with_lru_eviction() {
    let dir = TempDir::new().unwrap();
    let (app, registry) = build_test_app(test_config(&dir)).await;

    create_instance(&app, "a", options_body(allocate_port(), &[])).await;
    create_instance(&app, "b", options_body(allocate_port(), &[])).await;
    create_instance(&app, "c", options_body(allocate_port(), &[])).await;

    // Use a then b so a is the least recently used
    let (status, _) = chat(&app, "a").await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let (status, _) = chat(&app, "b").await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Cap is 2: routing to c evicts a
    let (status, _) = chat(&app, "c").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(instance_status(&app, "a").await["running"], false);
    assert_eq!(instance_status(&app, "b").await["running"], true);
    assert_eq!(instance_status(&app, "c").await["running"], true);

    registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
#[serial]
async fn test_crash_restart_stops_at_max_restarts() {
    let dir = TempDir::new().unwrap();
    let (app, registry) = build_test_app(test_config(&dir)).await;

    let mut options = options_body(allocate_port(), &["--exit-after-ms", "100"]);
    options["auto_restart"] = serde_json::json!(true);
    options["max_restarts"] = serde_json::json!(2);
    options["restart_delay_seconds"] = serde_json::json!(1);
    create_instance(&app, "crashy", options).await;

    let (status, _) = send_json(&app, "POST", "/api/v1/instances/crashy/start", None).await;
    assert_eq!(status, StatusCode::OK);

    // Two automatic restarts, then the instance stays stopped
    wait_for_status(&app, "crashy", Duration::from_secs(15), |s| {
        s["restarts"] == 2 && s["running"] == false
    })
    .await;

    // Give a would-be third restart time to (incorrectly) fire
    tokio::time::sleep(Duration::from_millis(2000)).await;
    let status = instance_status(&app, "crashy").await;
    assert_eq!(status["restarts"], 2);
    assert_eq!(status["running"], false);

    // One initial start plus exactly two restarts hit the log, and the
    // final crash records why no third restart happened
    let (status_code, _) = send_json(&app, "GET", "/api/v1/instances/crashy/logs?lines=0", None).await;
    assert_eq!(status_code, StatusCode::OK);
    let log = tokio::fs::read_to_string(dir.path().join("logs/crashy.log"))
        .await
        .unwrap();
    assert_eq!(log.matches("started at").count(), 3);
    assert_eq!(log.matches("exceeded max restart attempts").count(), 1);

    registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
#[serial]
async fn test_stop_cancels_pending_restart() {
    let dir = TempDir::new().unwrap();
    let (app, registry) = build_test_app(test_config(&dir)).await;

    let mut options = options_body(allocate_port(), &["--exit-after-ms", "100"]);
    options["auto_restart"] = serde_json::json!(true);
    options["max_restarts"] = serde_json::json!(5);
    options["restart_delay_seconds"] = serde_json::json!(2);
    create_instance(&app, "flaky", options).await;

    let (status, _) = send_json(&app, "POST", "/api/v1/instances/flaky/start", None).await;
    assert_eq!(status, StatusCode::OK);

    // Wait for the crash to be observed and the restart timer armed
    wait_for_status(&app, "flaky", Duration::from_secs(10), |s| {
        s["restarts"] == 1 && s["running"] == false
    })
    .await;

    // Stop cancels the pending restart; the instance is already stopped so
    // the call itself reports a conflict
    let (status, _) = send_json(&app, "POST", "/api/v1/instances/flaky/stop", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Past the restart delay: no new child was spawned
    tokio::time::sleep(Duration::from_millis(3000)).await;
    let status = instance_status(&app, "flaky").await;
    assert_eq!(status["running"], false);
    assert_eq!(status["restarts"], 1);

    let log = tokio::fs::read_to_string(dir.path().join("logs/flaky.log"))
        .await
        .unwrap();
    assert_eq!(log.matches("started at").count(), 1);
    assert!(log.contains("Restart cancelled"));

    registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
#[serial]
async fn test_unknown_model_is_404() {
    let dir = TempDir::new().unwrap();
    let (app, _registry) = build_test_app(test_config(&dir)).await;

    let (status, json) = chat(&app, "nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(
        json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not found")
    );
}

#[tokio::test]
#[serial]
async fn test_missing_model_is_400() {
    let dir = TempDir::new().unwrap();
    let (app, _registry) = build_test_app(test_config(&dir)).await;

    let (status, _) = send_json(
        &app,
        "POST",
        "/v1/chat/completions",
        Some(serde_json::json!({"messages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[serial]
async fn test_readiness_timeout_is_503() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.instances.start_timeout_seconds = 2;
    let (app, registry) = build_test_app(config).await;

    create_instance(&app, "slow", options_body(allocate_port(), &["--unhealthy"])).await;

    let (status, _) = chat(&app, "slow").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // The child is alive, it just never became ready
    let status = instance_status(&app, "slow").await;
    assert_eq!(status["running"], true);

    registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
#[serial]
async fn test_on_demand_disabled_is_503() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.instances.on_demand_start = false;
    let (app, _registry) = build_test_app(config).await;

    create_instance(&app, "manual", options_body(allocate_port(), &[])).await;

    let (status, _) = chat(&app, "manual").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(instance_status(&app, "manual").await["running"], false);
}

#[tokio::test]
#[serial]
async fn test_models_endpoint_lists_instances() {
    let dir = TempDir::new().unwrap();
    let (app, _registry) = build_test_app(test_config(&dir)).await;

    create_instance(&app, "alpha", options_body(allocate_port(), &[])).await;
    create_instance(&app, "beta", options_body(allocate_port(), &[])).await;

    let (status, json) = send_json(&app, "GET", "/v1/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["object"], "list");

    let ids: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["alpha", "beta"]);
}

#[tokio::test]
#[serial]
async fn test_capacity_exceeded_without_eviction() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.instances.max_running_instances = 1;
    config.instances.enable_lru_eviction = false;
    let (app, registry) = build_test_app(config).await;

    create_instance(&app, "a", options_body(allocate_port(), &[])).await;
    create_instance(&app, "b", options_body(allocate_port(), &[])).await;

    let (status, _) = send_json(&app, "POST", "/api/v1/instances/a/start", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send_json(&app, "POST", "/api/v1/instances/b/start", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].as_str().unwrap().contains("maximum"));

    assert_eq!(instance_status(&app, "a").await["running"], true);
    assert_eq!(instance_status(&app, "b").await["running"], false);

    registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
#[serial]
async fn test_restore_last_state_restarts_instances() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.instances.restore_last_state = true;

    // A snapshot left behind by a previous run, desired-running
    let port = allocate_port();
    std::fs::create_dir_all(dir.path().join("state/instances")).unwrap();
    let snapshot = serde_json::json!({
        "name": "warm",
        "running": true,
        "options": {
            "auto_restart": true,
            "max_restarts": 3,
            "restart_delay_seconds": 5,
            "host": "127.0.0.1",
            "port": port,
            "backend_type": "llama_cpp",
            "backend_options": { "model": "/models/test.gguf" }
        }
    });
    std::fs::write(
        dir.path().join("state/instances/warm.json"),
        serde_json::to_vec_pretty(&snapshot).unwrap(),
    )
    .unwrap();

    let (app, registry) = build_test_app(config).await;

    let status = wait_for_status(&app, "warm", Duration::from_secs(10), |s| {
        s["running"] == true
    })
    .await;
    assert_eq!(status["name"], "warm");

    // And it actually serves requests once the child has bound its port
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, _) = chat(&app, "warm").await;
        if status == StatusCode::OK {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "restored instance never became reachable"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
#[serial]
async fn test_stop_then_delete() {
    let dir = TempDir::new().unwrap();
    let (app, registry) = build_test_app(test_config(&dir)).await;

    create_instance(&app, "ephemeral", options_body(allocate_port(), &[])).await;

    let (status, _) = chat(&app, "ephemeral").await;
    assert_eq!(status, StatusCode::OK);

    // Delete while running conflicts
    let (status, _) = send_json(&app, "DELETE", "/api/v1/instances/ephemeral", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send_json(&app, "POST", "/api/v1/instances/ephemeral/stop", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(&app, "DELETE", "/api/v1/instances/ephemeral", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send_json(&app, "GET", "/api/v1/instances/ephemeral", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!dir.path().join("state/instances/ephemeral.json").exists());

    registry.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
#[serial]
async fn test_logs_contain_markers_and_child_output() {
    let dir = TempDir::new().unwrap();
    let (app, registry) = build_test_app(test_config(&dir)).await;

    create_instance(&app, "chatty", options_body(allocate_port(), &[])).await;

    let (status, _) = chat(&app, "chatty").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(&app, "POST", "/api/v1/instances/chatty/stop", None).await;
    assert_eq!(status, StatusCode::OK);

    let log = tokio::fs::read_to_string(dir.path().join("logs/chatty.log"))
        .await
        .unwrap();
    assert!(log.contains("=== Instance chatty started at"));
    assert!(log.contains("=== Instance chatty stopped at"));
    // The mock prints its READY handshake on stdout; the drainer copies it
    assert!(log.contains("READY"));

    registry.shutdown(Duration::from_secs(5)).await;
}
