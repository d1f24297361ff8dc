//! Mock inference server for testing llamactl.
//!
//! Accepts llama-server-style flags (ignoring the tuning ones) so it can
//! stand in for a real backend when `llama_executable` points at it.
//! Failure injection flags let tests exercise crash-restart and readiness
//! timeouts; they are passed through the instance's `extra_args`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-server")]
#[command(about = "Mock inference server for testing")]
struct Args {
    /// Model path (llama-server style)
    #[arg(long, default_value = "mock-model")]
    model: String,

    /// Host to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "8001")]
    port: u16,

    // Tuning flags accepted and ignored for llama-server compatibility
    #[arg(long)]
    #[allow(dead_code)]
    ctx_size: Option<u32>,

    #[arg(long)]
    #[allow(dead_code)]
    n_gpu_layers: Option<i32>,

    #[arg(long)]
    #[allow(dead_code)]
    threads: Option<u32>,

    #[arg(long)]
    #[allow(dead_code)]
    flash_attn: bool,

    /// Artificial startup delay before binding (ms)
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Artificial latency for responses (ms)
    #[arg(long, default_value = "10")]
    latency_ms: u64,

    /// Exit with --exit-code after this many milliseconds (0 disables)
    #[arg(long, default_value = "0")]
    exit_after_ms: u64,

    /// Exit code used with --exit-after-ms
    #[arg(long, default_value = "1")]
    exit_code: i32,

    /// Never report ready: /health returns 503
    #[arg(long)]
    unhealthy: bool,
}

struct MockState {
    model: String,
    latency: Duration,
    unhealthy: bool,
    request_count: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_server=info")
        .init();

    let args = Args::parse();

    if args.startup_delay_ms > 0 {
        info!(delay_ms = args.startup_delay_ms, "Simulating startup delay");
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    if args.exit_after_ms > 0 {
        let delay = args.exit_after_ms;
        let code = args.exit_code;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            info!(code, "Exiting as requested by --exit-after-ms");
            std::process::exit(code);
        });
    }

    let state = Arc::new(MockState {
        model: args.model.clone(),
        latency: Duration::from_millis(args.latency_ms),
        unhealthy: args.unhealthy,
        request_count: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .route("/stats", get(stats))
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    let actual_port = listener.local_addr()?.port();

    info!(model = %args.model, port = actual_port, "Mock server listening");

    // Signal readiness to stdout for test harness
    println!("READY {}", actual_port);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

#[derive(Deserialize)]
struct ChatCompletionRequest {
    model: String,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Deserialize, Serialize)]
struct Message {
    role: String,
    content: String,
}

async fn chat_completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Json<serde_json::Value> {
    tokio::time::sleep(state.latency).await;
    let count = state.request_count.fetch_add(1, Ordering::SeqCst) + 1;

    let content = format!(
        "Mock response from {} (request #{}): You said \"{}\"",
        state.model,
        count,
        request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    );

    Json(serde_json::json!({
        "id": format!("chatcmpl-mock-{}", count),
        "object": "chat.completion",
        "created": 0,
        "model": request.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 }
    }))
}

#[derive(Deserialize)]
struct CompletionRequest {
    model: String,
    #[serde(default)]
    prompt: String,
}

async fn completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CompletionRequest>,
) -> Json<serde_json::Value> {
    tokio::time::sleep(state.latency).await;
    let count = state.request_count.fetch_add(1, Ordering::SeqCst) + 1;

    Json(serde_json::json!({
        "id": format!("cmpl-mock-{}", count),
        "object": "text_completion",
        "created": 0,
        "model": request.model,
        "choices": [{
            "index": 0,
            "text": format!("Mock completion of \"{}\"", request.prompt),
            "finish_reason": "stop"
        }]
    }))
}

#[derive(Deserialize)]
struct EmbeddingRequest {
    model: String,
}

async fn embeddings(
    State(state): State<Arc<MockState>>,
    Json(request): Json<EmbeddingRequest>,
) -> Json<serde_json::Value> {
    tokio::time::sleep(state.latency).await;
    state.request_count.fetch_add(1, Ordering::SeqCst);

    Json(serde_json::json!({
        "object": "list",
        "model": request.model,
        "data": [{ "object": "embedding", "index": 0, "embedding": [0.0, 0.0, 0.0, 0.0] }]
    }))
}

async fn list_models(State(state): State<Arc<MockState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "object": "list",
        "data": [{ "id": state.model, "object": "model", "owned_by": "mock-server" }]
    }))
}

async fn stats(State(state): State<Arc<MockState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "model": state.model,
        "request_count": state.request_count.load(Ordering::SeqCst)
    }))
}
