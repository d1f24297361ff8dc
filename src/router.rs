//! OpenAI-compatible inference surface.
//!
//! Routes requests by their `model` field to the matching instance,
//! starting it on demand (through registry admission) and waiting for the
//! child to become ready before forwarding.

use crate::config::Config;
use crate::instance::{Instance, InstanceError};
use crate::registry::{Registry, RegistryError};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::routing::{get, post};
use bytes::Bytes;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Backoff bounds for the readiness poll.
const READY_POLL_INITIAL: Duration = Duration::from_millis(100);
const READY_POLL_CAP: Duration = Duration::from_secs(2);
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RouterState {
    registry: Arc<Registry>,
    on_demand_start: bool,
    health_check_path: String,
    start_timeout: Duration,
}

impl RouterState {
    pub fn new(registry: Arc<Registry>, config: &Config) -> Self {
        Self {
            registry,
            on_demand_start: config.instances.on_demand_start,
            health_check_path: config.instances.health_check_path.clone(),
            start_timeout: Duration::from_secs(config.instances.start_timeout_seconds),
        }
    }
}

pub fn routes(state: RouterState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(route_inference))
        .route("/v1/completions", post(route_inference))
        .route("/v1/embeddings", post(route_inference))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// OpenAI-style model list: the union of registered instance names.
async fn list_models(State(state): State<RouterState>) -> Response<Body> {
    let data: Vec<_> = state
        .registry
        .list()
        .iter()
        .map(|instance| {
            serde_json::json!({
                "id": instance.name(),
                "object": "model",
                "created": 0,
                "owned_by": "llamactl"
            })
        })
        .collect();

    let body = serde_json::json!({ "object": "list", "data": data });
    json_response(StatusCode::OK, body)
}

async fn route_inference(
    State(state): State<RouterState>,
    req: Request<Body>,
) -> Response<Body> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "Failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    let Some(model) = extract_model(&body_bytes) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Missing 'model' field in request body",
        );
    };
    debug!(model = %model, path = %parts.uri.path(), "Routing inference request");

    let instance = match state.registry.get(&model) {
        Ok(instance) => instance,
        Err(_) => {
            warn!(model = %model, "Unknown model");
            return error_response(
                StatusCode::NOT_FOUND,
                &format!("Model not found: {}", model),
            );
        }
    };

    // On-demand start. The guard keeps the start-in-progress window open
    // across the readiness wait; readiness is only awaited by the request
    // that triggered the start.
    let mut start_guard = None;
    if !instance.is_running().await {
        if !state.on_demand_start {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("Model {} is not running and on-demand start is disabled", model),
            );
        }

        info!(model = %model, "Starting instance on demand");
        match state.registry.start_instance(&model).await {
            Ok(guard) => start_guard = Some(guard),
            Err(RegistryError::Instance(InstanceError::AlreadyRunning(_))) => {
                // Lost a race with another start that already completed
            }
            Err(RegistryError::StartInProgress(_)) => {
                return error_response(
                    StatusCode::CONFLICT,
                    &format!("A start is already in progress for model {}", model),
                );
            }
            Err(e @ RegistryError::CapacityExceeded(_)) => {
                warn!(model = %model, error = %e, "Admission failed");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
            }
            Err(e) => {
                error!(model = %model, error = %e, "On-demand start failed");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        }
    }

    if start_guard.is_some() {
        if !wait_ready(&instance, &state).await {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("Model {} did not become ready in time", model),
            );
        }
        drop(start_guard);
    }

    instance.touch();
    metrics::counter!("llamactl_requests_total").increment(1);

    let proxy = instance.proxy_target().await;
    let req = Request::from_parts(parts, Body::from(body_bytes));
    match proxy.forward(req).await {
        Ok(resp) => {
            metrics::histogram!("llamactl_request_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            resp
        }
        Err(e) => {
            error!(model = %model, error = %e, "Upstream connection failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                &format!("Upstream connection failed: {}", e),
            )
        }
    }
}

/// Poll the child's readiness endpoint with exponential backoff until it
/// answers 2xx or the deadline passes.
async fn wait_ready(instance: &Arc<Instance>, state: &RouterState) -> bool {
    let options = instance.options().await;
    let started = Instant::now();
    let mut delay = READY_POLL_INITIAL;

    loop {
        match crate::proxy::probe_ready(
            &options.host,
            options.port,
            &state.health_check_path,
            READY_PROBE_TIMEOUT,
        )
        .await
        {
            Ok(true) => {
                let elapsed = started.elapsed();
                info!(instance = instance.name(), elapsed = ?elapsed, "Instance is ready");
                metrics::histogram!("llamactl_time_to_ready_seconds")
                    .record(elapsed.as_secs_f64());
                return true;
            }
            Ok(false) => {
                debug!(instance = instance.name(), "Readiness probe not ready yet");
            }
            Err(e) => {
                debug!(instance = instance.name(), error = %e, "Readiness probe failed");
            }
        }

        if started.elapsed() >= state.start_timeout {
            warn!(
                instance = instance.name(),
                timeout = ?state.start_timeout,
                "Timed out waiting for instance to become ready"
            );
            return false;
        }

        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(READY_POLL_CAP);
    }
}

/// Extract the model name from the JSON request body.
fn extract_model(body: &Bytes) -> Option<String> {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(model) = json.get("model").and_then(|v| v.as_str())
    {
        return Some(model.to_string());
    }

    None
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    json_response(
        status,
        serde_json::json!({
            "error": {
                "message": message,
                "type": "llamactl_error"
            }
        }),
    )
}
