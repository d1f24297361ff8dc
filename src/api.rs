//! Management API for instance CRUD and lifecycle control.
//!
//! A thin JSON adapter over the registry, mounted under `/api/v1`.
//!
//! ## Endpoints
//!
//! | Method | Path                               | Description                      |
//! |--------|------------------------------------|----------------------------------|
//! | GET    | `/api/v1/instances`                | List all instances               |
//! | POST   | `/api/v1/instances/{name}`         | Create an instance (stopped)     |
//! | GET    | `/api/v1/instances/{name}`         | Fetch one instance               |
//! | PUT    | `/api/v1/instances/{name}`         | Replace the instance options     |
//! | DELETE | `/api/v1/instances/{name}`         | Delete a stopped instance        |
//! | POST   | `/api/v1/instances/{name}/start`   | Start (through admission)        |
//! | POST   | `/api/v1/instances/{name}/stop`    | Stop                             |
//! | POST   | `/api/v1/instances/{name}/restart` | Stop then start                  |
//! | GET    | `/api/v1/instances/{name}/logs`    | Tail of the instance log         |

use crate::instance::{InstanceError, InstanceOptionsRequest, InstanceStatus};
use crate::registry::{Registry, RegistryError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Build the management API router.
pub fn routes(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/instances", get(list_instances))
        .route(
            "/instances/{name}",
            post(create_instance)
                .get(get_instance)
                .put(update_instance)
                .delete(delete_instance),
        )
        .route("/instances/{name}/start", post(start_instance))
        .route("/instances/{name}/stop", post(stop_instance))
        .route("/instances/{name}/restart", post(restart_instance))
        .route("/instances/{name}/logs", get(get_logs))
        .with_state(registry)
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Deserialize)]
struct LogsQuery {
    /// Number of trailing lines; 0 or negative returns the whole file
    lines: Option<i64>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn registry_error(e: RegistryError) -> ApiError {
    let status = match &e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::InvalidName(_) => StatusCode::BAD_REQUEST,
        RegistryError::AlreadyExists(_)
        | RegistryError::StillRunning(_)
        | RegistryError::StartInProgress(_) => StatusCode::CONFLICT,
        RegistryError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::Instance(inner) => match inner {
            InstanceError::AlreadyRunning(_) | InstanceError::NotRunning(_) => {
                StatusCode::CONFLICT
            }
            InstanceError::Spawn { .. } | InstanceError::Log { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
    };

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

async fn list_instances(State(registry): State<Arc<Registry>>) -> Json<Vec<InstanceStatus>> {
    let mut statuses = Vec::new();
    for instance in registry.list() {
        statuses.push(instance.status().await);
    }
    Json(statuses)
}

async fn create_instance(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
    Json(request): Json<InstanceOptionsRequest>,
) -> Result<(StatusCode, Json<InstanceStatus>), ApiError> {
    let instance = registry
        .create(&name, request)
        .await
        .map_err(registry_error)?;
    Ok((StatusCode::CREATED, Json(instance.status().await)))
}

async fn get_instance(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatus>, ApiError> {
    let instance = registry.get(&name).map_err(registry_error)?;
    Ok(Json(instance.status().await))
}

async fn update_instance(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
    Json(request): Json<InstanceOptionsRequest>,
) -> Result<Json<InstanceStatus>, ApiError> {
    let instance = registry
        .update(&name, request)
        .await
        .map_err(registry_error)?;
    Ok(Json(instance.status().await))
}

async fn delete_instance(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    registry.delete(&name).await.map_err(registry_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_instance(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatus>, ApiError> {
    // The guard is dropped right away: the management API does not wait for
    // readiness, so the start-in-progress window closes once spawned.
    let _ = registry.start_instance(&name).await.map_err(registry_error)?;
    let instance = registry.get(&name).map_err(registry_error)?;
    Ok(Json(instance.status().await))
}

async fn stop_instance(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatus>, ApiError> {
    registry.stop_instance(&name).await.map_err(registry_error)?;
    let instance = registry.get(&name).map_err(registry_error)?;
    Ok(Json(instance.status().await))
}

async fn restart_instance(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    registry
        .restart_instance(&name)
        .await
        .map_err(registry_error)?;
    Ok(Json(MessageResponse {
        message: format!("Instance {} restarted", name),
    }))
}

async fn get_logs(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = registry.get(&name).map_err(registry_error)?;
    let logs = instance
        .logs(query.lines.unwrap_or(100))
        .await
        .map_err(|e| registry_error(e.into()))?;
    Ok(([("Content-Type", "text/plain; charset=utf-8")], logs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstancesConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn make_registry(dir: &TempDir) -> Arc<Registry> {
        let config = InstancesConfig {
            state_dir: dir.path().join("state"),
            log_dir: dir.path().join("logs"),
            max_running_instances: 2,
            ..InstancesConfig::default()
        };
        Arc::new(Registry::new(config).unwrap())
    }

    fn create_body(port: u16) -> Body {
        Body::from(
            serde_json::json!({
                "port": port,
                "backend_type": "llama_cpp",
                "backend_options": { "model": "/models/test.gguf" }
            })
            .to_string(),
        )
    }

    async fn response_json(response: axum::http::Response<Body>) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let dir = TempDir::new().unwrap();
        let app = routes(make_registry(&dir));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/instances/small")
                    .header("Content-Type", "application/json")
                    .body(create_body(18001))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/instances/small")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["name"], "small");
        assert_eq!(json["running"], false);
        assert_eq!(json["options"]["port"], 18001);
        assert_eq!(json["options"]["backend_type"], "llama_cpp");
    }

    #[tokio::test]
    async fn test_create_invalid_name() {
        let dir = TempDir::new().unwrap();
        let app = routes(make_registry(&dir));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/instances/bad%2Fname")
                    .header("Content-Type", "application/json")
                    .body(create_body(18001))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_duplicate_conflicts() {
        let dir = TempDir::new().unwrap();
        let app = routes(make_registry(&dir));

        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/instances/small")
                        .header("Content-Type", "application/json")
                        .body(create_body(18001))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_get_unknown_instance() {
        let dir = TempDir::new().unwrap();
        let app = routes(make_registry(&dir));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/instances/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_stopped_instance_conflicts() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir);
        let app = routes(Arc::clone(&registry));

        registry
            .create(
                "small",
                serde_json::from_value(serde_json::json!({
                    "port": 18001,
                    "backend_type": "llama_cpp",
                    "backend_options": {}
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/instances/small/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_delete_running_conflicts() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir);
        let app = routes(Arc::clone(&registry));

        let instance = registry
            .create(
                "small",
                serde_json::from_value(serde_json::json!({
                    "port": 18001,
                    "backend_type": "llama_cpp",
                    "backend_options": {}
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        instance.force_running().await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/instances/small")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_update_changes_options() {
        let dir = TempDir::new().unwrap();
        let app = routes(make_registry(&dir));

        let create = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/instances/small")
                    .header("Content-Type", "application/json")
                    .body(create_body(18001))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(create.status(), StatusCode::CREATED);

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/instances/small")
                    .header("Content-Type", "application/json")
                    .body(create_body(18009))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["options"]["port"], 18009);
    }

    #[tokio::test]
    async fn test_logs_for_unknown_instance() {
        let dir = TempDir::new().unwrap();
        let app = routes(make_registry(&dir));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/instances/nope/logs?lines=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
