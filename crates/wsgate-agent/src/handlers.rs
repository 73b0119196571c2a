//! Container CRUD, metrics and tags endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::error;
use serde::Deserialize;
use serde_json::json;

use crate::containers::{ContainerError, CreateContainerRequest};
use crate::state::AppState;

fn container_error(err: ContainerError) -> Response {
    let status = match &err {
        ContainerError::NotFound(_) => StatusCode::NOT_FOUND,
        ContainerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

/// POST /api/v1/containers
pub async fn create_container(
    State(state): State<AppState>,
    Json(req): Json<CreateContainerRequest>,
) -> Response {
    match state.runtime.create(&req).await {
        Ok(id) => Json(json!({"Id": id, "Warnings": []})).into_response(),
        Err(e) => {
            error!("container create failed: {e}");
            container_error(e)
        }
    }
}

/// POST /api/v1/containers/{id}/start
pub async fn start_container(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.runtime.start(&id).await {
        Ok(()) => Json(json!({"status": "started"})).into_response(),
        Err(e) => container_error(e),
    }
}

/// POST /api/v1/containers/{id}/stop
pub async fn stop_container(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.runtime.stop(&id).await {
        Ok(()) => Json(json!({"status": "stopped"})).into_response(),
        Err(e) => container_error(e),
    }
}

/// POST /api/v1/containers/{id}/restart
pub async fn restart_container(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.runtime.restart(&id).await {
        Ok(()) => Json(json!({"status": "restarted"})).into_response(),
        Err(e) => container_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: Option<String>,
}

/// DELETE /api/v1/containers/{id}
pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Response {
    let force = query.force.as_deref() == Some("true");
    match state.runtime.remove(&id, force).await {
        Ok(()) => Json(json!({"status": "removed"})).into_response(),
        Err(e) => container_error(e),
    }
}

/// GET /api/v1/containers
pub async fn list_containers(State(state): State<AppState>) -> Response {
    match state.runtime.list().await {
        Ok(list) => Json(list).into_response(),
        Err(e) => container_error(e),
    }
}

/// GET /api/v1/containers/code-server
pub async fn list_workspace_containers(State(state): State<AppState>) -> Response {
    let base = state.config.code_server.base_host.clone();
    match state.runtime.list_workspaces(&base).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => container_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: u32,
}

fn default_tail() -> u32 {
    200
}

/// GET /api/v1/containers/{id}/logs
pub async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.runtime.logs(&id, query.tail).await {
        Ok(logs) => logs.into_response(),
        Err(e) => container_error(e),
    }
}

/// GET /api/v1/containers/{name}/id
pub async fn container_id_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.runtime.id_by_name(&name).await {
        Ok(Some(id)) => Json(json!({"id": id})).into_response(),
        Ok(None) => container_error(ContainerError::NotFound(name)),
        Err(e) => container_error(e),
    }
}

/// GET /api/v1/containers/{name}/exist
pub async fn container_exists(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.runtime.exists(&name).await {
        Ok(exist) => Json(json!({"name": name, "exist": exist})).into_response(),
        Err(e) => container_error(e),
    }
}

/// GET /api/v1/containers/{name}/running
pub async fn container_running(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.runtime.running(&name).await {
        Ok(running) => Json(json!({"name": name, "running": running})).into_response(),
        Err(e) => container_error(e),
    }
}

/// GET /api/v1/containers/{name}/stats
pub async fn container_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.runtime.stats(&name).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => container_error(e),
    }
}

/// GET /api/v1/containers/defaults
pub async fn container_defaults(State(state): State<AppState>) -> Response {
    Json(state.runtime.defaults()).into_response()
}

/// GET /api/v1/metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.fetch().await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            error!("metrics read failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// GET /api/v1/tags
pub async fn tags(State(state): State<AppState>) -> Response {
    Json(state.config.agent_metadata.tags.clone()).into_response()
}
