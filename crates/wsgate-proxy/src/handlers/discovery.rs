//! Discovery HTTP surface, gated by the shared agent key.

use axum::body::Body;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

use wsgate::discovery::{DiscoveryError, ServiceInstance};

use crate::auth::middleware::client_ip;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "mainHost")]
    pub main_host: String,
    #[serde(rename = "mainHostProto", default)]
    pub main_host_proto: String,
    #[serde(rename = "hostPort", default)]
    pub host_port: String,
    #[serde(rename = "hostPortProto", default)]
    pub host_port_proto: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct InstanceSelector {
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
}

fn discovery_error(err: DiscoveryError) -> Response {
    match err {
        DiscoveryError::AlreadyRegistered { .. } => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": err.to_string()}))).into_response()
        }
        DiscoveryError::NotFound | DiscoveryError::Expired => {
            (StatusCode::NOT_FOUND, Json(json!({"error": err.to_string()}))).into_response()
        }
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

/// POST /discovery/register
pub async fn register(State(state): State<AppState>, req: Request<Body>) -> Response {
    let real_ip = client_ip(&req);
    let Ok(Json(body)) = axum::extract::Json::<RegisterRequest>::from_request(req, &state).await
    else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid body"}))).into_response();
    };

    info!("registering service with instance id {}", body.instance_id);
    let instance = ServiceInstance {
        main_host: body.main_host,
        main_host_proto: body.main_host_proto,
        host_port: body.host_port,
        host_port_proto: body.host_port_proto,
        version: body.version,
        region: body.region,
        tags: body.tags,
    };
    match state
        .discovery
        .register(&body.instance_id, &body.service_name, instance, &real_ip)
        .await
    {
        Ok(()) => Json(json!({"status": "registered"})).into_response(),
        Err(e) => discovery_error(e),
    }
}

/// POST /discovery/deregister
pub async fn deregister(
    State(state): State<AppState>,
    Json(body): Json<InstanceSelector>,
) -> Response {
    match state
        .discovery
        .deregister(&body.instance_id, &body.service_name)
        .await
    {
        Ok(()) => Json(json!({"status": "deregistered"})).into_response(),
        Err(e) => discovery_error(e),
    }
}

/// POST /discovery/healthcheck
pub async fn healthcheck(
    State(state): State<AppState>,
    Json(body): Json<InstanceSelector>,
) -> Response {
    match state
        .discovery
        .heartbeat(&body.instance_id, &body.service_name)
        .await
    {
        Ok(()) => Json(json!({"status": "healthy"})).into_response(),
        Err(e) => discovery_error(e),
    }
}

/// GET /discovery/discover/{serviceName}
pub async fn discover(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
) -> Response {
    match state.discovery.discover(&service_name).await {
        Ok(instances) => Json(instances).into_response(),
        Err(e) => discovery_error(e),
    }
}
