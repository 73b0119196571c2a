//! Workspace container orchestration: ownership checks, agent selection
//! and the create/start/stop/restart/delete flows.

use std::collections::HashMap;

use axum::extract::{RawForm, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Extension, Json};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;

use wsgate::ownership::{ContainerOwnership, OwnershipError};

use crate::auth::AuthContext;
use crate::render;
use crate::state::AppState;

/// GET /csplatform/containers/create
///
/// Refuses when the user already owns a workspace, otherwise serves the
/// creation form seeded with the least-loaded agent's template defaults.
pub async fn show_create_form(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Response {
    match state.ownership.get(&ctx.username).await {
        Ok(existing) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!("{} already have container", existing.user),
                    "details": format!(
                        "Agent Host: {} Container Name: {} -> Created At {}",
                        existing.agent_host, existing.container_name, existing.created_at
                    ),
                })),
            )
                .into_response()
        }
        Err(OwnershipError::NotFound) => {}
        Err(e) => {
            error!("ownership lookup failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let selected = match state.agents.select_best_agent().await {
        Ok(agent) => agent,
        Err(e) => {
            error!("failed to select agent: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to select agent: {e}"),
            )
                .into_response();
        }
    };

    let mut agent_options: Vec<String> = match state.agents.all_agents().await {
        Ok(agents) => agents.iter().map(|a| a.main_url()).collect(),
        Err(e) => {
            error!("failed to fetch agents: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    agent_options.push("Auto".to_string());

    let defaults = match state.agents.container_defaults(&selected.url).await {
        Ok(defaults) => defaults,
        Err(e) => {
            error!("failed to fetch container defaults from {}: {e}", selected.url);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Html(render::container_create_page(
        &ctx.username,
        &agent_options,
        &defaults.to_string(),
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[allow(dead_code)]
    username: String,
    uid: i64,
    gid: i64,
}

/// Resolve uid/gid from the identity sidecar for the container env.
async fn resolve_puid_pgid(state: &AppState, username: &str) -> Result<(i64, i64), Response> {
    let cfg = &state.config.user_info;
    if cfg.url.is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"Error": "PUID env variable is required"})),
        )
            .into_response());
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?;

    let resp = client
        .get(format!("{}/{username}", cfg.url.trim_end_matches('/')))
        .header("X-Api-Key", &cfg.api_key)
        .send()
        .await
        .map_err(|e| {
            error!("user-info request failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"Error": "Fatal error on user info request"})),
            )
                .into_response()
        })?;

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err((StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"Error": body}))).into_response());
    }

    let info: UserInfo = resp.json().await.map_err(|e| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"Error": e.to_string()})),
        )
            .into_response()
    })?;
    Ok((info.uid, info.gid))
}

/// Parse an urlencoded form preserving repeated `key[]` fields.
fn parse_multi_form(raw: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(raw);
    text.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| {
                urlencoding::decode(&s.replace('+', " "))
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            };
            (decode(k), decode(v))
        })
        .collect()
}

fn first<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn all(pairs: &[(String, String)], key: &str) -> Vec<String> {
    pairs
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .collect()
}

/// POST /api/v1/containers/create
pub async fn create_container(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    RawForm(raw): RawForm,
) -> Response {
    let pairs = parse_multi_form(&raw);

    match state.ownership.get(&ctx.username).await {
        Ok(existing) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!("User already have container: {}", existing.container_name),
                })),
            )
                .into_response()
        }
        Err(OwnershipError::NotFound) => {}
        Err(e) => {
            error!("ownership lookup failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let agent_form = first(&pairs, "agent").unwrap_or("Auto").to_string();
    let name = first(&pairs, "name").unwrap_or_default().to_string();
    let image = first(&pairs, "image").unwrap_or_default().to_string();
    let memory = first(&pairs, "memory").unwrap_or_default().to_string();
    let restart = first(&pairs, "restart").unwrap_or_default().to_string();
    let network = first(&pairs, "network").unwrap_or_default().to_string();
    let cpu_quota: i64 = match first(&pairs, "cpuQuota") {
        None | Some("") => 0,
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid cpuQuota value"})),
                )
                    .into_response()
            }
        },
    };

    let ports = all(&pairs, "ports[]");
    let expose = all(&pairs, "expose[]");
    let volumes = all(&pairs, "volumes[]");
    let extra_hosts = all(&pairs, "extraHosts[]");

    let env_keys = all(&pairs, "env_key[]");
    let env_vals = all(&pairs, "env_val[]");
    let mut env: HashMap<String, String> = HashMap::new();
    for (i, key) in env_keys.iter().enumerate() {
        env.insert(key.clone(), env_vals.get(i).cloned().unwrap_or_default());
    }

    let sysctls_keys = all(&pairs, "sysctls_key[]");
    let sysctls_vals = all(&pairs, "sysctls_val[]");
    let mut sysctls: HashMap<String, String> = HashMap::new();
    for (i, key) in sysctls_keys.iter().enumerate() {
        sysctls.insert(key.clone(), sysctls_vals.get(i).cloned().unwrap_or_default());
    }

    // Workspace processes must run as the user's directory identity.
    match resolve_puid_pgid(&state, &ctx.username).await {
        Ok((uid, gid)) => {
            env.insert("PUID".to_string(), uid.to_string());
            env.insert("PGID".to_string(), gid.to_string());
        }
        Err(resp) => return resp,
    }

    let mut spec = serde_json::Map::new();
    let mut put = |key: &str, value: serde_json::Value| {
        let empty = match &value {
            serde_json::Value::String(s) => s.is_empty(),
            serde_json::Value::Array(a) => a.is_empty(),
            serde_json::Value::Object(o) => o.is_empty(),
            _ => false,
        };
        if !empty {
            spec.insert(key.to_string(), value);
        }
    };
    put("image", json!(image));
    put("name", json!(name));
    put("memory", json!(memory));
    if cpu_quota != 0 {
        put("cpuQuota", json!(cpu_quota));
    }
    put("restart", json!(restart));
    put("network", json!(network));
    put("ports", json!(ports));
    put("expose", json!(expose));
    put("volumes", json!(volumes));
    put("extraHosts", json!(extra_hosts));
    put("env", json!(env));
    put("sysctls", json!(sysctls));
    let spec = serde_json::Value::Object(spec);

    let agent_url = if agent_form.to_lowercase() == "auto" {
        match state.agents.select_best_agent().await {
            Ok(selected) => selected.url,
            Err(e) => {
                error!("failed to select agent with LB: {e}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to select agent with LB: {e}"),
                )
                    .into_response();
            }
        }
    } else {
        agent_form
    };

    if let Err(e) = state.agents.create_container(&agent_url, &spec).await {
        error!("failed to create container on {agent_url}: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to create container: {e}"),
        )
            .into_response();
    }

    let ownership = ContainerOwnership {
        user: ctx.username.clone(),
        container_name: name.clone(),
        agent_host: agent_url.clone(),
        created_at: String::new(),
    };
    if let Err(e) = state.ownership.add(ownership).await {
        error!("failed to save container-agent info for {name}: {e}");
        // Roll the container back so the next attempt starts clean.
        match state.agents.remove_container(&agent_url, &name).await {
            Ok(_) => info!("rollback of {name} on {agent_url} succeeded"),
            Err(del) => error!("failed to rollback container {name} on {agent_url}: {del}"),
        }
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    Redirect::to("/csplatform/home").into_response()
}

async fn with_owned_container<F, Fut>(state: &AppState, username: &str, op: F) -> Response
where
    F: FnOnce(ContainerOwnership) -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let info = match state.ownership.get(username).await {
        Ok(info) => info,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to resolve container: {e}"),
            )
                .into_response()
        }
    };
    match op(info).await {
        Ok(()) => Redirect::to("/csplatform/home").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}

/// POST /csplatform/containers/stop
pub async fn stop_container(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Response {
    let agents = state.agents.clone();
    with_owned_container(&state, &ctx.username, |info| async move {
        agents
            .stop_container(&info.agent_host, &info.container_name)
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to stop container: {e}"))
    })
    .await
}

/// POST /csplatform/containers/start
pub async fn start_container(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Response {
    let agents = state.agents.clone();
    with_owned_container(&state, &ctx.username, |info| async move {
        agents
            .start_container(&info.agent_host, &info.container_name)
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to start container: {e}"))
    })
    .await
}

/// POST /csplatform/containers/restart
pub async fn restart_container(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Response {
    let agents = state.agents.clone();
    with_owned_container(&state, &ctx.username, |info| async move {
        agents
            .restart_container(&info.agent_host, &info.container_name)
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to restart container: {e}"))
    })
    .await
}

/// POST /csplatform/containers/delete
pub async fn remove_container(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Response {
    let agents = state.agents.clone();
    let ownership = state.ownership.clone();
    let username = ctx.username.clone();
    with_owned_container(&state, &ctx.username, |info| async move {
        agents
            .remove_container(&info.agent_host, &info.container_name)
            .await
            .map_err(|e| format!("Failed to remove container: {e}"))?;
        ownership
            .remove(&username)
            .await
            .map_err(|e| format!("Failed to remove ownership record: {e}"))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_value_form_fields_are_preserved() {
        let raw = b"name=ws&ports[]=8080:8080&ports[]=3000:3000&env_key[]=A&env_val[]=1";
        let pairs = parse_multi_form(raw);
        assert_eq!(first(&pairs, "name"), Some("ws"));
        assert_eq!(all(&pairs, "ports[]"), vec!["8080:8080", "3000:3000"]);
        assert_eq!(all(&pairs, "env_key[]"), vec!["A"]);
    }

    #[test]
    fn form_values_are_url_decoded() {
        let raw = b"name=code%2Dserver&memory=4g&note=a+b";
        let pairs = parse_multi_form(raw);
        assert_eq!(first(&pairs, "name"), Some("code-server"));
        assert_eq!(first(&pairs, "note"), Some("a b"));
    }
}
