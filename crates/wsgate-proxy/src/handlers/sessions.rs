//! Admin APIs over the upgraded-connection registry.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSelector {
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnSelector {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub conn_id: String,
}

/// GET /api/v1/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Response {
    Json(state.registry.list_sessions()).into_response()
}

/// POST /api/v1/sessions/conns
pub async fn list_conns(
    State(state): State<AppState>,
    Json(body): Json<SessionSelector>,
) -> Response {
    if body.session_id.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing sessionId"})))
            .into_response();
    }
    let conns = state.registry.list_conns(&body.session_id);
    Json(json!({"sessionId": body.session_id, "conns": conns})).into_response()
}

/// DELETE /api/v1/sessions/conns
pub async fn cancel_conn(
    State(state): State<AppState>,
    Json(body): Json<ConnSelector>,
) -> Response {
    if !state.registry.cancel_conn(&body.session_id, &body.conn_id) {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response();
    }
    Json(json!({
        "sessionId": body.session_id,
        "connId": body.conn_id,
        "cancelled": true,
    }))
    .into_response()
}

/// DELETE /api/v1/sessions
///
/// Cancels every upgraded connection of the session and latches the user
/// for revocation; the next request the user makes completes the logout.
pub async fn cancel_all(
    State(state): State<AppState>,
    Json(body): Json<SessionSelector>,
) -> Response {
    let cancelled = state.registry.cancel_all(&body.session_id, true);
    if cancelled == 0 {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not found or already empty"})),
        )
            .into_response();
    }
    Json(json!({"sessionId": body.session_id, "cancelledCnt": cancelled})).into_response()
}

/// DELETE /api/v1/sessions/idle
pub async fn close_idle(
    State(state): State<AppState>,
    Json(body): Json<SessionSelector>,
) -> Response {
    if !state.registry.close_idle(&body.session_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no transports for session"})),
        )
            .into_response();
    }
    Json(json!({"sessionId": body.session_id, "closed": "idle connections closed"})).into_response()
}
