//! Session-auth middleware.
//!
//! Each protected route group is wrapped in a variant of the same
//! middleware: regular users, admins, and the proxy variant that stamps
//! verification failures into `X-Proxy-Error` before redirecting. Requests
//! classified as upgrades are routed through the revocation latch first.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use log::warn;

use wsgate::groups;

use super::cookie;
use super::{is_upgrade_query, AuthContext};
use crate::state::AppState;

/// What to answer when authentication fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// HTML flows bounce to the login page.
    RedirectToLogin,
    /// API flows get a bare 403.
    Forbidden,
}

/// One configured variant of the auth middleware.
#[derive(Clone)]
pub struct AuthLayer {
    pub state: AppState,
    pub required_groups: Arc<Vec<String>>,
    pub error_header: Option<HeaderName>,
    pub on_fail: FailMode,
}

impl AuthLayer {
    pub fn users(state: &AppState) -> Self {
        Self {
            state: state.clone(),
            required_groups: Arc::new(state.config.regular_roles()),
            error_header: None,
            on_fail: FailMode::RedirectToLogin,
        }
    }

    pub fn admins(state: &AppState) -> Self {
        Self {
            state: state.clone(),
            required_groups: Arc::new(state.config.admin_roles()),
            error_header: None,
            on_fail: FailMode::Forbidden,
        }
    }

    pub fn proxy_users(state: &AppState) -> Self {
        Self {
            state: state.clone(),
            required_groups: Arc::new(state.config.regular_roles()),
            error_header: Some(HeaderName::from_static("x-proxy-error")),
            on_fail: FailMode::RedirectToLogin,
        }
    }

    pub fn proxy_admins(state: &AppState) -> Self {
        Self {
            state: state.clone(),
            required_groups: Arc::new(state.config.admin_roles()),
            error_header: Some(HeaderName::from_static("x-proxy-error")),
            on_fail: FailMode::Forbidden,
        }
    }
}

/// Best-effort client address: the connection peer when serving, the
/// `X-Real-IP` header as a fallback under tests.
pub fn client_ip(req: &Request<Body>) -> String {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    req.headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub fn user_agent(req: &Request<Body>) -> String {
    req.headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Session-auth middleware body; install with
/// `middleware::from_fn_with_state(AuthLayer::users(&state), auth_middleware)`.
pub async fn auth_middleware(
    State(layer): State<AuthLayer>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&req);
    let ua = user_agent(&req);
    let cookie_name = layer.state.config.server.session_cookie.clone();
    let with_tls = layer.state.config.server.with_tls;

    let sid = cookie::cookie_value(req.headers(), &cookie_name);
    let outcome = match sid {
        None => Err(super::AuthError::NotAuthenticated),
        Some(ref sid) => {
            if is_upgrade_query(req.uri().query()) {
                layer.state.auth.consume_if_revoked(sid, &ip, &ua).await
            } else {
                layer.state.auth.is_logged_in(sid, &ip, &ua).await
            }
        }
    };

    match outcome {
        Ok(ctx) => {
            if !layer.required_groups.is_empty()
                && !groups::has_any(&ctx.groups, &layer.required_groups)
            {
                warn!(
                    "group requirement failed for {} on {} (groups {:?}, required {:?})",
                    ctx.username,
                    req.uri().path(),
                    ctx.groups,
                    layer.required_groups
                );
                return StatusCode::FORBIDDEN.into_response();
            }
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(err) => {
            let mut resp = match layer.on_fail {
                FailMode::RedirectToLogin => Redirect::to("/auth/login").into_response(),
                FailMode::Forbidden => StatusCode::FORBIDDEN.into_response(),
            };
            if let Some(name) = &layer.error_header {
                if let Ok(v) = HeaderValue::from_str(&err.to_string()) {
                    resp.headers_mut().insert(name.clone(), v);
                }
            }
            if err.expires_cookie() {
                cookie::expire_on(resp.headers_mut(), &cookie_name, with_tls);
            }
            resp
        }
    }
}

/// Shared-secret gate for agent-facing endpoints.
pub async fn agent_key_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get("x-agent-key")
        .and_then(|v| v.to_str().ok());
    match presented {
        None => (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({"error": "missing X-Agent-Key header"})),
        )
            .into_response(),
        Some(key) if key != state.config.secrets.agent_key => (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({"error": "invalid X-Agent-Key"})),
        )
            .into_response(),
        Some(_) => next.run(req).await,
    }
}
