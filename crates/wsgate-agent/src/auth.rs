//! Agent-side authentication.
//!
//! The proxy backend forwards the caller's session id in `X-Session-ID`;
//! the agent runs the same session pipeline against the shared store.
//! Container-request paths (`/request`, `/code-server/request`) bypass
//! both checks so workspace-internal tooling can reach exposed ports.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use log::{debug, warn};
use thiserror::Error;

use wsgate::session::StoreError;
use wsgate::token::TokenError;
use wsgate::{SessionStore, TokenService};

use crate::state::AppState;

/// Identity resolved for an agent request.
#[derive(Debug, Clone)]
pub struct AgentAuthContext {
    pub username: String,
    pub session_id: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AgentAuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("access token validation failed")]
    AccessTokenValidation,

    #[error("refresh token not found")]
    RefreshTokenNotFound,

    #[error("refresh token expired")]
    RefreshTokenExpired,

    #[error("refresh token validation failed")]
    RefreshTokenValidation,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Token(#[from] TokenError),
}

/// The agent's view of the session pipeline.
pub struct AgentAuthService {
    store: Arc<SessionStore>,
    tokens: Arc<TokenService>,
}

impl AgentAuthService {
    pub fn new(store: Arc<SessionStore>, tokens: Arc<TokenService>) -> Self {
        Self { store, tokens }
    }

    pub async fn is_logged_in(
        &self,
        session_id: &str,
        ip: &str,
        ua: &str,
    ) -> Result<AgentAuthContext, AgentAuthError> {
        let user = match self.store.lookup_user_by_sid(session_id).await {
            Ok(user) => user,
            Err(StoreError::NotFound) => return Err(AgentAuthError::NotAuthenticated),
            Err(e) => return Err(e.into()),
        };

        match self.store.get_access(&user, session_id).await {
            Ok(access) => match self.tokens.verify_access(&access, ip, ua) {
                Ok((username, groups)) => {
                    return Ok(AgentAuthContext {
                        username,
                        session_id: session_id.to_string(),
                        groups,
                    })
                }
                Err(TokenError::Expired) => {
                    debug!("access token expired for session {session_id}; trying refresh");
                }
                Err(e) => {
                    warn!("possible theft: access token rejected for session {session_id}: {e}");
                    return Err(AgentAuthError::AccessTokenValidation);
                }
            },
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let refresh = match self.store.get_refresh(&user, session_id).await {
            Ok(refresh) => refresh,
            Err(StoreError::NotFound) => return Err(AgentAuthError::RefreshTokenNotFound),
            Err(e) => return Err(e.into()),
        };

        let (username, groups) = match self.tokens.verify_refresh(&refresh, ip, ua) {
            Ok(v) => v,
            Err(TokenError::Expired) => return Err(AgentAuthError::RefreshTokenExpired),
            Err(e) => {
                warn!("possible theft: refresh token rejected for session {session_id}: {e}");
                return Err(AgentAuthError::RefreshTokenValidation);
            }
        };

        let new_access = self.tokens.create_access(&username, &groups, ip, ua)?;
        let new_refresh = self.tokens.create_refresh(&username, &groups, ip, ua)?;
        self.store
            .rotate_on_refresh(
                Some(&user),
                session_id,
                &refresh,
                &new_access,
                self.tokens.access_ttl(),
                &new_refresh,
                self.tokens.refresh_ttl(),
            )
            .await?;

        Ok(AgentAuthContext {
            username,
            session_id: session_id.to_string(),
            groups,
        })
    }
}

/// End-user address as seen by the agent. The proxy backend forwards it in
/// `X-Real-IP`; the socket peer is the proxy itself and only a fallback.
pub fn client_ip(req: &Request<Body>) -> String {
    if let Some(ip) = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return ip.to_string();
    }
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    String::new()
}

/// Whether this path is an unauthenticated container-request path.
pub fn is_request_path(path: &str) -> bool {
    path.starts_with("/request") || path.starts_with("/code-server/request")
}

/// Session-auth middleware for `/code-server/*`. Failures are stamped into
/// `X-Proxy-Error` on the response and answered with a 403.
pub async fn session_auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if is_request_path(req.uri().path()) {
        return next.run(req).await;
    }

    let Some(sid) = req
        .headers()
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return forbidden(&AgentAuthError::MissingCredentials);
    };

    let ip = client_ip(&req);
    let ua = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match state.auth.is_logged_in(&sid, &ip, &ua).await {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(err) => forbidden(&err),
    }
}

fn forbidden(err: &AgentAuthError) -> Response {
    let mut resp = (StatusCode::FORBIDDEN, "access denied").into_response();
    if let Ok(v) = HeaderValue::from_str(&err.to_string()) {
        resp.headers_mut()
            .insert(HeaderName::from_static("x-proxy-error"), v);
    }
    resp
}

/// Shared-secret gate; container-request paths bypass it.
pub async fn agent_key_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if is_request_path(req.uri().path()) {
        return next.run(req).await;
    }

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
        Some(key) if key != state.config.agent_metadata.x_agent_key => (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({"error": "invalid X-Agent-Key"})),
        )
            .into_response(),
        Some(_) => next.run(req).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_paths_bypass_auth() {
        assert!(is_request_path("/request/alice/http/8080/x"));
        assert!(is_request_path("/code-server/request/alice/http/8080/x"));
        assert!(!is_request_path("/code-server/stable-x/y"));
        assert!(!is_request_path("/api/v1/metrics"));
    }
}
