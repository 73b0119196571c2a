//! Login and logout.

use axum::body::Body;
use axum::extract::{Form, FromRequest, Request, State};
use axum::http::header::SET_COOKIE;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use log::{error, warn};
use serde::Deserialize;

use wsgate::groups;

use crate::auth::directory::DirectoryError;
use crate::auth::middleware::{client_ip, user_agent};
use crate::auth::{cookie, AuthError};
use crate::render;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

async fn already_logged_in(state: &AppState, sid: &str, ip: &str, ua: &str) -> bool {
    state.auth.is_logged_in(sid, ip, ua).await.is_ok()
}

/// GET /auth/login
pub async fn get_login(State(state): State<AppState>, req: Request<Body>) -> Response {
    let cookie_name = &state.config.server.session_cookie;
    if let Some(sid) = cookie::cookie_value(req.headers(), cookie_name) {
        let ip = client_ip(&req);
        let ua = user_agent(&req);
        if already_logged_in(&state, &sid, &ip, &ua).await {
            return Redirect::to("/csplatform/home").into_response();
        }
    }
    Html(render::login_page(None)).into_response()
}

/// POST /auth/login
pub async fn post_login(State(state): State<AppState>, req: Request<Body>) -> Response {
    let ip = client_ip(&req);
    let ua = user_agent(&req);

    let cookie_name = &state.config.server.session_cookie;
    if let Some(sid) = cookie::cookie_value(req.headers(), cookie_name) {
        if already_logged_in(&state, &sid, &ip, &ua).await {
            return Redirect::to("/csplatform/home").into_response();
        }
    }

    let form = match Form::<LoginForm>::from_request(req, &state).await {
        Ok(Form(form)) => form,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Html(render::login_page(Some("Malformed login form"))),
            )
                .into_response()
        }
    };

    let user = match state
        .directory
        .authenticate(&form.username, &form.password)
        .await
    {
        Ok(user) => user,
        Err(DirectoryError::InvalidCredentials) => {
            return login_error("Invalid username or password: CODE 001");
        }
        Err(DirectoryError::Unavailable(e)) => {
            error!("directory unavailable during login: {e}");
            return login_error("Login temporarily unavailable");
        }
    };

    if user.groups.is_empty() {
        return login_error("Invalid username or password: CODE 002");
    }

    let mut allowed = state.config.regular_roles();
    allowed.extend(state.config.admin_roles());
    if !groups::has_any(&user.groups, &allowed) {
        warn!(
            "login denied for {}: groups {:?} not in {:?}",
            user.username, user.groups, allowed
        );
        return login_error("Invalid username or password: CODE 003");
    }

    let username = form.username.to_lowercase();
    let sid = match state.auth.login(&username, &user.groups, &ip, &ua).await {
        Ok(sid) => sid,
        Err(e) => {
            error!("failed to establish session for {username}: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut resp = Redirect::to("/csplatform/home").into_response();
    resp.headers_mut().append(
        SET_COOKIE,
        cookie::session_cookie(
            &state.config.server.session_cookie,
            &sid,
            state.config.server.with_tls,
        ),
    );
    resp
}

fn login_error(msg: &str) -> Response {
    Html(render::login_page(Some(msg))).into_response()
}

/// GET/POST /auth/logout
pub async fn logout(State(state): State<AppState>, req: Request<Body>) -> Response {
    let cookie_name = state.config.server.session_cookie.clone();
    let Some(sid) = cookie::cookie_value(req.headers(), &cookie_name) else {
        return Redirect::to("/auth/login").into_response();
    };

    let user = match state.auth.logout(&sid).await {
        Ok(user) => user,
        Err(AuthError::Store(wsgate::session::StoreError::NotFound)) => {
            let mut resp = Redirect::to("/auth/login").into_response();
            cookie::expire_on(resp.headers_mut(), &cookie_name, state.config.server.with_tls);
            return resp;
        }
        Err(e) => {
            error!("logout failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    state.registry.cancel_all(&format!("u:{user}"), false);

    let mut resp = Redirect::to("/auth/login").into_response();
    cookie::expire_on(resp.headers_mut(), &cookie_name, state.config.server.with_tls);
    resp
}
