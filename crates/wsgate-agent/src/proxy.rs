//! Container-side proxy: rewrites `/code-server/*` requests onto the
//! workspace containers running on this host.
//!
//! The director is a pure function from the request path to a target URL
//! plus header mutations; validation failures are stamped into
//! `X-Proxy-Error` and answered with a structured 400 by the error
//! handler, exactly like the proxy backend's contract.

use std::collections::HashSet;

use axum::body::Body;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use log::{error, warn};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use wsgate::mime;

use crate::state::AppState;

/// Ports a workspace may expose through the proxy. Bootstrapped once and
/// injected; the set never changes at runtime.
#[derive(Debug, Clone)]
pub struct AllowedPorts {
    ports: HashSet<u16>,
}

impl Default for AllowedPorts {
    fn default() -> Self {
        Self {
            ports: [80, 443, 3000, 5000, 8000, 8080, 8081, 8082, 9000]
                .into_iter()
                .collect(),
        }
    }
}

impl AllowedPorts {
    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

/// Director validation failures, stamped into `X-Proxy-Error`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    #[error("error code: 002 - message: invalid protocol")]
    InvalidProtocol,

    #[error("error code: 003 - message: invalid port number")]
    InvalidPortCode1,

    #[error("error code: 004 - message: invalid port number")]
    InvalidPortCode2,

    #[error("invalid creds")]
    InvalidCreds,
}

/// Where a rewritten request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub scheme: &'static str,
    pub host: String,
    pub path: String,
    pub sse: bool,
    /// Upgrade/gzip headers for code-server app traffic.
    pub code_server_headers: bool,
}

fn set_host(base: &str, port: u16, username: &str, with_username: bool) -> String {
    if with_username && !username.is_empty() {
        format!("{base}-{username}:{port}")
    } else {
        format!("{base}:{port}")
    }
}

fn set_host_for_port(base: &str, port: &str, username: &str, with_username: bool) -> String {
    if with_username && !username.is_empty() {
        format!("{base}-{username}:{port}")
    } else {
        format!("{base}:{port}")
    }
}

/// Map a `/code-server/*` path onto its container target.
pub fn rewrite(
    full_path: &str,
    username: &str,
    base_host: &str,
    base_port: u16,
    with_username: bool,
    allowed: &AllowedPorts,
) -> Result<Rewrite, RewriteError> {
    let path = full_path.strip_prefix("/code-server").unwrap_or(full_path);
    let trimmed = path.trim_matches('/');
    let parts: Vec<&str> = if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    };

    if parts.len() == 2 && parts[0] == "update" && parts[1] == "check" {
        return Ok(Rewrite {
            scheme: "http",
            host: set_host(base_host, base_port, username, with_username),
            path: "/update/check".to_string(),
            sse: false,
            code_server_headers: false,
        });
    }
    if parts.len() == 1 && parts[0] == "mint-key" {
        return Ok(Rewrite {
            scheme: "http",
            host: set_host(base_host, base_port, username, with_username),
            path: "/mint-key".to_string(),
            sse: false,
            code_server_headers: false,
        });
    }

    if parts.len() >= 4 && parts[0] == "request" {
        let request_user = parts[1].to_lowercase();
        let mut protocol = parts[2].to_lowercase();
        let port_raw = parts[3];

        match protocol.as_str() {
            "http" | "https" | "sse" | "sse-https" => {}
            _ => return Err(RewriteError::InvalidProtocol),
        }
        let port: u16 = port_raw.parse().map_err(|_| RewriteError::InvalidPortCode1)?;
        if !allowed.contains(port) {
            return Err(RewriteError::InvalidPortCode2);
        }

        let mut sse = false;
        if protocol == "sse" {
            protocol = "http".to_string();
            sse = true;
        } else if protocol == "sse-https" {
            protocol = "https".to_string();
            sse = true;
        }

        let extra = if parts.len() > 4 {
            format!("/{}", parts[4..].join("/"))
        } else {
            String::new()
        };

        return Ok(Rewrite {
            scheme: if protocol == "https" { "https" } else { "http" },
            host: set_host_for_port(base_host, port_raw, &request_user, with_username),
            path: extra,
            sse,
            code_server_headers: false,
        });
    }

    // Root and other single-segment app paths are served from the
    // container root; the host helper handles the usernameless form.
    if parts.len() <= 1
        && !path.starts_with("/manifest.json")
        && !path.starts_with("/request")
    {
        return Ok(Rewrite {
            scheme: "http",
            host: set_host(base_host, base_port, username, with_username),
            path: "/".to_string(),
            sse: false,
            code_server_headers: true,
        });
    }

    // The multi-segment rebase is only meaningful on per-user hosts.
    if !with_username {
        return Err(RewriteError::InvalidCreds);
    }

    // Static assets keep their path; everything else is rebased onto the
    // user's container root.
    if path.starts_with("/_static") || path.starts_with("/manifest.json") {
        return Ok(Rewrite {
            scheme: "http",
            host: set_host(base_host, base_port, username, with_username),
            path: path.to_string(),
            sse: false,
            code_server_headers: false,
        });
    }

    let rebased = if parts.len() <= 1 {
        "/".to_string()
    } else {
        format!("/{}", parts[1..].join("/"))
    };
    Ok(Rewrite {
        scheme: "http",
        host: set_host(base_host, base_port, username, with_username),
        path: rebased,
        sse: false,
        code_server_headers: true,
    })
}

/// Forwarding headers for a rewritten request.
pub fn rewrite_headers(rewrite: &Rewrite, real_ip: &str, with_tls: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let insert = |headers: &mut HeaderMap, name: &'static str, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };

    insert(&mut headers, "x-real-ip", real_ip);
    insert(&mut headers, "x-forwarded-for", real_ip);

    if rewrite.code_server_headers {
        insert(
            &mut headers,
            "x-forwarded-proto",
            if with_tls { "https" } else { "http" },
        );
        insert(&mut headers, "accept-encoding", "gzip");
        return headers;
    }

    insert(&mut headers, "x-forwarded-proto", rewrite.scheme);
    if rewrite.sse {
        insert(&mut headers, "connection", "keep-alive");
        insert(&mut headers, "accept", "application/json, text/event-stream");
    } else {
        insert(&mut headers, "accept", "application/json");
        insert(&mut headers, "content-type", "application/json");
    }
    headers
}

/// ANY /code-server/*
pub async fn code_server_proxy(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state).await.ok();
    let req = Request::from_parts(parts, body);

    let username = req
        .extensions()
        .get::<crate::auth::AgentAuthContext>()
        .map(|ctx| ctx.username.clone())
        .unwrap_or_default();

    let full_path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let cfg = &state.config.code_server;

    let target = match rewrite(
        &full_path,
        &username,
        &cfg.base_host,
        cfg.base_port,
        cfg.with_username,
        &state.allowed_ports,
    ) {
        Ok(target) => target,
        Err(err) => {
            // The director contract: stamp the detail and answer 400.
            warn!("proxy rewrite rejected {full_path}: {err}");
            let mut resp = (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({
                    "error": "proxy backend request validation failed",
                    "detail": err.to_string(),
                })),
            )
                .into_response();
            if let Ok(v) = HeaderValue::from_str(&err.to_string()) {
                resp.headers_mut()
                    .insert(HeaderName::from_static("x-proxy-error"), v);
            }
            return resp;
        }
    };

    let real_ip = crate::auth::client_ip(&req);
    let extra = rewrite_headers(&target, &real_ip, state.config.server.with_tls);

    if ws.is_some() && is_websocket(req.headers()) {
        if let Some(ws) = ws {
            return relay_upgrade(ws, &req, &target, extra, &query);
        }
    }

    forward_http(req, target, extra, &query).await
}

fn is_websocket(headers: &HeaderMap) -> bool {
    headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn relay_upgrade(
    ws: WebSocketUpgrade,
    req: &Request<Body>,
    target: &Rewrite,
    extra: HeaderMap,
    query: &str,
) -> Response {
    let ws_scheme = if target.scheme == "https" { "wss" } else { "ws" };
    let mut url = format!("{ws_scheme}://{}{}", target.host, target.path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let mut upstream_req = match url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            error!("invalid upstream url {url}: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    for (name, value) in extra.iter() {
        if name != &HOST && name != "connection" && name != "upgrade" {
            upstream_req.headers_mut().insert(name.clone(), value.clone());
        }
    }
    if let Some(cookie) = req.headers().get(axum::http::header::COOKIE) {
        upstream_req
            .headers_mut()
            .insert(axum::http::header::COOKIE, cookie.clone());
    }

    ws.on_upgrade(move |client_socket| async move {
        if let Err(e) = relay_websocket(client_socket, upstream_req).await {
            warn!("container websocket relay ended: {e:?}");
        }
    })
}

async fn relay_websocket(
    client_socket: WebSocket,
    upstream_req: tokio_tungstenite::tungstenite::handshake::client::Request,
) -> anyhow::Result<()> {
    let (server_socket, _) = connect_async(upstream_req).await?;

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut server_tx, mut server_rx) = server_socket.split();

    let client_to_server = async {
        while let Some(msg) = client_rx.next().await {
            let msg = msg?;
            let forward = match msg {
                AxumMessage::Text(text) => TungsteniteMessage::Text(text.to_string().into()),
                AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
                AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
                AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
                AxumMessage::Close(_) => TungsteniteMessage::Close(None),
            };
            server_tx.send(forward).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let server_to_client = async {
        while let Some(msg) = server_rx.next().await {
            let msg = msg?;
            let forward = match msg {
                TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
                TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
                TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
                TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
                TungsteniteMessage::Close(_) => AxumMessage::Close(None),
                TungsteniteMessage::Frame(_) => continue,
            };
            client_tx.send(forward).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = client_to_server => result,
        result = server_to_client => result,
    }
}

async fn forward_http(
    req: Request<Body>,
    target: Rewrite,
    extra: HeaderMap,
    query: &str,
) -> Response {
    let client = match build_transport() {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build container transport: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let mut url = format!("{}://{}{}", target.scheme, target.host, target.path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    headers.remove(HOST);
    headers.remove(axum::http::header::CONTENT_LENGTH);
    headers.remove(axum::http::header::CONNECTION);
    headers.remove(HeaderName::from_static("upgrade"));
    for (name, value) in extra.iter() {
        headers.insert(name.clone(), value.clone());
    }

    let upstream = client
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let resp = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            error!("container proxy failed for {url}: {e}");
            return (
                StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({
                    "error": "connection refused",
                    "path": target.path,
                    "host": target.host,
                })),
            )
                .into_response();
        }
    };

    let status = resp.status();
    let mut headers = resp.headers().clone();
    headers.remove(axum::http::header::CONNECTION);
    headers.remove(axum::http::header::TRANSFER_ENCODING);

    // This host blanks unexpected 404 bodies; the signing assets are
    // exempt so their content type can be fixed up.
    let blank_body = status == StatusCode::NOT_FOUND
        && !target.path.ends_with("vsda.js")
        && !target.path.ends_with("vsda_bg.wasm");
    if blank_body {
        headers.remove(axum::http::header::CONTENT_LENGTH);
        let mut builder = Response::builder().status(status);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        return builder
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    }

    if let Some(mime_type) = mime::from_url_suffix(&target.path) {
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static(mime_type),
        );
    }
    if target.sse {
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        );
        headers.insert(
            axum::http::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
    }

    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn build_transport() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .max_tls_version(reqwest::tls::Version::TLS_1_2)
        .connect_timeout(std::time::Duration::from_secs(120))
        .tcp_keepalive(std::time::Duration::from_secs(120))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(std::time::Duration::from_secs(600))
        .redirect(reqwest::redirect::Policy::none())
        .build()
}
