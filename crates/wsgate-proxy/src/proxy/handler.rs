//! `/code-server/*` reverse proxy handler.
//!
//! Plain requests are forwarded over a fresh per-request transport.
//! Upgrade requests (code-server reconnection channels) become WebSocket
//! relays registered in the session registry so they can be cancelled
//! out-of-band.

use std::error::Error as _;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{HeaderMap, HeaderName, COOKIE, HOST};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_util::sync::CancellationToken;

use wsgate::ownership::OwnershipError;

use crate::auth::{is_upgrade_query, AuthContext};
use crate::state::AppState;

use super::director::{conn_id, direct_to_agent};
use super::response::mutate_response_headers;
use super::transport::ProxyTransport;

/// Headers never copied between the two legs of the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub async fn code_server_proxy(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state).await.ok();
    let req = Request::from_parts(parts, body);

    let Some(ctx) = req.extensions().get::<AuthContext>().cloned() else {
        return StatusCode::FORBIDDEN.into_response();
    };

    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();

    let agent = match state.ownership.get(&ctx.username).await {
        Ok(info) => info,
        Err(OwnershipError::NotFound) => {
            // No workspace for this user; short-circuit without forwarding.
            return bad_gateway("no such host", &path, "");
        }
        Err(e) => {
            error!("ownership lookup failed for {}: {e}", ctx.username);
            return bad_gateway("no such host", &path, "");
        }
    };

    let real_ip = crate::auth::middleware::client_ip(&req);
    let ua = crate::auth::middleware::user_agent(&req);
    let target = direct_to_agent(
        &agent.agent_host,
        state.config.server.with_tls,
        &real_ip,
        &ua,
        &state.config.secrets.agent_key,
        &ctx.session_id,
    );

    if is_upgrade_query(req.uri().query()) {
        if let Some(ws) = ws {
            return upgrade_proxy(state, ws, &req, ctx, target.host, target.headers, &path, &query);
        }
        // Long-poll reconnection channels carry the same fingerprint but
        // never reach the WebSocket handshake; track them all the same so
        // revocation can cut them.
        return tracked_http_proxy(state, req, ctx, target.host, target.headers, &path, &query)
            .await;
    }

    forward_http(req, target.host, target.headers, &path, &query).await
}

/// Registered HTTP forward for upgrade-fingerprinted requests that are not
/// WebSocket handshakes. The registry token rides the response body: the
/// record stays live while the stream does, and cancelling it cuts the
/// stream short.
async fn tracked_http_proxy(
    state: AppState,
    req: Request<Body>,
    ctx: AuthContext,
    host: String,
    headers: HeaderMap,
    path: &str,
    query: &str,
) -> Response {
    let logical_sid = format!("u:{}", ctx.username);
    let cid = conn_id(&ctx.session_id, query);
    let cancel = CancellationToken::new();

    let transport = match ProxyTransport::base() {
        Ok(tr) => Arc::new(tr),
        Err(e) => {
            error!("failed to build upgrade transport: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    state
        .registry
        .add_conn(&logical_sid, &cid, cancel.clone(), Some(transport));
    let guard = cancel.clone().drop_guard();

    let resp = tokio::select! {
        resp = forward_http(req, host, headers, path, query) => resp,
        _ = cancel.cancelled() => {
            warn!("tracked connection for {logical_sid} cancelled before upstream answered");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let (parts, body) = resp.into_parts();
    let guarded = GuardedStream {
        inner: body.into_data_stream().boxed(),
        cancelled: Box::pin(cancel.cancelled_owned()),
        _guard: guard,
    };
    Response::from_parts(parts, Body::from_stream(guarded))
}

/// Response body stream coupled to a registry cancel handle. The stream
/// ends as soon as the token fires; dropping the stream (client gone or
/// body finished) cancels the token so the janitor reaps the record.
struct GuardedStream {
    inner: futures::stream::BoxStream<'static, Result<axum::body::Bytes, axum::Error>>,
    cancelled: std::pin::Pin<Box<tokio_util::sync::WaitForCancellationFutureOwned>>,
    _guard: tokio_util::sync::DropGuard,
}

impl futures::Stream for GuardedStream {
    type Item = Result<axum::body::Bytes, axum::Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::future::Future;
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return std::task::Poll::Ready(None);
        }
        self.inner.as_mut().poll_next(cx)
    }
}

/// Relay an upgraded request to the agent, tracked in the session registry
/// under the user's logical session id.
#[allow(clippy::too_many_arguments)]
fn upgrade_proxy(
    state: AppState,
    ws: WebSocketUpgrade,
    req: &Request<Body>,
    ctx: AuthContext,
    host: String,
    headers: HeaderMap,
    path: &str,
    query: &str,
) -> Response {
    let logical_sid = format!("u:{}", ctx.username);
    let cid = conn_id(&ctx.session_id, query);
    let cancel = CancellationToken::new();

    let transport = match ProxyTransport::base() {
        Ok(tr) => Arc::new(tr),
        Err(e) => {
            error!("failed to build upgrade transport: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    state
        .registry
        .add_conn(&logical_sid, &cid, cancel.clone(), Some(transport));

    let mut upstream_url = format!("ws://{host}{path}");
    if !query.is_empty() {
        upstream_url.push('?');
        upstream_url.push_str(query);
    }
    let mut upstream_req = match upstream_url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            error!("invalid upstream url {upstream_url}: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    for (name, value) in headers.iter() {
        if name != &HOST {
            upstream_req.headers_mut().insert(name.clone(), value.clone());
        }
    }
    if let Some(cookie) = req.headers().get(COOKIE) {
        upstream_req.headers_mut().insert(COOKIE, cookie.clone());
    }

    debug!("registering upgraded connection {cid} for {logical_sid}");

    ws.on_upgrade(move |client_socket| async move {
        // Marks the record closed for the janitor once the relay ends,
        // whether it finished naturally or was cancelled.
        let _guard = cancel.clone().drop_guard();
        if let Err(e) = relay_websocket(client_socket, upstream_req, cancel).await {
            warn!("upgraded connection for {logical_sid} ended: {e:?}");
        }
    })
}

/// Bidirectional frame relay with cooperative cancellation.
async fn relay_websocket(
    client_socket: WebSocket,
    upstream_req: tokio_tungstenite::tungstenite::handshake::client::Request,
    cancel: CancellationToken,
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
        _ = cancel.cancelled() => Ok(()),
        result = client_to_server => result,
        result = server_to_client => result,
    }
}

/// Forward a plain HTTP request over a fresh transport and stream the
/// mutated response back.
async fn forward_http(
    req: Request<Body>,
    host: String,
    extra_headers: HeaderMap,
    path: &str,
    query: &str,
) -> Response {
    let transport = match ProxyTransport::base() {
        Ok(tr) => tr,
        Err(e) => {
            error!("failed to build proxy transport: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    let Some(client) = transport.client() else {
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let mut url = format!("http://{host}{path}");
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    let stamped = headers
        .get("x-proxy-error")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);
    headers.remove(axum::http::header::CONTENT_LENGTH);
    for (name, value) in extra_headers.iter() {
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
        Err(e) => return proxy_error_response(&e, path, &host, stamped.as_deref()),
    };

    let status = resp.status();
    let mut headers = resp.headers().clone();
    strip_hop_by_hop(&mut headers);
    mutate_response_headers(path, status, &mut headers);

    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|e| {
            error!("failed to assemble proxy response: {e}");
            StatusCode::BAD_GATEWAY.into_response()
        })
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(HeaderName::from_static(name));
    }
}

/// Map a transport error onto the error contract: known connect failures
/// become structured 502s, stamped proxy errors a 400, the rest a generic
/// 502.
pub fn proxy_error_response(
    err: &reqwest::Error,
    path: &str,
    host: &str,
    stamped: Option<&str>,
) -> Response {
    if let Some(kind) = classify_connect_error(err) {
        return bad_gateway(kind, path, host);
    }

    if let Some(detail) = stamped {
        error!("proxy request validation failed: {detail}");
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({
                "error": "proxy backend request validation failed",
                "detail": detail,
            })),
        )
            .into_response();
    }

    error!("proxy connection failed for {host}{path}: {err}");
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(serde_json::json!({
            "error": "proxy backend connection failed",
            "detail": err.to_string(),
        })),
    )
        .into_response()
}

/// Distinguish "no such host" and "connection refused" for the 502 body.
fn classify_connect_error(err: &reqwest::Error) -> Option<&'static str> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return Some("connection refused");
            }
        }
        let text = cause.to_string();
        if text.contains("dns error") || text.contains("failed to lookup") {
            return Some("no such host");
        }
        source = cause.source();
    }
    if err.is_connect() {
        return Some("connection refused");
    }
    None
}

fn bad_gateway(error: &str, path: &str, host: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(serde_json::json!({
            "error": error,
            "path": path,
            "host": host,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("connection"),
            "keep-alive".parse().unwrap(),
        );
        headers.insert(
            HeaderName::from_static("transfer-encoding"),
            "chunked".parse().unwrap(),
        );
        headers.insert(
            HeaderName::from_static("x-custom"),
            "stays".parse().unwrap(),
        );
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("x-custom").unwrap(), "stays");
    }
}
