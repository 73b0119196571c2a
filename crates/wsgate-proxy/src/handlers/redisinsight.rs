//! Admin-only passthrough proxy to the RedisInsight UI.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::error;

use crate::proxy::handler::proxy_error_response;
use crate::proxy::ProxyTransport;
use crate::state::AppState;

/// ANY /redisinsight/ui/*
pub async fn redisinsight_proxy(State(state): State<AppState>, req: Request<Body>) -> Response {
    let cfg = &state.config.redisinsight;
    if !cfg.enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    let transport = match ProxyTransport::base() {
        Ok(tr) => tr,
        Err(e) => {
            error!("failed to build redisinsight transport: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    let Some(client) = transport.client() else {
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let path = req.uri().path().to_string();
    let mut url = format!("{}://{}{}", cfg.proto, cfg.url, path);
    if let Some(query) = req.uri().query() {
        url.push('?');
        url.push_str(query);
    }

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    headers.remove(HOST);
    headers.remove(axum::http::header::CONTENT_LENGTH);

    let upstream = client
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let resp = match upstream {
        Ok(resp) => resp,
        Err(e) => return proxy_error_response(&e, &path, &cfg.url, None),
    };

    let status = resp.status();
    let headers = resp.headers().clone();
    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
