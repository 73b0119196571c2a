//! Agent API integration tests.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;

use common::{test_app, TEST_AGENT_KEY};

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn metrics_requires_agent_key() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "missing X-Agent-Key header");
}

#[tokio::test]
async fn metrics_rejects_wrong_key() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/metrics")
                .header("X-Agent-Key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "invalid X-Agent-Key");
}

#[tokio::test]
async fn metrics_reports_cpu_and_ram() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/metrics")
                .header("X-Agent-Key", TEST_AGENT_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["total"], 1000);
    assert_eq!(body["idle"], 700);
    // 25% of MemTotal is in use in the fixture.
    assert!((body["ram_percent"].as_f64().unwrap() - 25.0).abs() < 1e-9);
    assert!(body["cpu_percent_str"].as_str().unwrap().ends_with('%'));
    assert!(body["ram_percent_str"].as_str().unwrap().ends_with('%'));
}

#[tokio::test]
async fn tags_returns_configured_metadata() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/tags")
                .header("X-Agent-Key", TEST_AGENT_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["rack"], "t1");
}

#[tokio::test]
async fn container_defaults_reflect_template() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/containers/defaults")
                .header("X-Agent-Key", TEST_AGENT_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert!(body.get("image").is_some());
    assert!(body.get("cpuQuota").is_some());
}

#[tokio::test]
async fn code_server_requires_session() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/code-server/stable-x/some/asset.js")
                .header("X-Agent-Key", TEST_AGENT_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(resp.headers().get("x-proxy-error").is_some());
}

#[tokio::test]
async fn code_server_requires_agent_key_too() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/code-server/stable-x/some/asset.js")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "missing X-Agent-Key header");
}

#[tokio::test]
async fn request_paths_bypass_auth_but_validate_protocol() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/code-server/request/alice/ftp/8080/x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let detail = resp
        .headers()
        .get("x-proxy-error")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(detail.contains("invalid protocol"));
    let body = body_json(resp).await;
    assert_eq!(body["error"], "proxy backend request validation failed");
}

#[tokio::test]
async fn request_paths_reject_disallowed_ports() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/code-server/request/alice/sse-https/22/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let detail = resp
        .headers()
        .get("x-proxy-error")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(detail.contains("error code: 004"));
}
