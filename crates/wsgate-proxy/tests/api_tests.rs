//! Proxy backend integration tests.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::util::ServiceExt;

use common::test_app;

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn login_page_is_served_without_a_session() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/auth/login")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_text(resp).await;
    assert!(body.contains("name=\"username\""));
    assert!(body.contains("name=\"password\""));
}

#[tokio::test]
async fn home_redirects_anonymous_users_to_login() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/csplatform/home")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(resp.status().is_redirection());
    assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/auth/login");
}

#[tokio::test]
async fn admin_api_is_forbidden_without_a_session() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn code_server_redirects_anonymous_users() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/code-server/stable-x/asset.js")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(resp.status().is_redirection());
    // The proxy variant stamps the failure for the error handler.
    assert!(resp.headers().get("x-proxy-error").is_some());
}

#[tokio::test]
async fn discovery_requires_agent_key() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/discovery/healthcheck")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"instanceID":"a","serviceName":"container_service"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_text(resp).await;
    assert!(body.contains("missing X-Agent-Key header"));
}

#[tokio::test]
async fn discovery_rejects_wrong_agent_key() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/discovery/healthcheck")
                .header("X-Agent-Key", "wrong")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"instanceID":"a","serviceName":"container_service"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_text(resp).await;
    assert!(body.contains("invalid X-Agent-Key"));
}

#[tokio::test]
async fn logout_without_session_bounces_to_login() {
    let app = test_app();
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/logout")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(resp.status().is_redirection());
    assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/auth/login");
}

#[tokio::test]
async fn redisinsight_disabled_is_not_found_for_admins_only_route() {
    let app = test_app();
    // Without a session the admin middleware answers first.
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/redisinsight/ui/index.html")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}
