//! Route table for the proxy backend.

use axum::http::header::HeaderValue;
use axum::http::Method;
use axum::middleware::from_fn_with_state;
use axum::routing::{any, delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::middleware::{agent_key_middleware, auth_middleware, AuthLayer};
use crate::handlers::{auth, containers, discovery, home, redisinsight, sessions};
use crate::proxy::code_server_proxy;
use crate::state::AppState;

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = state.config.cors_origins();
    let layer = CorsLayer::new().allow_methods([
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
    ]);
    if origins.is_empty() {
        layer.allow_origin(AllowOrigin::any())
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

/// Assemble the full application router.
pub fn create_router(state: AppState) -> Router {
    // /api/v1 (admin)
    let api = Router::new()
        .route(
            "/sessions",
            get(sessions::list_sessions).delete(sessions::cancel_all),
        )
        .route(
            "/sessions/conns",
            post(sessions::list_conns).delete(sessions::cancel_conn),
        )
        .route("/sessions/idle", delete(sessions::close_idle))
        .route("/containers/create", post(containers::create_container))
        .layer(from_fn_with_state(AuthLayer::admins(&state), auth_middleware));

    // /csplatform (regular users)
    let csplatform = Router::new()
        .route("/home", get(home::home))
        .route("/404", get(home::not_found))
        .route("/containers/create", get(containers::show_create_form))
        .route("/containers/stop", post(containers::stop_container))
        .route("/containers/start", post(containers::start_container))
        .route("/containers/restart", post(containers::restart_container))
        .route("/containers/delete", post(containers::remove_container))
        .layer(from_fn_with_state(AuthLayer::users(&state), auth_middleware));

    // /discovery (shared agent key)
    let discovery_routes = Router::new()
        .route("/register", post(discovery::register))
        .route("/deregister", post(discovery::deregister))
        .route("/healthcheck", post(discovery::healthcheck))
        .route("/discover/{service_name}", get(discovery::discover))
        .layer(from_fn_with_state(state.clone(), agent_key_middleware));

    // /auth
    let logout = Router::new()
        .route("/logout", get(auth::logout).post(auth::logout))
        .layer(from_fn_with_state(AuthLayer::users(&state), auth_middleware));
    let auth_routes = Router::new()
        .route("/login", get(auth::get_login).post(auth::post_login))
        .merge(logout);

    // /code-server/* reverse proxy
    let code_server = Router::new()
        .route("/code-server", any(code_server_proxy))
        .route("/code-server/{*path}", any(code_server_proxy))
        .layer(from_fn_with_state(
            AuthLayer::proxy_users(&state),
            auth_middleware,
        ));

    // /redisinsight (admin-only passthrough)
    let redisinsight_routes = Router::new()
        .route(
            "/redisinsight/ui/{*path}",
            any(redisinsight::redisinsight_proxy),
        )
        .layer(from_fn_with_state(
            AuthLayer::proxy_admins(&state),
            auth_middleware,
        ));

    Router::new()
        .nest("/api/v1", api)
        .nest("/csplatform", csplatform)
        .nest("/discovery", discovery_routes)
        .nest("/auth", auth_routes)
        .merge(code_server)
        .merge(redisinsight_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state))
        .with_state(state)
}
