//! Route table for the agent.

use axum::middleware::from_fn_with_state;
use axum::routing::{any, delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{agent_key_middleware, session_auth_middleware};
use crate::handlers;
use crate::proxy::code_server_proxy;
use crate::state::AppState;

/// Assemble the agent router.
pub fn create_router(state: AppState) -> Router {
    // /api/v1 (shared agent key)
    let api = Router::new()
        .route("/containers", post(handlers::create_container))
        .route("/containers", get(handlers::list_containers))
        .route(
            "/containers/code-server",
            get(handlers::list_workspace_containers),
        )
        .route("/containers/defaults", get(handlers::container_defaults))
        .route("/containers/{id}/start", post(handlers::start_container))
        .route("/containers/{id}/stop", post(handlers::stop_container))
        .route(
            "/containers/{id}/restart",
            post(handlers::restart_container),
        )
        .route(
            "/containers/{id}",
            delete(handlers::remove_container).post(handlers::remove_container),
        )
        .route("/containers/{id}/logs", get(handlers::container_logs))
        .route("/containers/{id}/id", get(handlers::container_id_by_name))
        .route("/containers/{id}/exist", get(handlers::container_exists))
        .route("/containers/{id}/running", get(handlers::container_running))
        .route("/containers/{id}/stats", get(handlers::container_stats))
        .route("/metrics", get(handlers::metrics))
        .route("/tags", get(handlers::tags))
        .layer(from_fn_with_state(state.clone(), agent_key_middleware));

    // /code-server/*: session auth behind the shared agent key; the
    // /request carve-out is handled inside both middlewares.
    let code_server = Router::new()
        .route("/code-server", any(code_server_proxy))
        .route("/code-server/{*path}", any(code_server_proxy))
        .layer(from_fn_with_state(state.clone(), session_auth_middleware))
        .layer(from_fn_with_state(state.clone(), agent_key_middleware));

    Router::new()
        .nest("/api/v1", api)
        .merge(code_server)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::any())
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}
