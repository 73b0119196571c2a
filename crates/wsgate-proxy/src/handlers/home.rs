//! Platform home and 404 pages.

use axum::extract::State;
use axum::response::{Html, IntoResponse, Response};
use axum::Extension;
use log::debug;

use wsgate::ownership::OwnershipError;

use crate::auth::AuthContext;
use crate::render;
use crate::state::AppState;

/// GET /csplatform/home
pub async fn home(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Response {
    let container = match state.ownership.get(&ctx.username).await {
        Ok(info) => Some(info),
        Err(OwnershipError::NotFound) => None,
        Err(e) => {
            debug!("ownership lookup failed on home page: {e}");
            None
        }
    };
    let container = container.as_ref().map(|c| {
        (
            c.container_name.as_str(),
            c.agent_host.as_str(),
            c.created_at.as_str(),
        )
    });
    Html(render::home_page(&ctx.username, container)).into_response()
}

/// GET /csplatform/404
pub async fn not_found() -> Response {
    Html(render::not_found_page()).into_response()
}
