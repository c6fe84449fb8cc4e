//! HTTP surface: the OAuth redirect target and health checks.
//!
//! - `GET /`         bot and service status
//! - `GET /health`   liveness
//! - `GET /callback` Spotify authorization-code redirect

pub mod pages;
pub mod routes;

use crate::SharedState;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
