use std::sync::atomic::Ordering;

use axum::{
    extract::{Query, State},
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::pages;
use crate::error::AuthError;
use crate::SharedState;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/health", get(health))
        .route("/callback", get(oauth_callback))
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

/// GET /: Service and bot status.
async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "tunebot",
        "version": env!("CARGO_PKG_VERSION"),
        "bot_connected": state.bot_ready.load(Ordering::Relaxed),
        "spotify_configured": state.manager.is_configured(),
    }))
}

/// GET /health: Liveness check.
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

// =============================================================================
// OAuth callback
// =============================================================================

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// GET /callback: Spotify redirects here after the user approves or denies.
async fn oauth_callback(
    State(state): State<SharedState>,
    Query(q): Query<CallbackQuery>,
) -> Result<Html<String>, AuthError> {
    if let Some(error) = q.error {
        warn!("Spotify returned authorization error: {error}");
        return Err(AuthError::AuthorizationDenied(error));
    }

    let (Some(code), Some(nonce)) = (q.code, q.state) else {
        return Err(AuthError::BadRequest("missing code or state".into()));
    };

    let record = state.manager.complete_authorization(&nonce, &code).await?;
    info!("OAuth callback completed for user {}", record.user_id);

    Ok(Html(pages::success(record.display_name.as_deref())))
}
