use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use crate::api::pages;

/// Unified error type for tunebot.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    // ── Token Lifecycle ─────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid or expired state parameter")]
    InvalidState,

    #[error("Authorization denied by user: {0}")]
    AuthorizationDenied(String),

    #[error("Authorization code exchange failed: {0}")]
    Exchange(String),

    #[error("No Spotify account connected")]
    NotConnected,

    #[error("Spotify connection expired, reauthorization required")]
    ReauthorizationRequired,

    // ── Provider Errors ─────────────────────────────────────────────────
    #[error("OAuth provider rejected request ({status}): {body}")]
    ProviderRejected { status: u16, body: String },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Spotify rejected the access token")]
    AccessTokenRejected,

    #[error("Spotify API error: {0}")]
    Api(String),

    // ── Internal ────────────────────────────────────────────────────────
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Discord error: {0}")]
    Discord(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Transport failures, timeouts and provider 5xx/429 responses.
    /// These are retried once and never alter persisted state.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::ServiceUnavailable(_))
    }

    /// Text shown to the Discord user or in the callback page.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::Configuration(_) => {
                "Spotify linking is not configured on this bot. Please contact the bot owner."
            }
            AuthError::InvalidState => {
                "This authorization link is invalid or has expired. Please run /connect again."
            }
            AuthError::AuthorizationDenied(_) => {
                "Spotify authorization was cancelled. Run /connect if you want to try again."
            }
            AuthError::Exchange(_) | AuthError::ProviderRejected { .. } => {
                "Spotify authorization failed. Please try /connect again."
            }
            AuthError::NotConnected => {
                "You haven't connected a Spotify account yet. Run /connect first."
            }
            AuthError::ReauthorizationRequired => {
                "Your Spotify connection has expired. Please run /connect to reconnect."
            }
            AuthError::ServiceUnavailable(_) => {
                "Spotify is not responding right now. Please try again in a moment."
            }
            AuthError::AccessTokenRejected => {
                "Spotify rejected the request. Please try again, or run /connect if it keeps happening."
            }
            AuthError::Api(_) => "Spotify returned an unexpected error. Please try again later.",
            AuthError::BadRequest(_) => {
                "The authorization request was incomplete. Please run /connect again."
            }
            AuthError::Crypto(_)
            | AuthError::Database(_)
            | AuthError::Discord(_)
            | AuthError::Internal(_) => "Something went wrong on our side. Please try again later.",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::InvalidState
            | AuthError::AuthorizationDenied(_)
            | AuthError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AuthError::NotConnected | AuthError::ReauthorizationRequired => StatusCode::UNAUTHORIZED,
            AuthError::Exchange(_)
            | AuthError::ProviderRejected { .. }
            | AuthError::AccessTokenRejected
            | AuthError::Api(_) => StatusCode::BAD_GATEWAY,
            AuthError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Crypto(_)
            | AuthError::Database(_)
            | AuthError::Discord(_)
            | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Database error: {e}");
        AuthError::Database(e.to_string())
    }
}

impl From<serenity::Error> for AuthError {
    fn from(e: serenity::Error) -> Self {
        AuthError::Discord(e.to_string())
    }
}

/// Errors reach the browser only through the OAuth callback, so they render
/// as the failure page rather than JSON.
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Callback failed: {self}");
        } else {
            tracing::warn!("Callback rejected: {self}");
        }
        (status, Html(pages::failure(self.user_message()))).into_response()
    }
}
