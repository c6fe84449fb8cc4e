use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Lifetime assumed when the provider omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Upper bound on a reported lifetime (one year).
const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 3600;

/// A set of tokens returned from an OAuth provider after code exchange or refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    /// Present on exchange; on refresh only when the provider rotates it.
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

impl TokenSet {
    /// Absolute expiry of the access token, counted from `issued_at`.
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS).min(MAX_EXPIRES_IN_SECS);
        issued_at + chrono::Duration::seconds(secs as i64)
    }
}

/// Account details of the user who granted access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: Option<String>,
    pub display_name: Option<String>,
}

/// Trait implemented by the OAuth provider the bot links accounts with.
///
/// Implementations classify failures: transport errors, timeouts and 5xx/429
/// responses become [`AuthError::ServiceUnavailable`]; any other non-success
/// response becomes [`AuthError::ProviderRejected`].
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Human-readable display name.
    fn display_name(&self) -> &str;

    /// Scopes requested when the caller does not override them.
    fn default_scopes(&self) -> Vec<String>;

    /// Build the authorization URL that the user should be redirected to.
    ///
    /// - `scopes`: The OAuth scopes to request.
    /// - `state`: The single-use nonce for CSRF protection.
    /// - `redirect_uri`: The callback URL registered with the provider.
    fn auth_url(&self, scopes: &[String], state: &str, redirect_uri: &str) -> String;

    /// Exchange an authorization code for an access token and refresh token.
    async fn exchange_code(&self, code: &str, redirect_uri: &str)
        -> Result<TokenSet, AuthError>;

    /// Obtain a new access token using a refresh token.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, AuthError>;

    /// Look up the account that owns `access_token`.
    async fn user_profile(&self, _access_token: &str) -> Result<ProviderProfile, AuthError> {
        Ok(ProviderProfile::default())
    }
}
