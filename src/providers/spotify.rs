use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::traits::{OAuthProvider, ProviderProfile, TokenSet};
use crate::error::AuthError;

const AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const PROFILE_URL: &str = "https://api.spotify.com/v1/me";

/// Spotify Accounts OAuth 2.0 provider.
///
/// Quirks:
/// - Client credentials go in an HTTP Basic header, not the form body.
/// - Access tokens live one hour.
/// - Refresh responses usually omit `refresh_token`; the old one stays valid.
/// - A revoked refresh token yields `400 invalid_grant`.
pub struct SpotifyProvider {
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SpotifyTokenResponse {
    access_token: String,
    #[serde(default = "bearer")]
    token_type: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

fn bearer() -> String {
    "Bearer".into()
}

#[derive(Debug, Deserialize)]
struct SpotifyProfileResponse {
    id: String,
    display_name: Option<String>,
}

impl SpotifyProvider {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            http: reqwest::Client::new(),
        }
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenSet, AuthError> {
        let resp = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::ServiceUnavailable(format!("Token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, body));
        }

        let token_resp: SpotifyTokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Internal(format!("Failed to parse token response: {e}")))?;

        Ok(TokenSet {
            access_token: token_resp.access_token,
            refresh_token: token_resp.refresh_token,
            token_type: token_resp.token_type,
            expires_in: token_resp.expires_in,
            scope: token_resp.scope,
        })
    }
}

#[async_trait]
impl OAuthProvider for SpotifyProvider {
    fn display_name(&self) -> &str {
        "Spotify"
    }

    fn default_scopes(&self) -> Vec<String> {
        vec![
            "user-read-private".into(),
            "user-read-email".into(),
            "user-top-read".into(),
            "user-read-recently-played".into(),
            "user-library-read".into(),
            "playlist-modify-public".into(),
            "playlist-modify-private".into(),
            "playlist-read-private".into(),
            "user-follow-read".into(),
        ]
    }

    fn auth_url(&self, scopes: &[String], state: &str, redirect_uri: &str) -> String {
        let scope_str = scopes.join(" ");
        format!(
            "{AUTHORIZE_URL}?\
             client_id={client_id}\
             &response_type=code\
             &redirect_uri={redirect_uri}\
             &scope={scope}\
             &state={state}\
             &show_dialog=true",
            client_id = urlencoding(&self.client_id),
            redirect_uri = urlencoding(redirect_uri),
            scope = urlencoding(&scope_str),
            state = urlencoding(state),
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, AuthError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn user_profile(&self, access_token: &str) -> Result<ProviderProfile, AuthError> {
        let resp = self
            .http
            .get(PROFILE_URL)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AuthError::ServiceUnavailable(format!("Profile request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, body));
        }

        let profile: SpotifyProfileResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Internal(format!("Failed to parse profile response: {e}")))?;

        Ok(ProviderProfile {
            id: Some(profile.id),
            display_name: profile.display_name,
        })
    }
}

/// Map a non-success status from Spotify Accounts onto the error taxonomy.
fn classify_failure(status: StatusCode, body: String) -> AuthError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AuthError::ServiceUnavailable(format!("Spotify returned {status}"))
    } else {
        AuthError::ProviderRejected {
            status: status.as_u16(),
            body,
        }
    }
}

fn urlencoding(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
