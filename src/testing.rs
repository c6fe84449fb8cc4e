//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;

use crate::config::Config;
use crate::crypto::CryptoEngine;
use crate::error::AuthError;
use crate::oauth::TokenManager;
use crate::providers::{OAuthProvider, ProviderProfile, TokenSet};
use crate::store::TokenStore;
use crate::{AppState, SharedState};

pub const REDIRECT_URI: &str = "http://localhost:5000/callback";

pub fn test_crypto() -> CryptoEngine {
    let key = base64::engine::general_purpose::STANDARD.encode([0x42u8; 32]);
    CryptoEngine::new(&key).unwrap()
}

pub fn token_set(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenSet {
    TokenSet {
        access_token: access.into(),
        refresh_token: refresh.map(str::to_string),
        token_type: "Bearer".into(),
        expires_in: Some(expires_in),
        scope: Some("user-top-read user-read-email".into()),
    }
}

/// Scripted provider. Queued results are returned first; afterwards exchange
/// succeeds for any code except `"badcode"` and refresh always succeeds.
#[derive(Default)]
pub struct MockProvider {
    pub exchange_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub refresh_tokens_seen: Mutex<Vec<String>>,
    exchange_script: Mutex<VecDeque<Result<TokenSet, AuthError>>>,
    refresh_script: Mutex<VecDeque<Result<TokenSet, AuthError>>>,
    refresh_delay: Option<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = Some(delay);
        self
    }

    pub fn push_exchange(&self, result: Result<TokenSet, AuthError>) {
        self.exchange_script.lock().unwrap().push_back(result);
    }

    pub fn push_refresh(&self, result: Result<TokenSet, AuthError>) {
        self.refresh_script.lock().unwrap().push_back(result);
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_count(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OAuthProvider for MockProvider {
    fn display_name(&self) -> &str {
        "Mock"
    }

    fn default_scopes(&self) -> Vec<String> {
        vec!["user-top-read".into(), "user-read-email".into()]
    }

    fn auth_url(&self, scopes: &[String], state: &str, redirect_uri: &str) -> String {
        format!(
            "https://accounts.example.com/authorize?state={state}&scope={}&redirect_uri={redirect_uri}",
            scopes.join("+")
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenSet, AuthError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.exchange_script.lock().unwrap().pop_front() {
            return result;
        }
        if code == "badcode" {
            return Err(AuthError::ProviderRejected {
                status: 400,
                body: r#"{"error":"invalid_grant"}"#.into(),
            });
        }
        Ok(token_set(&format!("access-{code}"), Some("refresh-1"), 3600))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.refresh_tokens_seen
            .lock()
            .unwrap()
            .push(refresh_token.to_string());
        if let Some(delay) = self.refresh_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(result) = self.refresh_script.lock().unwrap().pop_front() {
            return result;
        }
        Ok(token_set(&format!("refreshed-{n}"), None, 3600))
    }

    async fn user_profile(&self, access_token: &str) -> Result<ProviderProfile, AuthError> {
        Ok(ProviderProfile {
            id: Some(format!("spotify-{access_token}")),
            display_name: Some("Test Listener".into()),
        })
    }
}

pub async fn test_manager(provider: Arc<MockProvider>) -> (TokenManager, TokenStore) {
    let store = TokenStore::open_in_memory().await.unwrap();
    let manager = TokenManager::new(
        store.clone(),
        test_crypto(),
        Some(provider as Arc<dyn OAuthProvider>),
        REDIRECT_URI,
    )
    .with_retry_backoff(Duration::from_millis(1));
    (manager, store)
}

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 0,
        discord_token: Some("discord-token".into()),
        spotify_client_id: Some("client-id".into()),
        spotify_client_secret: Some("client-secret".into()),
        spotify_redirect_uri: REDIRECT_URI.into(),
        database_path: ":memory:".into(),
        master_key: String::new(),
        max_recommendations: 20,
        max_playlist_tracks: 100,
    }
}

pub async fn test_state(provider: Arc<MockProvider>) -> SharedState {
    let (manager, store) = test_manager(provider).await;
    Arc::new(AppState::new(test_config(), store, manager))
}
