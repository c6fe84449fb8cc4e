//! Spotify token lifecycle: authorization-code flow, storage, lazy refresh.
//!
//! Per user: `Unauthorized -> Authorizing (nonce issued) -> Authorized`,
//! refreshes loop on `Authorized`, and disconnect or a rejected refresh goes
//! back to `Unauthorized`. An unconsumed nonce lapses after [`STATE_TTL`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::crypto::{generate_state_nonce, hash_state_nonce, CryptoEngine};
use crate::error::AuthError;
use crate::providers::{OAuthProvider, ProviderProfile};
use crate::store::{ConnectionInfo, ErasureReport, TokenRecord, TokenRecordUpsert, TokenStore};

/// How long an issued nonce stays valid.
pub const STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Tokens expiring within this window are refreshed before being handed out.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Upper bound on one outbound call to the provider.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before the single retry of a transient provider failure.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Lock table size above which idle per-user locks are dropped.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Sole owner of token records and authorization states.
pub struct TokenManager {
    store: TokenStore,
    crypto: CryptoEngine,
    provider: Option<Arc<dyn OAuthProvider>>,
    redirect_uri: String,
    scopes: Vec<String>,
    state_ttl: chrono::Duration,
    refresh_margin: chrono::Duration,
    provider_timeout: Duration,
    retry_backoff: Duration,
    user_locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    /// `provider` is `None` when client credentials are missing; every flow
    /// operation then fails with [`AuthError::Configuration`].
    pub fn new(
        store: TokenStore,
        crypto: CryptoEngine,
        provider: Option<Arc<dyn OAuthProvider>>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        let scopes = provider
            .as_ref()
            .map(|p| p.default_scopes())
            .unwrap_or_default();

        Self {
            store,
            crypto,
            provider,
            redirect_uri: redirect_uri.into(),
            scopes,
            state_ttl: to_chrono(STATE_TTL),
            refresh_margin: to_chrono(REFRESH_MARGIN),
            provider_timeout: PROVIDER_TIMEOUT,
            retry_backoff: RETRY_BACKOFF,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = to_chrono(ttl);
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Issue a nonce for `user_id` and return the provider authorization URL.
    ///
    /// Any earlier unconsumed nonce of the same user stops being valid.
    pub async fn begin_authorization(&self, user_id: u64) -> Result<String, AuthError> {
        let provider = self.provider()?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let purged = self
            .store
            .purge_expired_auth_states(now - self.state_ttl)
            .await?;
        if purged > 0 {
            debug!("Evicted {purged} expired authorization states");
        }

        let superseded = self.store.delete_auth_states_for_user(user_id).await?;
        if superseded > 0 {
            debug!("Superseded {superseded} pending authorization(s) for user {user_id}");
        }

        let nonce = generate_state_nonce();
        self.store
            .insert_auth_state(&hash_state_nonce(&nonce), user_id, now)
            .await?;

        info!("Authorization started for user {user_id}");
        Ok(provider.auth_url(&self.scopes, &nonce, &self.redirect_uri))
    }

    /// Consume `nonce`, exchange `code` and persist the user's token record.
    ///
    /// A rejected exchange spends the nonce; a transient failure restores it.
    pub async fn complete_authorization(
        &self,
        nonce: &str,
        code: &str,
    ) -> Result<TokenRecord, AuthError> {
        let provider = self.provider()?;

        let state = self
            .store
            .take_auth_state(&hash_state_nonce(nonce))
            .await?
            .ok_or_else(|| {
                warn!("Callback with unknown or already used state");
                AuthError::InvalidState
            })?;

        if state.created_at + self.state_ttl <= Utc::now() {
            warn!("Callback with expired state for user {}", state.user_id);
            return Err(AuthError::InvalidState);
        }

        let user_id = state.user_id;
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let tokens = match self
            .call_provider("code exchange", || {
                provider.exchange_code(code, &self.redirect_uri)
            })
            .await
        {
            Ok(tokens) => tokens,
            Err(AuthError::ProviderRejected { status, body }) => {
                return Err(AuthError::Exchange(format!(
                    "provider returned {status}: {body}"
                )));
            }
            Err(e) if e.is_transient() => {
                // Put the state back with its original age so the callback can be retried.
                self.store
                    .insert_auth_state(&state.nonce_hash, user_id, state.created_at)
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let issued_at = Utc::now();

        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            AuthError::Exchange("provider did not return a refresh token".into())
        })?;

        let profile = match self
            .call_provider("profile lookup", || provider.user_profile(&tokens.access_token))
            .await
        {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Profile lookup failed for user {user_id}: {e}");
                ProviderProfile::default()
            }
        };

        let scopes = match tokens.scope.as_deref() {
            Some(granted) => granted.split_whitespace().map(str::to_string).collect(),
            None => self.scopes.clone(),
        };

        self.store
            .upsert_token_record(
                &self.crypto,
                &TokenRecordUpsert {
                    user_id,
                    access_token: tokens.access_token.clone(),
                    refresh_token,
                    expires_at: tokens.expires_at(issued_at),
                    scopes,
                    spotify_user_id: profile.id,
                    display_name: profile.display_name,
                },
            )
            .await?;

        info!("User {user_id} connected their {} account", provider.display_name());

        self.store
            .get_token_record(&self.crypto, user_id)
            .await?
            .ok_or_else(|| AuthError::Internal("token record vanished after upsert".into()))
    }

    /// Return an access token that is not within the refresh margin of expiry,
    /// refreshing it first when needed.
    pub async fn get_valid_token(&self, user_id: u64) -> Result<String, AuthError> {
        let record = self.load(user_id).await?;
        if !record.needs_refresh(Utc::now(), self.refresh_margin) {
            return Ok(record.access_token);
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        // Whoever held the lock may have refreshed or disconnected already.
        let record = self.load(user_id).await?;
        if !record.needs_refresh(Utc::now(), self.refresh_margin) {
            debug!("Token for user {user_id} was refreshed concurrently");
            return Ok(record.access_token);
        }

        self.refresh_locked(record).await
    }

    /// Called when the Web API answered 401 to `rejected`, a token this manager
    /// handed out. Forces one refresh unless another caller already replaced it.
    pub async fn refresh_rejected_token(
        &self,
        user_id: u64,
        rejected: &str,
    ) -> Result<String, AuthError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let record = self.load(user_id).await?;
        if record.access_token != rejected {
            debug!("Rejected token for user {user_id} was already replaced");
            return Ok(record.access_token);
        }

        warn!("Spotify rejected the access token of user {user_id}, forcing refresh");
        self.refresh_locked(record).await
    }

    /// Run `call` with a valid token. If Spotify rejects it, refresh once and
    /// run `call` again with the replacement.
    pub async fn with_valid_token<T, F, Fut>(&self, user_id: u64, call: F) -> Result<T, AuthError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, AuthError>>,
    {
        let token = self.get_valid_token(user_id).await?;
        match call(token.clone()).await {
            Err(AuthError::AccessTokenRejected) => {
                let token = self.refresh_rejected_token(user_id, &token).await?;
                call(token).await
            }
            other => other,
        }
    }

    /// Delete the user's token record. Idempotent; returns whether one existed.
    pub async fn disconnect(&self, user_id: u64) -> Result<bool, AuthError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let existed = self.store.delete_token_record(user_id).await?;
        if existed {
            info!("User {user_id} disconnected");
        }
        Ok(existed)
    }

    /// Hard-delete everything stored about the user.
    pub async fn erase_user_data(&self, user_id: u64) -> Result<ErasureReport, AuthError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let report = self.store.erase_user(user_id).await?;
        info!("Erased {} rows for user {user_id}", report.total());
        Ok(report)
    }

    /// Connection metadata without secrets.
    pub async fn connection(&self, user_id: u64) -> Result<Option<ConnectionInfo>, AuthError> {
        self.store.get_connection(user_id).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn provider(&self) -> Result<&Arc<dyn OAuthProvider>, AuthError> {
        self.provider.as_ref().ok_or_else(|| {
            AuthError::Configuration("Spotify client credentials are not configured".into())
        })
    }

    async fn load(&self, user_id: u64) -> Result<TokenRecord, AuthError> {
        self.store
            .get_token_record(&self.crypto, user_id)
            .await?
            .ok_or(AuthError::NotConnected)
    }

    /// Caller must hold the user's lock.
    async fn refresh_locked(&self, record: TokenRecord) -> Result<String, AuthError> {
        let provider = self.provider()?;
        let user_id = record.user_id;

        let result = self
            .call_provider("token refresh", || {
                provider.refresh_token(&record.refresh_token)
            })
            .await;

        let tokens = match result {
            Ok(tokens) => tokens,
            Err(AuthError::ProviderRejected { status, body }) => {
                warn!("Refresh rejected for user {user_id} ({status}): {body}");
                self.store.delete_token_record(user_id).await?;
                return Err(AuthError::ReauthorizationRequired);
            }
            Err(e) => return Err(e),
        };

        let expires_at = tokens.expires_at(Utc::now());
        self.store
            .update_refreshed_tokens(
                &self.crypto,
                user_id,
                &tokens.access_token,
                tokens.refresh_token.as_deref(),
                expires_at,
            )
            .await?;

        info!(
            "Refreshed token for user {user_id} (rotated: {})",
            tokens.refresh_token.is_some()
        );
        Ok(tokens.access_token)
    }

    /// Run a provider call under the timeout, retrying a transient failure once.
    async fn call_provider<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, AuthError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AuthError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.provider_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(AuthError::ServiceUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.provider_timeout
                ))),
            };

            match result {
                Err(e) if e.is_transient() && attempt < 2 => {
                    warn!("{op} failed transiently, retrying: {e}");
                    attempt += 1;
                    tokio::time::sleep(self.retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    fn user_lock(&self, user_id: u64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if locks.len() >= LOCK_TABLE_PRUNE_AT {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        locks.entry(user_id).or_default().clone()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_crypto, test_manager, token_set, MockProvider, REDIRECT_URI};
    use chrono::Duration as ChronoDuration;

    fn state_from_url(url: &str) -> String {
        let parsed = url::Url::parse(url).unwrap();
        parsed
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    async fn connect(manager: &TokenManager, user_id: u64, code: &str) -> TokenRecord {
        let url = manager.begin_authorization(user_id).await.unwrap();
        manager
            .complete_authorization(&state_from_url(&url), code)
            .await
            .unwrap()
    }

    async fn seed_record(store: &TokenStore, user_id: u64, expires_in: ChronoDuration) {
        store
            .upsert_token_record(
                &test_crypto(),
                &TokenRecordUpsert {
                    user_id,
                    access_token: "stale-access".into(),
                    refresh_token: "original-refresh".into(),
                    expires_at: Utc::now() + expires_in,
                    scopes: vec!["user-top-read".into()],
                    spotify_user_id: Some("sp-user".into()),
                    display_name: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn begin_authorization_without_credentials_is_configuration_error() {
        let store = TokenStore::open_in_memory().await.unwrap();
        let manager = TokenManager::new(store, test_crypto(), None, REDIRECT_URI);

        let err = manager.begin_authorization(1).await.unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
        assert!(!manager.is_configured());
    }

    #[tokio::test]
    async fn begin_authorization_embeds_fresh_nonce() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider).await;

        let a = state_from_url(&manager.begin_authorization(1).await.unwrap());
        let b = state_from_url(&manager.begin_authorization(2).await.unwrap());
        assert_ne!(a, b);
        assert_eq!(store.count_auth_states().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn callback_creates_record_and_consumes_nonce() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        let user = 1001;

        let url = manager.begin_authorization(user).await.unwrap();
        let nonce = state_from_url(&url);

        let record = manager
            .complete_authorization(&nonce, "validcode")
            .await
            .unwrap();
        assert_eq!(record.user_id, user);
        assert_eq!(record.access_token, "access-validcode");
        assert_eq!(record.refresh_token, "refresh-1");
        assert_eq!(record.spotify_user_id.as_deref(), Some("spotify-access-validcode"));
        assert_eq!(record.scopes, vec!["user-top-read", "user-read-email"]);
        assert!(record.expires_at > Utc::now() + ChronoDuration::minutes(59));

        assert_eq!(store.count_auth_states().await.unwrap(), 0);
        assert_eq!(provider.exchange_count(), 1);
    }

    #[tokio::test]
    async fn nonce_is_single_use() {
        let provider = Arc::new(MockProvider::new());
        let (manager, _store) = test_manager(provider.clone()).await;

        let nonce = state_from_url(&manager.begin_authorization(1).await.unwrap());
        manager.complete_authorization(&nonce, "code").await.unwrap();

        let err = manager
            .complete_authorization(&nonce, "code")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));
        assert_eq!(provider.exchange_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_concurrent_callbacks_succeed_once() {
        let provider = Arc::new(MockProvider::new());
        let (manager, _store) = test_manager(provider.clone()).await;
        let manager = Arc::new(manager);

        let nonce = state_from_url(&manager.begin_authorization(1).await.unwrap());
        let (a, b) = tokio::join!(
            manager.complete_authorization(&nonce, "code"),
            manager.complete_authorization(&nonce, "code"),
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(provider.exchange_count(), 1);
    }

    #[tokio::test]
    async fn unknown_nonce_is_invalid_state() {
        let provider = Arc::new(MockProvider::new());
        let (manager, _store) = test_manager(provider.clone()).await;

        let err = manager
            .complete_authorization("never-issued", "code")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));
        assert_eq!(provider.exchange_count(), 0);
    }

    #[tokio::test]
    async fn expired_nonce_is_invalid_state() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        let manager = manager.with_state_ttl(Duration::from_secs(0));

        let nonce = state_from_url(&manager.begin_authorization(1).await.unwrap());
        let err = manager
            .complete_authorization(&nonce, "code")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidState));
        assert_eq!(provider.exchange_count(), 0);
        assert_eq!(store.count_auth_states().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconnect_invalidates_previous_nonce() {
        let provider = Arc::new(MockProvider::new());
        let (manager, _store) = test_manager(provider).await;

        let first = state_from_url(&manager.begin_authorization(1).await.unwrap());
        let second = state_from_url(&manager.begin_authorization(1).await.unwrap());

        let err = manager
            .complete_authorization(&first, "code")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));
        assert!(manager.complete_authorization(&second, "code").await.is_ok());
    }

    #[tokio::test]
    async fn rejected_code_is_exchange_error_and_spends_nonce() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider).await;

        let nonce = state_from_url(&manager.begin_authorization(1).await.unwrap());
        let err = manager
            .complete_authorization(&nonce, "badcode")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Exchange(_)));
        assert_eq!(store.count_auth_states().await.unwrap(), 0);
        assert!(matches!(
            manager.get_valid_token(1).await,
            Err(AuthError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn transient_exchange_failure_keeps_nonce_usable() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        provider.push_exchange(Err(AuthError::ServiceUnavailable("502".into())));
        provider.push_exchange(Err(AuthError::ServiceUnavailable("503".into())));

        let nonce = state_from_url(&manager.begin_authorization(1).await.unwrap());
        let err = manager
            .complete_authorization(&nonce, "code")
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(provider.exchange_count(), 2);
        assert_eq!(store.count_auth_states().await.unwrap(), 1);
        assert!(manager.connection(1).await.unwrap().is_none());

        let record = manager.complete_authorization(&nonce, "code").await.unwrap();
        assert_eq!(record.user_id, 1);
        assert_eq!(store.count_auth_states().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn restored_nonce_keeps_original_age() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        provider.push_exchange(Err(AuthError::ServiceUnavailable("502".into())));
        provider.push_exchange(Err(AuthError::ServiceUnavailable("502".into())));

        let nonce = state_from_url(&manager.begin_authorization(1).await.unwrap());
        let issued = store
            .take_auth_state(&hash_state_nonce(&nonce))
            .await
            .unwrap()
            .unwrap();
        store
            .insert_auth_state(&issued.nonce_hash, 1, issued.created_at)
            .await
            .unwrap();

        manager.complete_authorization(&nonce, "code").await.unwrap_err();

        let restored = store
            .take_auth_state(&hash_state_nonce(&nonce))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.created_at, issued.created_at);
        assert_eq!(restored.user_id, 1);
    }

    #[tokio::test]
    async fn exchange_without_refresh_token_stores_nothing() {
        let provider = Arc::new(MockProvider::new());
        let (manager, _store) = test_manager(provider.clone()).await;
        provider.push_exchange(Ok(token_set("access-only", None, 3600)));

        let nonce = state_from_url(&manager.begin_authorization(1).await.unwrap());
        let err = manager
            .complete_authorization(&nonce, "code")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Exchange(_)));
        assert!(manager.connection(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconnect_overwrites_record() {
        let provider = Arc::new(MockProvider::new());
        let (manager, _store) = test_manager(provider).await;

        connect(&manager, 5, "first").await;
        connect(&manager, 5, "second").await;

        assert_eq!(manager.get_valid_token(5).await.unwrap(), "access-second");
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let provider = Arc::new(MockProvider::new());
        let (manager, _store) = test_manager(provider.clone()).await;

        connect(&manager, 1, "code").await;
        assert_eq!(manager.get_valid_token(1).await.unwrap(), "access-code");
        assert_eq!(provider.refresh_count(), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 2, ChronoDuration::seconds(-5)).await;

        provider.push_refresh(Ok(token_set("new-access", None, 3600)));
        let token = manager.get_valid_token(2).await.unwrap();
        assert_eq!(token, "new-access");

        let record = store.get_token_record(&test_crypto(), 2).await.unwrap().unwrap();
        assert_eq!(record.access_token, "new-access");
        assert_eq!(record.refresh_token, "original-refresh");
        assert_eq!(record.user_id, 2);
        assert!(record.expires_at > Utc::now() + ChronoDuration::minutes(59));
        assert_eq!(
            provider.refresh_tokens_seen.lock().unwrap().as_slice(),
            ["original-refresh"]
        );
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 3, ChronoDuration::seconds(30)).await;

        let token = manager.get_valid_token(3).await.unwrap();
        assert_eq!(token, "refreshed-1");
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_old_one() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 4, ChronoDuration::seconds(-1)).await;

        provider.push_refresh(Ok(token_set("a2", Some("rotated-refresh"), 3600)));
        manager.get_valid_token(4).await.unwrap();

        let record = store.get_token_record(&test_crypto(), 4).await.unwrap().unwrap();
        assert_eq!(record.refresh_token, "rotated-refresh");
    }

    #[tokio::test]
    async fn revoked_refresh_requires_reauthorization_and_deletes_record() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 3, ChronoDuration::seconds(-5)).await;

        provider.push_refresh(Err(AuthError::ProviderRejected {
            status: 400,
            body: r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#.into(),
        }));

        let err = manager.get_valid_token(3).await.unwrap_err();
        assert!(matches!(err, AuthError::ReauthorizationRequired));
        assert!(store.get_token_record(&test_crypto(), 3).await.unwrap().is_none());
        assert!(matches!(
            manager.get_valid_token(3).await,
            Err(AuthError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn rejected_access_token_forces_refresh() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 30, ChronoDuration::hours(1)).await;

        assert_eq!(manager.get_valid_token(30).await.unwrap(), "stale-access");
        let token = manager
            .refresh_rejected_token(30, "stale-access")
            .await
            .unwrap();

        assert_eq!(token, "refreshed-1");
        assert_eq!(provider.refresh_count(), 1);
        assert_eq!(manager.get_valid_token(30).await.unwrap(), "refreshed-1");
    }

    #[tokio::test]
    async fn already_replaced_token_is_not_refreshed_again() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 31, ChronoDuration::hours(1)).await;

        let first = manager.refresh_rejected_token(31, "stale-access").await.unwrap();
        let second = manager.refresh_rejected_token(31, "stale-access").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test]
    async fn rejected_access_token_with_revoked_grant_deletes_record() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 32, ChronoDuration::hours(1)).await;
        provider.push_refresh(Err(AuthError::ProviderRejected {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.into(),
        }));

        let err = manager
            .refresh_rejected_token(32, "stale-access")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::ReauthorizationRequired));
        assert!(manager.connection(32).await.unwrap().is_none());
        assert!(matches!(
            manager.get_valid_token(32).await,
            Err(AuthError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn rejected_call_is_retried_with_refreshed_token() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 33, ChronoDuration::hours(1)).await;

        let used = manager
            .with_valid_token(33, |token| async move {
                if token == "stale-access" {
                    Err(AuthError::AccessTokenRejected)
                } else {
                    Ok(token)
                }
            })
            .await
            .unwrap();

        assert_eq!(used, "refreshed-1");
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test]
    async fn repeated_rejection_is_not_retried_twice() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 34, ChronoDuration::hours(1)).await;
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let result: Result<(), AuthError> = manager
            .with_valid_token(34, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(AuthError::AccessTokenRejected)
                }
            })
            .await;

        assert!(matches!(result, Err(AuthError::AccessTokenRejected)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(provider.refresh_count(), 1);
        assert!(manager.connection(34).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn transient_refresh_failure_is_retried_once() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 6, ChronoDuration::seconds(-5)).await;

        provider.push_refresh(Err(AuthError::ServiceUnavailable("502".into())));
        provider.push_refresh(Ok(token_set("after-retry", None, 3600)));

        assert_eq!(manager.get_valid_token(6).await.unwrap(), "after-retry");
        assert_eq!(provider.refresh_count(), 2);
    }

    #[tokio::test]
    async fn persistent_transient_failure_leaves_record_untouched() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 6, ChronoDuration::seconds(-5)).await;

        provider.push_refresh(Err(AuthError::ServiceUnavailable("502".into())));
        provider.push_refresh(Err(AuthError::ServiceUnavailable("503".into())));

        let err = manager.get_valid_token(6).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(provider.refresh_count(), 2);

        let record = store.get_token_record(&test_crypto(), 6).await.unwrap().unwrap();
        assert_eq!(record.access_token, "stale-access");
        assert_eq!(record.refresh_token, "original-refresh");
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_transient() {
        let provider = Arc::new(MockProvider::new().with_refresh_delay(Duration::from_millis(200)));
        let (manager, store) = test_manager(provider.clone()).await;
        let manager = manager.with_provider_timeout(Duration::from_millis(20));
        seed_record(&store, 8, ChronoDuration::seconds(-5)).await;

        let err = manager.get_valid_token(8).await.unwrap_err();
        assert!(matches!(err, AuthError::ServiceUnavailable(_)));
        assert_eq!(provider.refresh_count(), 2);
        assert!(store.get_token_record(&test_crypto(), 8).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_refreshes_call_provider_once() {
        let provider = Arc::new(MockProvider::new().with_refresh_delay(Duration::from_millis(50)));
        let (manager, store) = test_manager(provider.clone()).await;
        seed_record(&store, 9, ChronoDuration::seconds(10)).await;
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_valid_token(9).await })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(provider.refresh_count(), 1);
        assert!(tokens.iter().all(|t| t == "refreshed-1"));
    }

    #[tokio::test]
    async fn disconnect_then_get_valid_token_is_not_connected() {
        let provider = Arc::new(MockProvider::new());
        let (manager, _store) = test_manager(provider).await;

        connect(&manager, 11, "code").await;
        assert!(manager.disconnect(11).await.unwrap());
        assert!(!manager.disconnect(11).await.unwrap());

        assert!(matches!(
            manager.get_valid_token(11).await,
            Err(AuthError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn erase_user_data_removes_record_and_pending_states() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider).await;

        connect(&manager, 12, "code").await;
        manager.begin_authorization(12).await.unwrap();

        let report = manager.erase_user_data(12).await.unwrap();
        assert_eq!(report.token_records, 1);
        assert_eq!(report.auth_states, 1);
        assert!(manager.connection(12).await.unwrap().is_none());
        assert_eq!(store.count_auth_states().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn returned_token_is_never_past_expiry() {
        let provider = Arc::new(MockProvider::new());
        let (manager, store) = test_manager(provider).await;

        for (user, offset) in [(21, -3600), (22, -1), (23, 0), (24, 59), (25, 61), (26, 3600)] {
            seed_record(&store, user, ChronoDuration::seconds(offset)).await;
            manager.get_valid_token(user).await.unwrap();

            let record = store
                .get_token_record(&test_crypto(), user)
                .await
                .unwrap()
                .unwrap();
            assert!(!record.is_expired(Utc::now()), "user {user} got an expired token");
        }
    }
}
