pub mod api;
pub mod bot;
pub mod config;
pub mod crypto;
pub mod error;
pub mod oauth;
pub mod providers;
pub mod recommend;
pub mod spotify;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::AuthError;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use sqlx::SqlitePool;

/// Shared application state, used by both the callback server and the bot.
pub struct AppState {
    pub config: Config,
    /// Pool for the listening tables. Token rows are reached only through `manager`.
    pub db: SqlitePool,
    pub manager: oauth::TokenManager,
    pub spotify: spotify::SpotifyClient,
    /// Set once the Discord gateway reports ready.
    pub bot_ready: AtomicBool,
}

impl AppState {
    pub fn new(config: Config, store: store::TokenStore, manager: oauth::TokenManager) -> Self {
        Self {
            config,
            db: store.pool().clone(),
            manager,
            spotify: spotify::SpotifyClient::new(),
            bot_ready: AtomicBool::new(false),
        }
    }
}

pub type SharedState = Arc<AppState>;
