mod spotify;
mod traits;

pub use spotify::SpotifyProvider;
pub use traits::{OAuthProvider, ProviderProfile, TokenSet, DEFAULT_EXPIRES_IN_SECS};

use std::sync::Arc;

use crate::config::Config;

/// Build the Spotify provider if its credentials are configured.
pub fn from_config(config: &Config) -> Option<Arc<dyn OAuthProvider>> {
    match (&config.spotify_client_id, &config.spotify_client_secret) {
        (Some(id), Some(secret)) => Some(Arc::new(SpotifyProvider::new(id.clone(), secret.clone()))),
        _ => None,
    }
}
