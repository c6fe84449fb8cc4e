use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::models::{Artist, ArtistTopTracks, Paging, Playlist, TimeRange, Track};
use crate::error::AuthError;

const API_BASE: &str = "https://api.spotify.com/v1";

/// Most items the top-items endpoints return per page.
pub const MAX_TOP_ITEMS: u32 = 50;

/// Most URIs accepted by one "add items to playlist" call.
pub const PLAYLIST_BATCH: usize = 100;

/// Thin Spotify Web API client. Every call takes the caller's bearer token;
/// obtaining a fresh one is the token manager's job.
#[derive(Clone)]
pub struct SpotifyClient {
    http: reqwest::Client,
    base_url: String,
}

impl Default for SpotifyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SpotifyClient {
    pub fn new() -> Self {
        Self::with_base_url(API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn top_tracks(
        &self,
        access_token: &str,
        time_range: TimeRange,
        limit: u32,
    ) -> Result<Vec<Track>, AuthError> {
        let page: Paging<Track> = self
            .send(
                self.http
                    .get(format!("{}/me/top/tracks", self.base_url))
                    .query(&top_query(time_range, limit)),
                access_token,
            )
            .await?;
        Ok(page.items)
    }

    pub async fn top_artists(
        &self,
        access_token: &str,
        time_range: TimeRange,
        limit: u32,
    ) -> Result<Vec<Artist>, AuthError> {
        let page: Paging<Artist> = self
            .send(
                self.http
                    .get(format!("{}/me/top/artists", self.base_url))
                    .query(&top_query(time_range, limit)),
                access_token,
            )
            .await?;
        Ok(page.items)
    }

    /// An artist's most popular tracks in the user's own market.
    pub async fn artist_top_tracks(
        &self,
        access_token: &str,
        artist_id: &str,
    ) -> Result<Vec<Track>, AuthError> {
        let resp: ArtistTopTracks = self
            .send(
                self.http
                    .get(format!("{}/artists/{artist_id}/top-tracks", self.base_url))
                    .query(&[("market", "from_token")]),
                access_token,
            )
            .await?;
        Ok(resp.tracks)
    }

    /// Create a private playlist owned by `spotify_user_id` and fill it with
    /// `track_uris`, in batches the API accepts.
    pub async fn create_playlist(
        &self,
        access_token: &str,
        spotify_user_id: &str,
        name: &str,
        description: &str,
        track_uris: &[String],
    ) -> Result<Playlist, AuthError> {
        let playlist: Playlist = self
            .send(
                self.http
                    .post(format!("{}/users/{spotify_user_id}/playlists", self.base_url))
                    .json(&json!({
                        "name": name,
                        "description": description,
                        "public": false,
                    })),
                access_token,
            )
            .await?;

        for batch in track_uris.chunks(PLAYLIST_BATCH) {
            let _: serde_json::Value = self
                .send(
                    self.http
                        .post(format!("{}/playlists/{}/tracks", self.base_url, playlist.id))
                        .json(&json!({ "uris": batch })),
                    access_token,
                )
                .await?;
        }

        debug!(
            "Created playlist {} with {} tracks",
            playlist.id,
            track_uris.len()
        );
        Ok(playlist)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        access_token: &str,
    ) -> Result<T, AuthError> {
        let resp = request
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AuthError::ServiceUnavailable(format!("Spotify request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_api_failure(status, &body));
        }

        resp.json()
            .await
            .map_err(|e| AuthError::Api(format!("Failed to parse Spotify response: {e}")))
    }
}

fn top_query(time_range: TimeRange, limit: u32) -> [(&'static str, String); 2] {
    [
        ("time_range", time_range.as_str().to_string()),
        ("limit", limit.clamp(1, MAX_TOP_ITEMS).to_string()),
    ]
}

/// 401 from the Web API means the bearer token was rejected between refresh and
/// use. The caller forces one refresh through the token manager.
fn classify_api_failure(status: StatusCode, body: &str) -> AuthError {
    match status {
        StatusCode::UNAUTHORIZED => AuthError::AccessTokenRejected,
        StatusCode::TOO_MANY_REQUESTS => {
            AuthError::ServiceUnavailable("Spotify rate limit reached".into())
        }
        s if s.is_server_error() => AuthError::ServiceUnavailable(format!("Spotify returned {s}")),
        s => AuthError::Api(format!("Spotify returned {s}: {body}")),
    }
}
