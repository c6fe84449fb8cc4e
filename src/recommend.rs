//! Recommendation heuristic: popular tracks from the user's top artists that
//! are not already among their top tracks.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::AuthError;
use crate::spotify::{Artist, SpotifyClient, TimeRange, Track, MAX_TOP_ITEMS};

/// How many top artists are mined for candidates.
pub const SEED_ARTISTS: usize = 5;

/// Recommendations plus the listening data they were derived from, so the
/// caller can persist it.
#[derive(Debug, Default)]
pub struct Recommendations {
    pub tracks: Vec<Track>,
    pub top_tracks: Vec<Track>,
    pub top_artists: Vec<Artist>,
}

/// Fetch the user's listening data and pick up to `limit` tracks.
///
/// A failing artist lookup only narrows the candidate pool; failures of the
/// top-items calls are returned.
pub async fn build(
    client: &SpotifyClient,
    access_token: &str,
    time_range: TimeRange,
    limit: usize,
) -> Result<Recommendations, AuthError> {
    let top_tracks = client
        .top_tracks(access_token, time_range, MAX_TOP_ITEMS)
        .await?;
    let top_artists = client
        .top_artists(access_token, time_range, SEED_ARTISTS as u32)
        .await?;

    let mut candidates = Vec::new();
    for artist in top_artists.iter().take(SEED_ARTISTS) {
        match client.artist_top_tracks(access_token, &artist.id).await {
            Ok(tracks) => candidates.extend(tracks),
            Err(AuthError::AccessTokenRejected) => return Err(AuthError::AccessTokenRejected),
            Err(e) => warn!("Skipping artist {}: {e}", artist.id),
        }
    }

    let tracks = pick(candidates, &top_tracks, limit);
    debug!(
        "Picked {} recommendations from {} top artists",
        tracks.len(),
        top_artists.len()
    );

    Ok(Recommendations {
        tracks,
        top_tracks,
        top_artists,
    })
}

/// Deduplicate `candidates`, drop anything in `known` or without an id, and
/// keep the `limit` most popular. Ties keep candidate order.
pub fn pick(candidates: Vec<Track>, known: &[Track], limit: usize) -> Vec<Track> {
    let mut seen: HashSet<String> = known.iter().filter_map(|t| t.id.clone()).collect();

    let mut picked: Vec<Track> = candidates
        .into_iter()
        .filter(|t| match &t.id {
            Some(id) => seen.insert(id.clone()),
            None => false,
        })
        .collect();

    picked.sort_by(|a, b| b.popularity.cmp(&a.popularity));
    picked.truncate(limit);
    picked
}
