//! Spotify Web API access for the listening commands.

mod client;
pub mod models;

pub use client::{SpotifyClient, MAX_TOP_ITEMS, PLAYLIST_BATCH};
pub use models::{Artist, Playlist, TimeRange, Track};
