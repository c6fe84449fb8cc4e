//! Listening data: top tracks/artists snapshots, created playlists and the
//! command log. Rows are keyed by Discord user id and erased together with the
//! token record by [`super::TokenStore::erase_user`].

use chrono::Utc;
use sqlx::SqlitePool;

use super::db::db_id;
use crate::error::AuthError;
use crate::spotify::models::{Artist, Track};

/// Upsert a batch of tracks seen for a user. Local files (no id) are skipped.
pub async fn save_tracks(db: &SqlitePool, user_id: u64, tracks: &[Track]) -> Result<u64, AuthError> {
    let now = Utc::now().timestamp();
    let mut tx = db.begin().await?;
    let mut saved = 0;

    for track in tracks {
        let Some(track_id) = track.id.as_deref() else {
            continue;
        };

        sqlx::query(
            r#"
            INSERT INTO user_tracks
                (user_id, track_id, track_name, artist_names, album_name, popularity, last_seen)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, track_id)
            DO UPDATE SET
                track_name = excluded.track_name,
                artist_names = excluded.artist_names,
                album_name = excluded.album_name,
                popularity = excluded.popularity,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(db_id(user_id))
        .bind(track_id)
        .bind(&track.name)
        .bind(track.artist_names())
        .bind(&track.album.name)
        .bind(i64::from(track.popularity))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        saved += 1;
    }

    tx.commit().await?;
    Ok(saved)
}

/// Upsert a user's top artists.
pub async fn save_artists(
    db: &SqlitePool,
    user_id: u64,
    artists: &[Artist],
) -> Result<u64, AuthError> {
    let now = Utc::now().timestamp();
    let mut tx = db.begin().await?;

    for artist in artists {
        let genres = serde_json::to_string(&artist.genres)
            .map_err(|e| AuthError::Internal(format!("Failed to encode genres: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO user_artists
                (user_id, artist_id, artist_name, genres, popularity, last_updated)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, artist_id)
            DO UPDATE SET
                artist_name = excluded.artist_name,
                genres = excluded.genres,
                popularity = excluded.popularity,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(db_id(user_id))
        .bind(&artist.id)
        .bind(&artist.name)
        .bind(genres)
        .bind(i64::from(artist.popularity))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(artists.len() as u64)
}

/// Remember a playlist the bot created for a user.
pub async fn record_playlist(
    db: &SqlitePool,
    user_id: u64,
    spotify_playlist_id: &str,
    name: &str,
    kind: &str,
) -> Result<(), AuthError> {
    sqlx::query(
        r#"
        INSERT INTO playlists (user_id, spotify_playlist_id, playlist_name, playlist_type, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(db_id(user_id))
    .bind(spotify_playlist_id)
    .bind(name)
    .bind(kind)
    .bind(Utc::now().timestamp())
    .execute(db)
    .await?;
    Ok(())
}

/// Append to the command log.
pub async fn log_command(db: &SqlitePool, entry: &CommandLogEntry<'_>) -> Result<(), AuthError> {
    sqlx::query(
        r#"
        INSERT INTO command_logs (user_id, guild_id, command_name, success, error_message, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(db_id(entry.user_id))
    .bind(entry.guild_id.map(db_id))
    .bind(entry.command)
    .bind(entry.success)
    .bind(entry.error)
    .bind(Utc::now().timestamp())
    .execute(db)
    .await?;
    Ok(())
}

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CommandLogEntry<'a> {
    pub user_id: u64,
    pub guild_id: Option<u64>,
    pub command: &'a str,
    pub success: bool,
    pub error: Option<&'a str>,
}
