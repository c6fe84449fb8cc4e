//! SQLite-backed store for Spotify token records and pending authorizations.
//!
//! Tables:
//! - `users`: one encrypted token record per Discord user
//! - `auth_states`: in-flight OAuth nonces (SHA-256 digests only)
//! - `user_tracks`, `user_artists`, `playlists`, `command_logs`: see [`super::listening`]

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::crypto::CryptoEngine;
use crate::error::AuthError;

/// Token store backed by SQLite.
#[derive(Debug, Clone)]
pub struct TokenStore {
    pool: SqlitePool,
}

impl TokenStore {
    /// Open or create the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        info!("Opening database: {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("synchronous", "NORMAL")
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| AuthError::Database(format!("Failed to open SQLite database: {e}")))?;

        Ok(Self { pool })
    }

    /// Open an in-memory database, already migrated.
    pub async fn open_in_memory() -> Result<Self, AuthError> {
        let options = SqliteConnectOptions::new().filename(":memory:");

        // A single connection that never recycles, so every query sees the same database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<(), AuthError> {
        debug!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id          INTEGER PRIMARY KEY,
                spotify_user_id  TEXT,
                display_name     TEXT,
                access_token     TEXT NOT NULL,
                refresh_token    TEXT NOT NULL,
                scopes           TEXT NOT NULL DEFAULT '',
                expires_at       INTEGER NOT NULL,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_states (
                nonce_hash  TEXT PRIMARY KEY,
                user_id     INTEGER NOT NULL,
                created_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_tracks (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id       INTEGER NOT NULL,
                track_id      TEXT NOT NULL,
                track_name    TEXT NOT NULL,
                artist_names  TEXT NOT NULL,
                album_name    TEXT NOT NULL DEFAULT '',
                popularity    INTEGER NOT NULL DEFAULT 0,
                last_seen     INTEGER NOT NULL,
                UNIQUE(user_id, track_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_artists (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id       INTEGER NOT NULL,
                artist_id     TEXT NOT NULL,
                artist_name   TEXT NOT NULL,
                genres        TEXT NOT NULL DEFAULT '[]',
                popularity    INTEGER NOT NULL DEFAULT 0,
                last_updated  INTEGER NOT NULL,
                UNIQUE(user_id, artist_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS playlists (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id              INTEGER NOT NULL,
                spotify_playlist_id  TEXT NOT NULL,
                playlist_name        TEXT NOT NULL,
                playlist_type        TEXT NOT NULL,
                created_at           INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS command_logs (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id        INTEGER NOT NULL,
                guild_id       INTEGER,
                command_name   TEXT NOT NULL,
                success        INTEGER NOT NULL,
                error_message  TEXT,
                created_at     INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_auth_states_user ON auth_states(user_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_auth_states_created ON auth_states(created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_user_tracks_recent ON user_tracks(user_id, last_seen DESC)",
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Expose the pool for the listening-data helpers.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Authorization states
    // =========================================================================

    /// Record a freshly issued nonce.
    pub async fn insert_auth_state(
        &self,
        nonce_hash: &str,
        user_id: u64,
        created_at: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        sqlx::query("INSERT INTO auth_states (nonce_hash, user_id, created_at) VALUES (?, ?, ?)")
            .bind(nonce_hash)
            .bind(db_id(user_id))
            .bind(created_at.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove and return the state for `nonce_hash` in one statement.
    ///
    /// Two callbacks racing on the same nonce cannot both get `Some`.
    pub async fn take_auth_state(
        &self,
        nonce_hash: &str,
    ) -> Result<Option<AuthorizationState>, AuthError> {
        let row = sqlx::query(
            "DELETE FROM auth_states WHERE nonce_hash = ? RETURNING nonce_hash, user_id, created_at",
        )
        .bind(nonce_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| AuthorizationState {
            nonce_hash: row.get(0),
            user_id: user_id_from_db(row.get(1)),
            created_at: from_timestamp(row.get(2)),
        }))
    }

    /// Drop every pending state of `user_id`. Returns how many were removed.
    pub async fn delete_auth_states_for_user(&self, user_id: u64) -> Result<u64, AuthError> {
        let affected = sqlx::query("DELETE FROM auth_states WHERE user_id = ?")
            .bind(db_id(user_id))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    /// Drop states created at or before `cutoff`.
    pub async fn purge_expired_auth_states(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AuthError> {
        let affected = sqlx::query("DELETE FROM auth_states WHERE created_at <= ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    pub async fn count_auth_states(&self) -> Result<i64, AuthError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_states")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Token records
    // =========================================================================

    /// Insert or overwrite the token record of a user (stores encrypted tokens).
    pub async fn upsert_token_record(
        &self,
        crypto: &CryptoEngine,
        record: &TokenRecordUpsert,
    ) -> Result<(), AuthError> {
        let enc_access = crypto.encrypt(&record.access_token)?;
        let enc_refresh = crypto.encrypt(&record.refresh_token)?;
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO users
                (user_id, spotify_user_id, display_name, access_token, refresh_token,
                 scopes, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id)
            DO UPDATE SET
                spotify_user_id = excluded.spotify_user_id,
                display_name = excluded.display_name,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                scopes = excluded.scopes,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(db_id(record.user_id))
        .bind(&record.spotify_user_id)
        .bind(&record.display_name)
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(record.scopes.join(" "))
        .bind(record.expires_at.timestamp())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the decrypted token record of a user.
    pub async fn get_token_record(
        &self,
        crypto: &CryptoEngine,
        user_id: u64,
    ) -> Result<Option<TokenRecord>, AuthError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, spotify_user_id, display_name, access_token, refresh_token,
                   scopes, expires_at, created_at, updated_at
            FROM users
            WHERE user_id = ?
            "#,
        )
        .bind(db_id(user_id))
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let enc_access: String = row.get(3);
        let enc_refresh: String = row.get(4);
        let scopes: String = row.get(5);

        Ok(Some(TokenRecord {
            user_id: user_id_from_db(row.get(0)),
            spotify_user_id: row.get(1),
            display_name: row.get(2),
            access_token: crypto.decrypt(&enc_access)?,
            refresh_token: crypto.decrypt(&enc_refresh)?,
            scopes: split_scopes(&scopes),
            expires_at: from_timestamp(row.get(6)),
            created_at: from_timestamp(row.get(7)),
            updated_at: from_timestamp(row.get(8)),
        }))
    }

    /// Update a record's tokens after a refresh.
    ///
    /// The refresh token is only replaced when the provider rotated it.
    pub async fn update_refreshed_tokens(
        &self,
        crypto: &CryptoEngine,
        user_id: u64,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let enc_access = crypto.encrypt(access_token)?;
        let enc_refresh = match refresh_token {
            Some(rt) => Some(crypto.encrypt(rt)?),
            None => None,
        };

        let affected = sqlx::query(
            r#"
            UPDATE users
            SET access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                expires_at = ?,
                updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(expires_at.timestamp())
        .bind(Utc::now().timestamp())
        .bind(db_id(user_id))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(AuthError::NotConnected);
        }

        Ok(())
    }

    /// Hard-delete a user's token record. Returns whether one existed.
    pub async fn delete_token_record(&self, user_id: u64) -> Result<bool, AuthError> {
        let affected = sqlx::query("DELETE FROM users WHERE user_id = ?")
            .bind(db_id(user_id))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Connection metadata for a user (no tokens).
    pub async fn get_connection(&self, user_id: u64) -> Result<Option<ConnectionInfo>, AuthError> {
        let row = sqlx::query(
            r#"
            SELECT spotify_user_id, display_name, scopes, expires_at, created_at, updated_at
            FROM users
            WHERE user_id = ?
            "#,
        )
        .bind(db_id(user_id))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let scopes: String = row.get(2);
            ConnectionInfo {
                user_id,
                spotify_user_id: row.get(0),
                display_name: row.get(1),
                scopes: split_scopes(&scopes),
                expires_at: from_timestamp(row.get(3)),
                connected_at: from_timestamp(row.get(4)),
                updated_at: from_timestamp(row.get(5)),
            }
        }))
    }

    /// Erase everything stored about a user in one transaction.
    pub async fn erase_user(&self, user_id: u64) -> Result<ErasureReport, AuthError> {
        let id = db_id(user_id);
        let mut tx = self.pool.begin().await?;
        let mut report = ErasureReport::default();

        for (table, counter) in [
            ("users", &mut report.token_records),
            ("auth_states", &mut report.auth_states),
            ("user_tracks", &mut report.tracks),
            ("user_artists", &mut report.artists),
            ("playlists", &mut report.playlists),
            ("command_logs", &mut report.command_logs),
        ] {
            *counter = sqlx::query(&format!("DELETE FROM {table} WHERE user_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(report)
    }
}

// ── Types ────────────────────────────────────────────────────────────────────

/// In-flight authorization request, keyed by the digest of its nonce.
#[derive(Debug, Clone)]
pub struct AuthorizationState {
    pub nonce_hash: String,
    pub user_id: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenRecordUpsert {
    pub user_id: u64,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub spotify_user_id: Option<String>,
    pub display_name: Option<String>,
}

/// A user's granted Spotify access, decrypted.
#[derive(Clone)]
pub struct TokenRecord {
    pub user_id: u64,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub spotify_user_id: Option<String>,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    /// True when the access token expires within `margin` of `now`, or already has.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at - margin <= now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("spotify_user_id", &self.spotify_user_id)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for TokenRecordUpsert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecordUpsert")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub user_id: u64,
    pub spotify_user_id: Option<String>,
    pub display_name: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Rows removed per table by [`TokenStore::erase_user`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct ErasureReport {
    pub token_records: u64,
    pub auth_states: u64,
    pub tracks: u64,
    pub artists: u64,
    pub playlists: u64,
    pub command_logs: u64,
}

impl ErasureReport {
    pub fn total(&self) -> u64 {
        self.token_records
            + self.auth_states
            + self.tracks
            + self.artists
            + self.playlists
            + self.command_logs
    }
}

// Discord snowflakes fit in 63 bits, so the casts are lossless.
pub(crate) fn db_id(user_id: u64) -> i64 {
    user_id as i64
}

pub(crate) fn user_id_from_db(id: i64) -> u64 {
    id as u64
}

pub(crate) fn from_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn split_scopes(scopes: &str) -> Vec<String> {
    scopes.split_whitespace().map(str::to_string).collect()
}
