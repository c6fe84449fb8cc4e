use anyhow::{Context, Result};
use serde_json::json;

/// Application configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,

    // ── Discord ─────────────────────────────────────────────────────────
    pub discord_token: Option<String>,

    // ── Spotify ─────────────────────────────────────────────────────────
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    /// Must match a redirect URI registered on the Spotify app.
    pub spotify_redirect_uri: String,

    // ── Storage ─────────────────────────────────────────────────────────
    pub database_path: String,
    /// 32-byte base64-encoded master key for AES-256-GCM token encryption.
    pub master_key: String,

    // ── Limits ──────────────────────────────────────────────────────────
    pub max_recommendations: usize,
    pub max_playlist_tracks: usize,
}

/// Result of [`Config::validate`]. Errors are fatal at startup.
#[derive(Debug, Default)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "5000".into())
                .parse()
                .context("Invalid PORT")?,

            discord_token: non_empty_var("DISCORD_TOKEN"),

            spotify_client_id: non_empty_var("SPOTIFY_CLIENT_ID"),
            spotify_client_secret: non_empty_var("SPOTIFY_CLIENT_SECRET"),
            spotify_redirect_uri: std::env::var("SPOTIFY_REDIRECT_URI")
                .unwrap_or_else(|_| "http://localhost:5000/callback".into()),

            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "music_bot.db".into()),
            master_key: std::env::var("MASTER_KEY")
                .context("MASTER_KEY is required (32 bytes, base64)")?,

            max_recommendations: std::env::var("MAX_RECOMMENDATIONS")
                .unwrap_or_else(|_| "20".into())
                .parse()
                .context("Invalid MAX_RECOMMENDATIONS")?,
            max_playlist_tracks: std::env::var("MAX_PLAYLIST_TRACKS")
                .unwrap_or_else(|_| "100".into())
                .parse()
                .context("Invalid MAX_PLAYLIST_TRACKS")?,
        })
    }

    /// Check for missing credentials and risky settings.
    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();

        if self.discord_token.is_none() {
            report.errors.push("DISCORD_TOKEN is required".into());
        }
        if self.spotify_client_id.is_none() {
            report.errors.push("SPOTIFY_CLIENT_ID is required".into());
        }
        if self.spotify_client_secret.is_none() {
            report.errors.push("SPOTIFY_CLIENT_SECRET is required".into());
        }

        match url::Url::parse(&self.spotify_redirect_uri) {
            Ok(uri) => {
                let local = matches!(uri.host_str(), Some("localhost") | Some("127.0.0.1"));
                if uri.scheme() != "https" && !local {
                    report
                        .warnings
                        .push("SPOTIFY_REDIRECT_URI should use HTTPS in production".into());
                }
            }
            Err(e) => report
                .errors
                .push(format!("SPOTIFY_REDIRECT_URI is not a valid URL: {e}")),
        }

        if self.max_recommendations == 0 {
            report
                .warnings
                .push("MAX_RECOMMENDATIONS is 0, /recommend will return nothing".into());
        }

        report
    }

    /// Configuration summary safe to log (no secrets).
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "host": self.host,
            "port": self.port,
            "database_path": self.database_path,
            "redirect_uri": self.spotify_redirect_uri,
            "spotify_configured": self.spotify_client_id.is_some() && self.spotify_client_secret.is_some(),
            "limits": {
                "max_recommendations": self.max_recommendations,
                "max_playlist_tracks": self.max_playlist_tracks,
            },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
