use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use tunebot::config::Config;
use tunebot::crypto::CryptoEngine;
use tunebot::oauth::TokenManager;
use tunebot::store::TokenStore;
use tunebot::{api, bot, providers, AppState, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunebot=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("tunebot v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", config.summary());

    let report = config.validate();
    for warning in &report.warnings {
        warn!("{warning}");
    }
    if !report.is_valid() {
        for err in &report.errors {
            error!("{err}");
        }
        bail!("invalid configuration ({} errors)", report.errors.len());
    }

    let crypto = CryptoEngine::new(&config.master_key)?;
    let store = TokenStore::open(&config.database_path).await?;
    store.migrate().await?;
    info!("Database ready");

    let provider = providers::from_config(&config);
    let manager = TokenManager::new(
        store.clone(),
        crypto,
        provider,
        config.spotify_redirect_uri.clone(),
    );

    let discord_token = config
        .discord_token
        .clone()
        .context("DISCORD_TOKEN is required")?;

    let state: SharedState = Arc::new(AppState::new(config.clone(), store, manager));

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("Callback server listening on {}", config.bind_addr());
    let app = api::router(state.clone());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        result = bot::run(state, &discord_token) => {
            if let Err(e) = result {
                error!("Discord client stopped: {e}");
            }
        }
        result = server => {
            match result {
                Ok(Ok(())) => warn!("Callback server exited"),
                Ok(Err(e)) => error!("Callback server failed: {e}"),
                Err(e) => error!("Callback server task panicked: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
