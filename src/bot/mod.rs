//! Discord gateway client and slash command wiring.

pub mod commands;

use std::sync::atomic::Ordering;

use serenity::async_trait;
use serenity::client::{Client, Context, EventHandler};
use serenity::gateway::ActivityData;
use serenity::model::application::{Command, Interaction};
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::guild::{Guild, UnavailableGuild};
use tracing::{error, info};

use crate::error::AuthError;
use crate::SharedState;

pub struct Handler {
    state: SharedState,
}

impl Handler {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(
            "{} connected to Discord ({} guilds)",
            ready.user.name,
            ready.guilds.len()
        );

        match Command::set_global_commands(&ctx.http, commands::create_commands()).await {
            Ok(registered) => info!("Registered {} slash commands", registered.len()),
            Err(e) => error!("Failed to register slash commands: {e}"),
        }

        ctx.set_activity(Some(ActivityData::listening("your music preferences")));
        self.state.bot_ready.store(true, Ordering::Relaxed);
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, is_new: Option<bool>) {
        if is_new == Some(true) {
            info!("Joined guild {} ({})", guild.name, guild.id);
        }
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        if !incomplete.unavailable {
            info!("Left guild {}", incomplete.id);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            commands::dispatch(&ctx, &command, &self.state).await;
        }
    }
}

/// Connect to the gateway and run until the shard manager stops.
pub async fn run(state: SharedState, token: &str) -> Result<(), AuthError> {
    let mut client = Client::builder(token, GatewayIntents::GUILDS)
        .event_handler(Handler::new(state.clone()))
        .await?;

    let result = client.start().await;
    state.bot_ready.store(false, Ordering::Relaxed);
    result.map_err(AuthError::from)
}
