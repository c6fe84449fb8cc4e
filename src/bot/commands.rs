//! Slash command definitions and handlers.

use serenity::builder::{
    CreateActionRow, CreateButton, CreateCommand, CreateCommandOption, CreateEmbed,
    CreateEmbedFooter, CreateInteractionResponse, CreateInteractionResponseMessage,
    EditInteractionResponse,
};
use serenity::client::Context;
use serenity::model::application::{CommandInteraction, CommandOptionType};
use serenity::model::colour::Colour;
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::recommend;
use crate::spotify::{Artist, TimeRange, Track};
use crate::store::listening;
use crate::store::ConnectionInfo;
use crate::AppState;

const SPOTIFY_GREEN: Colour = Colour(0x1ED760);

/// Discord rejects embed descriptions longer than this.
const EMBED_DESCRIPTION_LIMIT: usize = 4096;

/// Entries shown by `/top`.
const TOP_LIMIT: u32 = 10;

pub fn create_commands() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("connect").description("Link your Spotify account"),
        CreateCommand::new("status").description("Show your Spotify connection"),
        CreateCommand::new("top")
            .description("Show your top tracks or artists")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "kind", "What to show")
                    .add_string_choice("Tracks", "tracks")
                    .add_string_choice("Artists", "artists")
                    .required(false),
            )
            .add_option(time_range_option()),
        CreateCommand::new("recommend")
            .description("Get tracks from your favourite artists you haven't played much")
            .add_option(time_range_option())
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::Boolean,
                    "playlist",
                    "Also save them as a private Spotify playlist",
                )
                .required(false),
            ),
        CreateCommand::new("disconnect").description("Unlink your Spotify account"),
        CreateCommand::new("deletedata")
            .description("Delete everything this bot stores about you"),
    ]
}

fn time_range_option() -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::String, "time_range", "Listening window")
        .add_string_choice("Last 4 weeks", "short_term")
        .add_string_choice("Last 6 months", "medium_term")
        .add_string_choice("All time", "long_term")
        .required(false)
}

/// Commands that call the Spotify Web API and are deferred before running.
pub fn is_slow(name: &str) -> bool {
    matches!(name, "top" | "recommend")
}

// =============================================================================
// Dispatch
// =============================================================================

/// Run a command and reply. Failures become an ephemeral message with
/// [`AuthError::user_message`]; every invocation lands in the command log.
pub async fn dispatch(ctx: &Context, command: &CommandInteraction, state: &AppState) {
    let name = command.data.name.as_str();
    let user_id = command.user.id.get();
    let deferred = is_slow(name);

    let deferral = if deferred {
        command.defer(&ctx.http).await.map_err(AuthError::from)
    } else {
        Ok(())
    };

    let result = match deferral {
        Err(e) => {
            // The interaction token is unusable, so there is nobody to report to.
            warn!("Failed to defer /{name}: {e}");
            Err(e)
        }
        Ok(()) => {
            let result = match name {
                "connect" => connect(ctx, command, state).await,
                "status" => status(ctx, command, state).await,
                "top" => top(ctx, command, state).await,
                "recommend" => recommend(ctx, command, state).await,
                "disconnect" => disconnect(ctx, command, state).await,
                "deletedata" => delete_data(ctx, command, state).await,
                other => {
                    debug!("Ignoring unknown command /{other}");
                    return;
                }
            };
            if let Err(e) = &result {
                report_failure(ctx, command, name, deferred, e).await;
            }
            result
        }
    };

    let error_text = result.as_ref().err().map(ToString::to_string);
    let guild_id = command.guild_id.map(|g| g.get());
    let Some(entry) = log_entry(name, user_id, guild_id, error_text.as_deref()) else {
        return;
    };
    if let Err(e) = listening::log_command(&state.db, &entry).await {
        warn!("Failed to log /{name}: {e}");
    }
}

async fn report_failure(
    ctx: &Context,
    command: &CommandInteraction,
    name: &str,
    deferred: bool,
    e: &AuthError,
) {
    let user_id = command.user.id.get();
    if e.status_code().is_server_error() {
        warn!("/{name} failed for user {user_id}: {e}");
    } else {
        debug!("/{name} rejected for user {user_id}: {e}");
    }
    let sent = if deferred {
        command
            .edit_response(
                &ctx.http,
                EditInteractionResponse::new().content(e.user_message()),
            )
            .await
            .map(|_| ())
    } else {
        respond(ctx, command, e.user_message(), true).await
    };
    if let Err(send_err) = sent {
        warn!("Failed to report error for /{name}: {send_err}");
    }
}

/// Command-log row for one invocation. A successful /deletedata erased the
/// log, so it gets no row.
fn log_entry<'a>(
    command: &'a str,
    user_id: u64,
    guild_id: Option<u64>,
    error: Option<&'a str>,
) -> Option<listening::CommandLogEntry<'a>> {
    if command == "deletedata" && error.is_none() {
        return None;
    }
    Some(listening::CommandLogEntry {
        user_id,
        guild_id,
        command,
        success: error.is_none(),
        error,
    })
}

async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    content: impl Into<String>,
    ephemeral: bool,
) -> serenity::Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await
}

// =============================================================================
// Handlers
// =============================================================================

async fn connect(
    ctx: &Context,
    command: &CommandInteraction,
    state: &AppState,
) -> Result<(), AuthError> {
    let user_id = command.user.id.get();
    let already = state.manager.connection(user_id).await?;
    let url = state.manager.begin_authorization(user_id).await?;

    let button = CreateButton::new_link(url).label("Connect Spotify");
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(connect_message(already.as_ref()))
                    .components(vec![CreateActionRow::Buttons(vec![button])])
                    .ephemeral(true),
            ),
        )
        .await?;
    Ok(())
}

async fn status(
    ctx: &Context,
    command: &CommandInteraction,
    state: &AppState,
) -> Result<(), AuthError> {
    let info = state.manager.connection(command.user.id.get()).await?;
    respond(ctx, command, status_message(info.as_ref()), true).await?;
    Ok(())
}

async fn top(
    ctx: &Context,
    command: &CommandInteraction,
    state: &AppState,
) -> Result<(), AuthError> {
    let user_id = command.user.id.get();
    let time_range = time_range_arg(command);
    let artists = string_arg(command, "kind") == Some("artists");

    let embed = if artists {
        let items = state
            .manager
            .with_valid_token(user_id, |token| async move {
                state.spotify.top_artists(&token, time_range, TOP_LIMIT).await
            })
            .await?;
        listening::save_artists(&state.db, user_id, &items).await?;
        CreateEmbed::new()
            .title(format!("Your top artists ({})", time_range.label()))
            .description(numbered(&items, "No top artists yet. Listen to more music!"))
    } else {
        let items = state
            .manager
            .with_valid_token(user_id, |token| async move {
                state.spotify.top_tracks(&token, time_range, TOP_LIMIT).await
            })
            .await?;
        listening::save_tracks(&state.db, user_id, &items).await?;
        CreateEmbed::new()
            .title(format!("Your top tracks ({})", time_range.label()))
            .description(numbered(&items, "No top tracks yet. Listen to more music!"))
    };

    command
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new().embed(embed.colour(SPOTIFY_GREEN)),
        )
        .await?;
    Ok(())
}

async fn recommend(
    ctx: &Context,
    command: &CommandInteraction,
    state: &AppState,
) -> Result<(), AuthError> {
    let user_id = command.user.id.get();
    let time_range = time_range_arg(command);
    let want_playlist = bool_arg(command, "playlist").unwrap_or(false);

    let limit = state.config.max_recommendations;
    let (recs, token) = state
        .manager
        .with_valid_token(user_id, |token| async move {
            let recs = recommend::build(&state.spotify, &token, time_range, limit).await;
            recs.map(|recs| (recs, token))
        })
        .await?;

    let pool = &state.db;
    listening::save_tracks(pool, user_id, &recs.top_tracks).await?;
    listening::save_artists(pool, user_id, &recs.top_artists).await?;

    let mut embed = CreateEmbed::new()
        .title("Recommended for you")
        .description(numbered(
            &recs.tracks,
            "Not enough listening history for recommendations yet.",
        ))
        .colour(SPOTIFY_GREEN)
        .footer(CreateEmbedFooter::new(format!(
            "Based on your top artists ({})",
            time_range.label()
        )));

    if want_playlist && !recs.tracks.is_empty() {
        let playlist_link = create_playlist(state, user_id, &token, &recs.tracks).await?;
        embed = embed.field("Playlist", playlist_link, false);
    }

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await?;
    Ok(())
}

async fn create_playlist(
    state: &AppState,
    user_id: u64,
    token: &str,
    tracks: &[Track],
) -> Result<String, AuthError> {
    let spotify_user_id = state
        .manager
        .connection(user_id)
        .await?
        .and_then(|c| c.spotify_user_id)
        .ok_or_else(|| AuthError::Api("Spotify user id unknown, run /connect again".into()))?;

    let uris: Vec<String> = tracks
        .iter()
        .filter(|t| !t.uri.is_empty())
        .take(state.config.max_playlist_tracks)
        .map(|t| t.uri.clone())
        .collect();

    let name = format!("tunebot picks {}", chrono::Utc::now().format("%Y-%m-%d"));
    let playlist = state
        .spotify
        .create_playlist(
            token,
            &spotify_user_id,
            &name,
            "Recommendations from your top artists",
            &uris,
        )
        .await?;

    listening::record_playlist(
        &state.db,
        user_id,
        &playlist.id,
        &playlist.name,
        "recommendations",
    )
    .await?;

    Ok(match playlist.external_urls.spotify {
        Some(url) => format!("[{}]({url})", playlist.name),
        None => playlist.name,
    })
}

async fn disconnect(
    ctx: &Context,
    command: &CommandInteraction,
    state: &AppState,
) -> Result<(), AuthError> {
    let existed = state.manager.disconnect(command.user.id.get()).await?;
    let message = if existed {
        "Your Spotify account has been disconnected."
    } else {
        "No Spotify account was connected."
    };
    respond(ctx, command, message, true).await?;
    Ok(())
}

async fn delete_data(
    ctx: &Context,
    command: &CommandInteraction,
    state: &AppState,
) -> Result<(), AuthError> {
    let report = state.manager.erase_user_data(command.user.id.get()).await?;
    let message = if report.total() == 0 {
        "There was no data stored about you.".to_string()
    } else {
        format!(
            "Deleted your data: {} stored tracks, {} artists, {} playlists and {} command log entries. \
             Your Spotify account is no longer linked.",
            report.tracks, report.artists, report.playlists, report.command_logs
        )
    };
    respond(ctx, command, message, true).await?;
    Ok(())
}

// =============================================================================
// Arguments and formatting
// =============================================================================

fn string_arg<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_str())
}

fn bool_arg(command: &CommandInteraction, name: &str) -> Option<bool> {
    command
        .data
        .options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_bool())
}

fn time_range_arg(command: &CommandInteraction) -> TimeRange {
    string_arg(command, "time_range")
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

fn connect_message(existing: Option<&ConnectionInfo>) -> String {
    match existing {
        Some(info) => format!(
            "You're already connected as **{}**. Authorizing again replaces that link. \
             The button expires in 10 minutes.",
            connected_name(info)
        ),
        None => "Click below to link your Spotify account. The link expires in 10 minutes."
            .to_string(),
    }
}

fn status_message(info: Option<&ConnectionInfo>) -> String {
    match info {
        Some(info) => format!(
            "Connected to Spotify as **{}** since <t:{}:D>. Scopes: {}",
            connected_name(info),
            info.connected_at.timestamp(),
            if info.scopes.is_empty() {
                "none".to_string()
            } else {
                info.scopes.join(", ")
            }
        ),
        None => "No Spotify account connected. Use /connect to link one.".to_string(),
    }
}

fn connected_name(info: &ConnectionInfo) -> &str {
    info.display_name
        .as_deref()
        .or(info.spotify_user_id.as_deref())
        .unwrap_or("unknown user")
}

trait Listed {
    fn line(&self) -> String;
}

impl Listed for Track {
    fn line(&self) -> String {
        self.to_string()
    }
}

impl Listed for Artist {
    fn line(&self) -> String {
        self.to_string()
    }
}

/// Numbered list that fits in an embed description; entries that would
/// overflow it are dropped.
fn numbered<T: Listed>(items: &[T], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }

    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        let line = format!("{}. {}\n", i + 1, item.line());
        if out.len() + line.len() > EMBED_DESCRIPTION_LIMIT {
            break;
        }
        out.push_str(&line);
    }
    out
}
