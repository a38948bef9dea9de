use anyhow::Result;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    audio::session::{EnqueueOutcome, PlaybackState, QueueSnapshot},
    bot::OpenTilawaBot,
    error::PlaybackError,
};

/// Pistas de la cola que se muestran en `/queue`
const QUEUE_PAGE: usize = 10;

/// Identificador corto para seguir un comando en los logs
fn new_trace_id() -> String {
    format!("{:08x}", fastrand::u32(..))
}

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &OpenTilawaBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    let span = info_span!(
        "command",
        trace_id = %new_trace_id(),
        name = %command.data.name,
        guild = %guild_id
    );

    async move {
        info!("📝 Comando /{} usado por {}", command.data.name, command.user.name);
        bot.remember_text_channel(guild_id, command.channel_id);

        match command.data.name.as_str() {
            "play" => handle_play(ctx, &command, bot, guild_id).await,
            "pause" => {
                let result = bot.sessions.pause(guild_id).await;
                respond(ctx, &command, result.map(|_| "⏸️ Pausado".to_string())).await
            }
            "resume" => {
                let result = bot.sessions.resume(guild_id).await;
                respond(ctx, &command, result.map(|_| "▶️ Reanudado".to_string())).await
            }
            "skip" => {
                let result = bot.sessions.skip(guild_id).await;
                respond(ctx, &command, result.map(|track| format!("⏭️ Saltado: **{}**", track.title))).await
            }
            "stop" => {
                let result = bot.sessions.stop(guild_id).await;
                respond(ctx, &command, result.map(|_| "⏹️ Detenido y cola limpiada".to_string())).await
            }
            "queue" => {
                if !bot.sessions.has_session(guild_id) {
                    return respond(ctx, &command, Err(PlaybackError::NoActiveSession)).await;
                }
                let snapshot = bot.sessions.get_queue(guild_id).await;
                respond(ctx, &command, Ok(format_queue(&snapshot))).await
            }
            _ => respond(ctx, &command, Ok("❌ Comando no reconocido".to_string())).await,
        }
    }
    .instrument(span)
    .await
}

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &OpenTilawaBot,
    guild_id: GuildId,
) -> Result<()> {
    let input = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "input")
        .and_then(|opt| opt.value.as_str())
        .ok_or_else(|| anyhow::anyhow!("Entrada no proporcionada"))?;

    // Defer la respuesta ya que la descarga puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let voice_channel = get_user_voice_channel(ctx, guild_id, command.user.id);

    let content = match bot
        .sessions
        .enqueue(guild_id, voice_channel, command.user.id, input)
        .await
    {
        Ok(outcome) => format_enqueued(&outcome),
        Err(e) => {
            log_failure(&e);
            e.user_message()
        }
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;

    Ok(())
}

/// Responde al comando; los errores se muestran solo a quien lo usó
async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    result: Result<String, PlaybackError>,
) -> Result<()> {
    let (content, ephemeral) = match result {
        Ok(content) => (content, false),
        Err(e) => {
            log_failure(&e);
            (e.user_message(), true)
        }
    };

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;

    Ok(())
}

fn log_failure(error: &PlaybackError) {
    if error.is_user_error() {
        info!("Comando rechazado: {}", error);
    } else {
        warn!("❌ Comando fallido: {}", error);
    }
}

/// Canal de voz actual del usuario según la caché del gateway
fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;

    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}

fn format_enqueued(outcome: &EnqueueOutcome) -> String {
    let track = &outcome.track;
    let snapshot = &outcome.snapshot;

    let is_current = snapshot
        .current
        .as_ref()
        .is_some_and(|current| current.file_path == track.file_path);
    if is_current {
        return format!("▶️ Reproduciendo: **{}**", track.title);
    }

    match snapshot
        .upcoming
        .iter()
        .position(|queued| queued.file_path == track.file_path)
    {
        Some(index) => format!("📥 Agregado a la cola (#{}): **{}**", index + 1, track.title),
        None => format!("📥 Agregado: **{}**", track.title),
    }
}

fn format_queue(snapshot: &QueueSnapshot) -> String {
    if snapshot.current.is_none() && snapshot.upcoming.is_empty() && snapshot.pending == 0 {
        return "📭 La cola está vacía".to_string();
    }

    let mut lines = Vec::new();

    if let Some(current) = &snapshot.current {
        let marker = match snapshot.state {
            PlaybackState::Paused => "⏸️ En pausa",
            _ => "▶️ Sonando",
        };
        lines.push(format!("{}: **{}**", marker, current.title));
    }

    for (index, track) in snapshot.upcoming.iter().take(QUEUE_PAGE).enumerate() {
        lines.push(format!("`{}.` {}", index + 1, track.title));
    }

    if snapshot.upcoming.len() > QUEUE_PAGE {
        lines.push(format!("… y {} más", snapshot.upcoming.len() - QUEUE_PAGE));
    }

    if snapshot.pending > 0 {
        lines.push(format!("⏳ {} descargando", snapshot.pending));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::queue::tests::track;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_trace_ids_are_short_hex() {
        let id = new_trace_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_enqueued_message_reports_position() {
        let outcome = EnqueueOutcome {
            track: track("b"),
            snapshot: QueueSnapshot {
                state: PlaybackState::Playing,
                current: Some(track("a")),
                upcoming: vec![track("b")],
                pending: 0,
            },
        };
        assert_eq!(format_enqueued(&outcome), "📥 Agregado a la cola (#1): **b**");

        let playing = EnqueueOutcome {
            track: track("a"),
            snapshot: QueueSnapshot {
                state: PlaybackState::Playing,
                current: Some(track("a")),
                ..Default::default()
            },
        };
        assert_eq!(format_enqueued(&playing), "▶️ Reproduciendo: **a**");
    }

    #[test]
    fn test_queue_listing() {
        assert_eq!(format_queue(&QueueSnapshot::default()), "📭 La cola está vacía");

        let snapshot = QueueSnapshot {
            state: PlaybackState::Paused,
            current: Some(track("a")),
            upcoming: (0..12).map(|i| track(&format!("t{}", i))).collect(),
            pending: 2,
        };
        let listing = format_queue(&snapshot);
        let lines: Vec<&str> = listing.lines().collect();

        assert_eq!(lines[0], "⏸️ En pausa: **a**");
        assert_eq!(lines[1], "`1.` t0");
        assert_eq!(lines[11], "… y 2 más");
        assert_eq!(lines[12], "⏳ 2 descargando");
    }
}
