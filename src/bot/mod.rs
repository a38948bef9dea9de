//! # Bot Module
//!
//! Thin Discord adapter over the [`SessionRegistry`].
//!
//! This module contains:
//! - Slash command registration (`/play`, `/pause`, `/resume`, `/skip`,
//!   `/stop`, `/queue`)
//! - Command dispatch with plain-text replies
//! - Voice state tracking that feeds channel occupancy to the sessions
//! - A relay that posts session notices to the guild's last command channel
//!
//! ## Architecture
//!
//! [`OpenTilawaBot`] implements Serenity's [`EventHandler`]. It owns no
//! playback state: every command is forwarded to the registry, which routes it
//! to the guild's session task.

use anyhow::Result;
use dashmap::DashMap;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;
pub mod notices;

use crate::{audio::registry::SessionRegistry, config::Config};

/// Último canal de texto usado por guild, destino de los avisos
pub type TextChannels = Arc<DashMap<GuildId, ChannelId>>;

/// Handler principal del bot.
///
/// - `config`: configuración (tokens, guild de desarrollo)
/// - `sessions`: registro de sesiones de reproducción por guild
/// - `text_channels`: último canal de texto de cada guild
pub struct OpenTilawaBot {
    config: Arc<Config>,
    pub(crate) sessions: Arc<SessionRegistry>,
    text_channels: TextChannels,
}

impl OpenTilawaBot {
    pub fn new(config: Config, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            sessions,
            text_channels: Arc::new(DashMap::new()),
        }
    }

    pub fn text_channels(&self) -> TextChannels {
        self.text_channels.clone()
    }

    pub(crate) fn remember_text_channel(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.text_channels.insert(guild_id, channel_id);
    }

    /// Registra los comandos slash, por guild si `GUILD_ID` está definido
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");
        info!("🔧 Application ID: {}", self.config.application_id);

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id)
                    .await
                    .map_err(|e| {
                        error!("❌ Error registrando comandos de guild: {:?}", e);
                        anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                    })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

/// Miembros de un canal de voz que no son bots, según la caché.
///
/// `None` si el guild no está en caché.
fn count_listeners(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> Option<usize> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;

    let listeners = guild
        .voice_states
        .values()
        .filter(|state| state.channel_id == Some(channel_id))
        .filter(|state| {
            let is_bot = state
                .member
                .as_ref()
                .map(|member| member.user.bot)
                .or_else(|| guild.members.get(&state.user_id).map(|member| member.user.bot))
                .unwrap_or(false);
            !is_bot
        })
        .count();

    Some(listeners)
}

#[async_trait]
impl EventHandler for OpenTilawaBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Mantiene al día la ocupación del canal de cada sesión.
    ///
    /// Los cambios del propio bot no se tratan aquí: si lo expulsan, el
    /// driver de voz de su sesión lo informa a esa misma sesión.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let Some(session_channel) = self.sessions.voice_channel(guild_id) else {
            return;
        };

        let old_channel = old.as_ref().and_then(|state| state.channel_id);

        if new.user_id == ctx.cache.current_user().id {
            return;
        }

        if new.channel_id != Some(session_channel) && old_channel != Some(session_channel) {
            return;
        }

        match count_listeners(&ctx, guild_id, session_channel) {
            Some(listeners) => {
                debug!("👥 {} oyentes en canal {}", listeners, session_channel);
                self.sessions
                    .membership_changed(guild_id, session_channel, listeners);
            }
            None => debug!("Guild {} no está en caché", guild_id),
        }
    }
}
