use serenity::{async_trait, model::id::GuildId};
use songbird::{
    events::context_data::DisconnectReason, model::CloseCode, tracks::TrackHandle, Call,
    CoreEvent, Event as VoiceEvent, EventContext, EventHandler as VoiceEventHandler, TrackEvent,
};
use tracing::{debug, error, info, warn};

use super::session::{SessionEvent, SessionSender};
use crate::error::{PlaybackError, PlaybackResult};

/// Handler para el fin de un track
pub struct TrackEndHandler {
    pub guild_id: GuildId,
    pub play_id: u64,
    pub events: SessionSender,
}

#[async_trait]
impl VoiceEventHandler for TrackEndHandler {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        debug!("🎵 Track {} terminó en guild {}", self.play_id, self.guild_id);

        // La sesión pudo haberse cerrado ya
        let _ = self.events.send(SessionEvent::PlaybackFinished {
            play_id: self.play_id,
        });

        None
    }
}

/// Handler para errores de tracks: se tratan como fin de reproducción
pub struct TrackErrorHandler {
    pub guild_id: GuildId,
    pub play_id: u64,
    pub events: SessionSender,
}

#[async_trait]
impl VoiceEventHandler for TrackErrorHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        if let EventContext::Track(track_list) = ctx {
            for (state, _handle) in *track_list {
                error!(
                    "❌ Error en track para guild {}: {:?}",
                    self.guild_id, state.playing
                );
            }
        }

        let _ = self.events.send(SessionEvent::PlaybackFinished {
            play_id: self.play_id,
        });

        None
    }
}

/// Traduce el motivo de una desconexión del driver.
///
/// Una salida pedida (expulsión por un moderador, canal borrado) cierra la
/// sesión; cualquier otro fallo pasa por la política de reconexión.
pub fn disconnect_event(reason: Option<DisconnectReason>) -> SessionEvent {
    match reason {
        None
        | Some(DisconnectReason::Requested)
        | Some(DisconnectReason::WsClosed(Some(CloseCode::Disconnected))) => {
            SessionEvent::LinkClosed
        }
        Some(_) => SessionEvent::LinkDisconnected,
    }
}

/// Handler para caídas del driver de voz.
///
/// Está registrado en la llamada de una sola sesión, así que una salida
/// tardía de una sesión anterior nunca llega a la nueva.
pub struct DriverDisconnectHandler {
    pub guild_id: GuildId,
    pub events: SessionSender,
}

#[async_trait]
impl VoiceEventHandler for DriverDisconnectHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        let EventContext::DriverDisconnect(data) = ctx else {
            return None;
        };

        warn!(
            "🔌 Driver de voz desconectado en guild {}: {:?} ({:?})",
            self.guild_id, data.kind, data.reason
        );

        let _ = self.events.send(disconnect_event(data.reason));
        None
    }
}

/// Handler para conexiones y reconexiones del driver
pub struct DriverConnectHandler {
    pub guild_id: GuildId,
    pub events: SessionSender,
}

#[async_trait]
impl VoiceEventHandler for DriverConnectHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        if let EventContext::DriverReconnect(_) = ctx {
            info!("🔄 Driver de voz reconectado en guild {}", self.guild_id);
        }

        let _ = self.events.send(SessionEvent::LinkConnected);
        None
    }
}

/// Registra los eventos de conexión de una llamada
pub fn register_link_events(call: &mut Call, guild_id: GuildId, events: SessionSender) {
    call.add_global_event(
        VoiceEvent::Core(CoreEvent::DriverDisconnect),
        DriverDisconnectHandler {
            guild_id,
            events: events.clone(),
        },
    );

    call.add_global_event(
        VoiceEvent::Core(CoreEvent::DriverConnect),
        DriverConnectHandler {
            guild_id,
            events: events.clone(),
        },
    );

    call.add_global_event(
        VoiceEvent::Core(CoreEvent::DriverReconnect),
        DriverConnectHandler { guild_id, events },
    );

    debug!("✅ Eventos de voz registrados para guild {}", guild_id);
}

/// Registra fin y error de un track concreto
pub fn register_track_events(
    handle: &TrackHandle,
    guild_id: GuildId,
    play_id: u64,
    events: SessionSender,
) -> PlaybackResult<()> {
    handle
        .add_event(
            VoiceEvent::Track(TrackEvent::End),
            TrackEndHandler {
                guild_id,
                play_id,
                events: events.clone(),
            },
        )
        .map_err(PlaybackError::transport)?;

    handle
        .add_event(
            VoiceEvent::Track(TrackEvent::Error),
            TrackErrorHandler {
                guild_id,
                play_id,
                events,
            },
        )
        .map_err(PlaybackError::transport)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_leave_closes_session() {
        assert!(matches!(disconnect_event(None), SessionEvent::LinkClosed));
        assert!(matches!(
            disconnect_event(Some(DisconnectReason::Requested)),
            SessionEvent::LinkClosed
        ));
        assert!(matches!(
            disconnect_event(Some(DisconnectReason::WsClosed(Some(CloseCode::Disconnected)))),
            SessionEvent::LinkClosed
        ));
    }

    #[test]
    fn test_transient_failures_go_through_reconnect() {
        assert!(matches!(
            disconnect_event(Some(DisconnectReason::Io)),
            SessionEvent::LinkDisconnected
        ));
        assert!(matches!(
            disconnect_event(Some(DisconnectReason::TimedOut)),
            SessionEvent::LinkDisconnected
        ));
        assert!(matches!(
            disconnect_event(Some(DisconnectReason::WsClosed(None))),
            SessionEvent::LinkDisconnected
        ));
    }
}
