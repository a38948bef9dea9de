use serenity::http::Http;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::TextChannels;
use crate::audio::session::SessionNotice;

/// Publica los avisos de las sesiones en el último canal de texto de cada guild
pub fn spawn_notice_relay(
    http: Arc<Http>,
    notices: flume::Receiver<SessionNotice>,
    text_channels: TextChannels,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv_async().await {
            let guild_id = notice.guild_id();

            let Some(content) = notice_message(&notice) else {
                debug!("Aviso sin mensaje en guild {}: {:?}", guild_id, notice);
                continue;
            };

            let Some(channel_id) = text_channels.get(&guild_id).map(|channel| *channel) else {
                debug!("Sin canal de texto conocido en guild {}", guild_id);
                continue;
            };

            if let Err(e) = channel_id.say(&http, content).await {
                warn!("No se pudo enviar aviso a {}: {:?}", channel_id, e);
            }
        }
    })
}

fn notice_message(notice: &SessionNotice) -> Option<String> {
    match notice {
        SessionNotice::PlaybackFinished { .. } => None,
        SessionNotice::QueueEnded { .. } => {
            Some("📭 La cola terminó. Usa `/play` para seguir escuchando".to_string())
        }
        SessionNotice::ConnectionLost { .. } => {
            Some("🔌 Se perdió la conexión de voz; la sesión se cerró".to_string())
        }
        SessionNotice::TrackFailed { input, .. } => Some(format!(
            "⚠️ No se pudo reproducir `{}`, pasando a la siguiente",
            input
        )),
    }
}
