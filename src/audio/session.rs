use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, error, info, warn};

use super::{
    idle::IdleReaper,
    queue::{SlotId, TrackQueue},
    voice_link::VoiceLink,
};
use crate::{
    cache,
    config::Config,
    error::{PlaybackError, PlaybackResult},
    sources::{MediaSource, Track},
};

pub type SessionSender = flume::Sender<SessionEvent>;
pub type NoticeSender = flume::Sender<SessionNotice>;

/// Estado de reproducción de una sesión
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
}

/// Avisos que la sesión publica hacia fuera (canal de texto, métricas...)
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    PlaybackFinished { guild_id: GuildId, track: Track },
    QueueEnded { guild_id: GuildId },
    ConnectionLost { guild_id: GuildId, reason: String },
    TrackFailed { guild_id: GuildId, input: String, reason: String },
}

impl SessionNotice {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::PlaybackFinished { guild_id, .. }
            | Self::QueueEnded { guild_id }
            | Self::ConnectionLost { guild_id, .. }
            | Self::TrackFailed { guild_id, .. } => *guild_id,
        }
    }
}

/// Foto de la cola en un instante
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub state: PlaybackState,
    pub current: Option<Track>,
    /// Pistas listas en orden de reproducción
    pub upcoming: Vec<Track>,
    /// Posiciones reservadas cuya descarga no ha terminado
    pub pending: usize,
}

/// Resultado de una petición de encolado
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub track: Track,
    pub snapshot: QueueSnapshot,
}

/// Buzón de una sesión: comandos de usuario y eventos del transporte,
/// procesados de uno en uno y en orden de llegada.
pub enum SessionEvent {
    Enqueue {
        input: String,
        requested_by: UserId,
        reply: oneshot::Sender<PlaybackResult<EnqueueOutcome>>,
    },
    FetchCompleted {
        slot: SlotId,
        result: PlaybackResult<Track>,
        reply: oneshot::Sender<PlaybackResult<EnqueueOutcome>>,
    },
    PlaybackFinished {
        play_id: u64,
    },
    Pause {
        reply: oneshot::Sender<PlaybackResult<()>>,
    },
    Resume {
        reply: oneshot::Sender<PlaybackResult<()>>,
    },
    Skip {
        reply: oneshot::Sender<PlaybackResult<Track>>,
    },
    Stop {
        reply: Option<oneshot::Sender<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    MembershipChanged {
        channel_id: ChannelId,
        non_bot_members: usize,
    },
    IdleExpired {
        generation: u64,
    },
    LinkDisconnected,
    /// El bot salió del canal a pedido (expulsado o canal borrado)
    LinkClosed,
    LinkConnected,
    ReconnectDue {
        epoch: u64,
    },
}

impl SessionEvent {
    /// Responde a una petición que ya no se va a procesar
    pub fn reject(self, reason: &str) {
        match self {
            Self::Enqueue { reply, .. } | Self::FetchCompleted { reply, .. } => {
                let _ = reply.send(Err(PlaybackError::transport(reason)));
            }
            Self::Pause { reply } | Self::Resume { reply } => {
                let _ = reply.send(Err(PlaybackError::NoActiveSession));
            }
            Self::Skip { reply } => {
                let _ = reply.send(Err(PlaybackError::NoActiveSession));
            }
            Self::Stop { reply: Some(reply) } => {
                let _ = reply.send(());
            }
            Self::Snapshot { reply } => {
                let _ = reply.send(QueueSnapshot::default());
            }
            _ => {}
        }
    }
}

/// Motivo del cierre de una sesión
pub enum Teardown {
    Stopped(Option<oneshot::Sender<()>>),
    Idle,
    ConnectionLost(String),
}

/// Parámetros de las sesiones
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_queue_size: usize,
    pub idle_timeout: Duration,
    pub reconnect_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            idle_timeout: Duration::from_secs(60),
            reconnect_grace: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            idle_timeout: config.idle_timeout,
            reconnect_grace: config.reconnect_grace,
        }
    }
}

/// Sesión de reproducción de un guild.
///
/// Es dueña exclusiva de su cola, su enlace de voz y su cuenta de
/// inactividad. Solo la toca la tarea que vacía su buzón, así que cada
/// operación ve el resultado completo de la anterior.
///
/// Cada pista que se entrega al transporte recibe un `play_id` nuevo. Los
/// eventos de fin con un id distinto del actual (por ejemplo, el fin que
/// genera un `skip`) se ignoran.
pub struct PlaybackSession {
    guild_id: GuildId,
    state: PlaybackState,
    current: Option<Track>,
    queue: TrackQueue,
    link: VoiceLink,
    reaper: IdleReaper,
    play_id: u64,
    suspended: bool,
    source: Arc<dyn MediaSource>,
    events: SessionSender,
    notices: NoticeSender,
}

impl PlaybackSession {
    pub fn new(
        guild_id: GuildId,
        link: VoiceLink,
        settings: &SessionSettings,
        source: Arc<dyn MediaSource>,
        events: SessionSender,
        notices: NoticeSender,
    ) -> Self {
        Self {
            guild_id,
            state: PlaybackState::Idle,
            current: None,
            queue: TrackQueue::new(settings.max_queue_size),
            link,
            reaper: IdleReaper::new(settings.idle_timeout),
            play_id: 0,
            suspended: false,
            source,
            events,
            notices,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            state: self.state,
            current: self.current.clone(),
            upcoming: self.queue.tracks(),
            pending: self.queue.pending(),
        }
    }

    /// Procesa un evento del buzón. Devuelve `Some` cuando la sesión debe cerrarse
    pub async fn handle(&mut self, event: SessionEvent) -> Option<Teardown> {
        match event {
            SessionEvent::Enqueue {
                input,
                requested_by,
                reply,
            } => self.request(&input, requested_by, reply),
            SessionEvent::FetchCompleted {
                slot,
                result,
                reply,
            } => {
                let outcome = self.fetch_completed(slot, result).await;
                let _ = reply.send(outcome);
            }
            SessionEvent::PlaybackFinished { play_id } => self.playback_finished(play_id).await,
            SessionEvent::Pause { reply } => {
                let _ = reply.send(self.pause().await);
            }
            SessionEvent::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            SessionEvent::Skip { reply } => {
                let _ = reply.send(self.skip().await);
            }
            SessionEvent::Stop { reply } => return Some(Teardown::Stopped(reply)),
            SessionEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionEvent::MembershipChanged {
                channel_id,
                non_bot_members,
            } => self.membership_changed(channel_id, non_bot_members),
            SessionEvent::IdleExpired { generation } => {
                if self.reaper.expired(generation) {
                    info!("⏰ Canal vacío en guild {}, cerrando sesión", self.guild_id);
                    return Some(Teardown::Idle);
                }
            }
            SessionEvent::LinkDisconnected => self.link_disconnected().await,
            SessionEvent::LinkClosed => {
                info!("🔌 Bot retirado del canal de voz en guild {}", self.guild_id);
                return Some(Teardown::Stopped(None));
            }
            SessionEvent::LinkConnected => {
                if self.link.on_connected() {
                    self.link_recovered().await;
                }
            }
            SessionEvent::ReconnectDue { epoch } => match self.link.reconnect_due(epoch).await {
                Ok(true) => self.link_recovered().await,
                Ok(false) => {}
                Err(e) => {
                    error!("❌ Reconexión fallida en guild {}: {}", self.guild_id, e);
                    return Some(Teardown::ConnectionLost(e.to_string()));
                }
            },
        }

        None
    }

    /// Reserva la posición y lanza la descarga sin bloquear el buzón
    pub fn request(
        &mut self,
        input: &str,
        requested_by: UserId,
        reply: oneshot::Sender<PlaybackResult<EnqueueOutcome>>,
    ) {
        let slot = match self.queue.reserve(input) {
            Ok(slot) => slot,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let source = self.source.clone();
        let events = self.events.clone();
        let input = input.to_string();

        tokio::spawn(async move {
            let result = source.fetch(&input, requested_by).await;
            if let Err(flume::SendError(SessionEvent::FetchCompleted {
                result: Ok(track), ..
            })) = events.send(SessionEvent::FetchCompleted {
                slot,
                result,
                reply,
            }) {
                debug!("Sesión cerrada, descarga descartada: {}", track.title);
            }
        });
    }

    /// Completa una posición reservada con el resultado de su descarga
    pub async fn fetch_completed(
        &mut self,
        slot: SlotId,
        result: PlaybackResult<Track>,
    ) -> PlaybackResult<EnqueueOutcome> {
        match result {
            Ok(track) => self.enqueue(slot, track).await,
            Err(e) => {
                if let Some(input) = self.queue.discard(slot) {
                    warn!("❌ Se descarta '{}' en guild {}: {}", input, self.guild_id, e);
                }
                if self.current.is_none() {
                    self.advance().await;
                    self.settle();
                }
                Err(e)
            }
        }
    }

    /// Coloca una pista descargada en su posición reservada; si la sesión
    /// está ociosa empieza a sonar
    pub async fn enqueue(&mut self, slot: SlotId, track: Track) -> PlaybackResult<EnqueueOutcome> {
        if !self.queue.fill(slot, track.clone()) {
            debug!("Posición {} ya no existe, se descarta {}", slot, track.title);
            return Err(PlaybackError::NoActiveSession);
        }
        if self.current.is_none() {
            self.advance().await;
            self.settle();
        }
        Ok(EnqueueOutcome {
            track,
            snapshot: self.snapshot(),
        })
    }

    /// Fin de la pista `play_id`, natural o por error
    pub async fn playback_finished(&mut self, play_id: u64) {
        if self.current.is_none() || play_id != self.play_id {
            debug!("Fin de pista obsoleto ({}) en guild {}", play_id, self.guild_id);
            return;
        }
        self.finish_current().await;
    }

    pub async fn pause(&mut self) -> PlaybackResult<()> {
        if self.state != PlaybackState::Playing {
            return Err(PlaybackError::NotPlaying);
        }
        self.link.pause().await?;
        self.state = PlaybackState::Paused;
        info!("⏸️ Pausado en guild {}", self.guild_id);
        Ok(())
    }

    pub async fn resume(&mut self) -> PlaybackResult<()> {
        if self.state != PlaybackState::Paused {
            return Err(PlaybackError::NotPaused);
        }
        self.link.resume().await?;
        self.state = PlaybackState::Playing;
        self.suspended = false;
        info!("▶️ Reanudado en guild {}", self.guild_id);
        Ok(())
    }

    /// Descarta la pista actual y pasa a la siguiente
    pub async fn skip(&mut self) -> PlaybackResult<Track> {
        let skipped = match (self.state, &self.current) {
            (PlaybackState::Playing | PlaybackState::Paused, Some(track)) => track.clone(),
            _ => return Err(PlaybackError::NotPlaying),
        };

        if let Err(e) = self.link.stop().await {
            warn!("Error deteniendo {}: {}", skipped.title, e);
        }

        info!("⏭️ Saltado: {} en guild {}", skipped.title, self.guild_id);
        self.finish_current().await;
        Ok(skipped)
    }

    /// Vacía la sesión y destruye el enlace. Idempotente
    pub async fn shutdown(&mut self, teardown: Teardown) {
        let discarded = self.queue.clear();
        self.reaper.cancel();
        self.current = None;
        self.state = PlaybackState::Idle;
        self.suspended = false;
        self.link.destroy().await;

        match teardown {
            Teardown::Stopped(reply) => {
                info!(
                    "⏹️ Sesión detenida en guild {} ({} posiciones descartadas)",
                    self.guild_id, discarded
                );
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Teardown::Idle => {
                info!("👋 Sesión cerrada por inactividad en guild {}", self.guild_id);
            }
            Teardown::ConnectionLost(reason) => {
                self.notify(SessionNotice::ConnectionLost {
                    guild_id: self.guild_id,
                    reason,
                });
            }
        }
    }

    fn membership_changed(&mut self, channel_id: ChannelId, non_bot_members: usize) {
        if channel_id != self.link.channel_id() {
            return;
        }
        self.reaper.membership_changed(non_bot_members, &self.events);
    }

    async fn link_disconnected(&mut self) {
        let Some((epoch, deadline)) = self.link.on_disconnected(Instant::now()) else {
            return;
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events.send(SessionEvent::ReconnectDue { epoch });
        });

        // Sin conexión no hay reproducción: se suspende hasta que vuelva
        if self.state == PlaybackState::Playing {
            if let Err(e) = self.link.pause().await {
                debug!("No se pudo pausar durante la desconexión: {}", e);
            }
            self.state = PlaybackState::Paused;
            self.suspended = true;
        }
    }

    async fn link_recovered(&mut self) {
        if self.suspended && self.state == PlaybackState::Paused {
            self.suspended = false;
            match self.link.resume().await {
                Ok(()) => self.state = PlaybackState::Playing,
                Err(e) => warn!("No se pudo reanudar tras reconectar: {}", e),
            }
        } else if self.current.is_none() {
            self.advance().await;
            self.settle();
        }
    }

    async fn finish_current(&mut self) {
        if let Some(track) = self.current.take() {
            self.notify(SessionNotice::PlaybackFinished {
                guild_id: self.guild_id,
                track,
            });
        }
        self.state = PlaybackState::Idle;
        self.suspended = false;

        self.advance().await;

        if self.current.is_none() && self.queue.is_empty() {
            info!("📭 Cola terminada en guild {}", self.guild_id);
            self.notify(SessionNotice::QueueEnded {
                guild_id: self.guild_id,
            });
        }
        self.settle();
    }

    /// Reproduce la cabeza de la cola si está lista y el enlace lo permite.
    /// Las pistas que el transporte no puede reproducir se descartan.
    async fn advance(&mut self) {
        while self.current.is_none() {
            if !self.link.is_ready() {
                debug!("Enlace {:?}, avance en espera", self.link.state());
                break;
            }
            let Some(track) = self.queue.pop_ready() else {
                break;
            };

            // Refresca el acceso para que la limpieza no lo expulse
            if let Err(e) = cache::touch(&track.file_path).await {
                debug!("No se pudo tocar {}: {}", track.file_path.display(), e);
            }

            self.play_id += 1;
            match self.link.play(&track.file_path, self.play_id).await {
                Ok(()) => {
                    info!("▶️ Reproduciendo: {} en guild {}", track.title, self.guild_id);
                    self.current = Some(track);
                    self.state = PlaybackState::Playing;
                }
                Err(e) => {
                    warn!("❌ No se pudo reproducir {}: {}", track.title, e);
                    self.notify(SessionNotice::TrackFailed {
                        guild_id: self.guild_id,
                        input: track.source_input,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if self.current.is_none() {
            self.state = PlaybackState::Idle;
        }
    }

    /// Sin nada que sonar ni esperar: arranca la cuenta de inactividad
    fn settle(&mut self) {
        if self.current.is_none() && self.queue.is_empty() && !self.reaper.is_armed() {
            self.reaper.arm(&self.events);
        }
    }

    fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).is_err() {
            debug!("Sin receptor de avisos para guild {}", self.guild_id);
        }
    }
}
