use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{input::File as FileInput, tracks::TrackHandle, Call, Songbird};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use super::{events, session::SessionSender};
use crate::error::{PlaybackError, PlaybackResult};

/// Estado de la conexión de voz.
///
/// Un enlace solo existe una vez que la unión al canal terminó, así que
/// empieza en `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    Disconnected,
    Destroyed,
}

/// Operaciones de bajo nivel sobre una conexión de voz ya establecida.
///
/// Los eventos asíncronos (fin de pista, desconexión, reconexión) no se
/// devuelven aquí: el transporte los publica en el buzón de la sesión.
#[async_trait]
pub trait VoiceTransport: Send {
    /// Reproduce un archivo local; `play_id` acompaña al evento de fin
    async fn play(&mut self, path: &Path, play_id: u64) -> PlaybackResult<()>;
    async fn pause(&mut self) -> PlaybackResult<()>;
    async fn resume(&mut self) -> PlaybackResult<()>;
    async fn stop(&mut self) -> PlaybackResult<()>;
    /// Un único intento de volver a unirse al canal
    async fn reconnect(&mut self) -> PlaybackResult<()>;
    async fn leave(&mut self) -> PlaybackResult<()>;
}

/// Establece conexiones de voz
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: SessionSender,
    ) -> PlaybackResult<Box<dyn VoiceTransport>>;
}

/// Conexión de voz de una sesión, con su política de reconexión.
///
/// Ante una desconexión inesperada se fija un único plazo de gracia; al
/// vencer, si la conexión no volvió sola, se hace un solo intento de
/// reconexión. Si ese intento falla el error sube a la sesión, que se
/// destruye.
pub struct VoiceLink {
    guild_id: GuildId,
    channel_id: ChannelId,
    state: ConnectionState,
    disconnect_epoch: u64,
    grace: Duration,
    transport: Box<dyn VoiceTransport>,
}

impl VoiceLink {
    pub fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        grace: Duration,
        transport: Box<dyn VoiceTransport>,
    ) -> Self {
        Self {
            guild_id,
            channel_id,
            state: ConnectionState::Ready,
            disconnect_epoch: 0,
            grace,
            transport,
        }
    }

    /// Se une al canal del solicitante
    pub async fn connect(
        connector: &dyn VoiceConnector,
        guild_id: GuildId,
        channel_id: ChannelId,
        grace: Duration,
        events: SessionSender,
    ) -> PlaybackResult<Self> {
        debug!("🔌 Conectando a canal {} en guild {}", channel_id, guild_id);
        let transport = connector.connect(guild_id, channel_id, events).await?;
        Ok(Self::new(guild_id, channel_id, grace, transport))
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub async fn play(&mut self, path: &Path, play_id: u64) -> PlaybackResult<()> {
        if !self.is_ready() {
            return Err(PlaybackError::transport(format!(
                "voice link is {:?}",
                self.state
            )));
        }
        self.transport.play(path, play_id).await
    }

    pub async fn pause(&mut self) -> PlaybackResult<()> {
        if self.state == ConnectionState::Destroyed {
            return Ok(());
        }
        self.transport.pause().await
    }

    pub async fn resume(&mut self) -> PlaybackResult<()> {
        if !self.is_ready() {
            return Err(PlaybackError::transport("voice connection is reconnecting"));
        }
        self.transport.resume().await
    }

    pub async fn stop(&mut self) -> PlaybackResult<()> {
        if self.state == ConnectionState::Destroyed {
            return Ok(());
        }
        self.transport.stop().await
    }

    /// Cierra la conexión. Llamadas repetidas no hacen nada
    pub async fn destroy(&mut self) {
        if self.state == ConnectionState::Destroyed {
            return;
        }
        self.state = ConnectionState::Destroyed;

        if let Err(e) = self.transport.stop().await {
            debug!("Error deteniendo pista al destruir enlace: {}", e);
        }
        if let Err(e) = self.transport.leave().await {
            warn!("Error al salir del canal de voz en guild {}: {}", self.guild_id, e);
        }

        info!("👋 Enlace de voz destruido en guild {}", self.guild_id);
    }

    /// Registra una desconexión inesperada.
    ///
    /// Devuelve `(epoch, plazo)` la primera vez; mientras la conexión siga
    /// caída las desconexiones repetidas no extienden el plazo.
    pub fn on_disconnected(&mut self, now: Instant) -> Option<(u64, Instant)> {
        if self.state != ConnectionState::Ready {
            return None;
        }

        self.state = ConnectionState::Disconnected;
        self.disconnect_epoch += 1;
        let deadline = now + self.grace;

        warn!(
            "🔌 Conexión de voz perdida en guild {}, reintento en {:?}",
            self.guild_id, self.grace
        );
        Some((self.disconnect_epoch, deadline))
    }

    /// El driver volvió a conectar. Devuelve `true` si se recuperó de una caída
    pub fn on_connected(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Ready;
        info!("🔄 Conexión de voz restablecida en guild {}", self.guild_id);
        true
    }

    /// Vence el plazo de gracia `epoch`.
    ///
    /// - `Ok(false)`: plazo obsoleto o la conexión ya volvió
    /// - `Ok(true)`: el único intento de reconexión funcionó
    /// - `Err(_)`: la reconexión falló; la sesión debe destruirse
    pub async fn reconnect_due(&mut self, epoch: u64) -> PlaybackResult<bool> {
        if epoch != self.disconnect_epoch || self.state != ConnectionState::Disconnected {
            return Ok(false);
        }

        info!("🔄 Reintentando conexión de voz en guild {}", self.guild_id);
        self.transport.reconnect().await?;
        self.state = ConnectionState::Ready;
        Ok(true)
    }
}

/// Conector basado en songbird
pub struct SongbirdConnector {
    manager: Arc<Songbird>,
}

impl SongbirdConnector {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        session_events: SessionSender,
    ) -> PlaybackResult<Box<dyn VoiceTransport>> {
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(PlaybackError::transport)?;

        {
            let mut handler = call.lock().await;
            handler.remove_all_global_events();
            events::register_link_events(&mut handler, guild_id, session_events.clone());
        }

        info!("🔊 Conectado al canal de voz {} en guild {}", channel_id, guild_id);

        Ok(Box::new(SongbirdTransport {
            manager: self.manager.clone(),
            call,
            guild_id,
            channel_id,
            session_events,
            current: None,
        }))
    }
}

struct SongbirdTransport {
    manager: Arc<Songbird>,
    call: Arc<Mutex<Call>>,
    guild_id: GuildId,
    channel_id: ChannelId,
    session_events: SessionSender,
    current: Option<TrackHandle>,
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn play(&mut self, path: &Path, play_id: u64) -> PlaybackResult<()> {
        // El input de archivo es perezoso: comprobar antes de entregarlo al driver
        tokio::fs::metadata(path).await?;

        let input = FileInput::new(path.to_path_buf());
        let handle = {
            let mut call = self.call.lock().await;
            call.play_only_input(input.into())
        };

        events::register_track_events(&handle, self.guild_id, play_id, self.session_events.clone())?;

        debug!("▶️ Reproduciendo {} (play {})", path.display(), play_id);
        self.current = Some(handle);
        Ok(())
    }

    async fn pause(&mut self) -> PlaybackResult<()> {
        if let Some(track) = &self.current {
            track.pause().map_err(PlaybackError::transport)?;
        }
        Ok(())
    }

    async fn resume(&mut self) -> PlaybackResult<()> {
        if let Some(track) = &self.current {
            track.play().map_err(PlaybackError::transport)?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> PlaybackResult<()> {
        if let Some(track) = self.current.take() {
            // La pista pudo terminar por su cuenta
            if let Err(e) = track.stop() {
                debug!("Pista ya detenida: {}", e);
            }
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> PlaybackResult<()> {
        self.manager
            .join(self.guild_id, self.channel_id)
            .await
            .map(|_| ())
            .map_err(PlaybackError::transport)
    }

    async fn leave(&mut self) -> PlaybackResult<()> {
        match self.manager.remove(self.guild_id).await {
            Ok(()) | Err(songbird::error::JoinError::NoCall) => Ok(()),
            Err(e) => Err(PlaybackError::transport(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Transporte en memoria para las pruebas de sesión y registro.

    use super::*;
    use std::{
        collections::HashSet,
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Play(PathBuf, u64),
        Pause,
        Resume,
        Stop,
        Reconnect,
        Leave,
    }

    #[derive(Default)]
    pub struct Shared {
        pub calls: StdMutex<Vec<Call>>,
        pub failing_paths: StdMutex<HashSet<PathBuf>>,
        pub reconnect_fails: AtomicBool,
        pub connect_fails: AtomicBool,
        pub connects: AtomicUsize,
        pub events: StdMutex<Option<SessionSender>>,
    }

    impl Shared {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn last_play_id(&self) -> Option<u64> {
            self.calls().iter().rev().find_map(|call| match call {
                Call::Play(_, id) => Some(*id),
                _ => None,
            })
        }

        pub fn events(&self) -> SessionSender {
            self.events.lock().unwrap().clone().expect("connected")
        }
    }

    pub struct FakeTransport {
        pub shared: Arc<Shared>,
    }

    impl FakeTransport {
        pub fn boxed(shared: Arc<Shared>) -> Box<dyn VoiceTransport> {
            Box::new(Self { shared })
        }

        fn record(&self, call: Call) {
            self.shared.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl VoiceTransport for FakeTransport {
        async fn play(&mut self, path: &Path, play_id: u64) -> PlaybackResult<()> {
            if self.shared.failing_paths.lock().unwrap().contains(path) {
                return Err(PlaybackError::Io(std::io::ErrorKind::NotFound.into()));
            }
            self.record(Call::Play(path.to_path_buf(), play_id));
            Ok(())
        }

        async fn pause(&mut self) -> PlaybackResult<()> {
            self.record(Call::Pause);
            Ok(())
        }

        async fn resume(&mut self) -> PlaybackResult<()> {
            self.record(Call::Resume);
            Ok(())
        }

        async fn stop(&mut self) -> PlaybackResult<()> {
            self.record(Call::Stop);
            Ok(())
        }

        async fn reconnect(&mut self) -> PlaybackResult<()> {
            self.record(Call::Reconnect);
            if self.shared.reconnect_fails.load(Ordering::SeqCst) {
                return Err(PlaybackError::transport("still disconnected"));
            }
            Ok(())
        }

        async fn leave(&mut self) -> PlaybackResult<()> {
            self.record(Call::Leave);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeConnector {
        pub shared: Arc<Shared>,
    }

    #[async_trait]
    impl VoiceConnector for FakeConnector {
        async fn connect(
            &self,
            _guild_id: GuildId,
            _channel_id: ChannelId,
            events: SessionSender,
        ) -> PlaybackResult<Box<dyn VoiceTransport>> {
            if self.shared.connect_fails.load(Ordering::SeqCst) {
                return Err(PlaybackError::transport("missing permissions"));
            }
            self.shared.connects.fetch_add(1, Ordering::SeqCst);
            *self.shared.events.lock().unwrap() = Some(events);
            Ok(FakeTransport::boxed(self.shared.clone()))
        }
    }
}
