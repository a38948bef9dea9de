use dashmap::{mapref::entry::Entry, DashMap};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info};

use super::{
    session::{
        EnqueueOutcome, NoticeSender, PlaybackSession, QueueSnapshot, SessionEvent,
        SessionSender, SessionSettings, Teardown,
    },
    voice_link::{VoiceConnector, VoiceLink},
};
use crate::{
    error::{PlaybackError, PlaybackResult},
    sources::{MediaSource, Track},
};

/// Referencia a una sesión viva: su buzón y el canal al que se unió
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    channel_id: ChannelId,
    events: SessionSender,
}

/// Turno de enlace de voz por guild; la entrada vive mientras alguna sesión la use
type LinkSlots = Arc<DashMap<GuildId, Arc<Mutex<()>>>>;

/// Registro de sesiones, una por guild.
///
/// La inserción y la baja de cada clave son atómicas respecto de `enqueue` y
/// `stop` concurrentes: tras un `stop`, el siguiente `enqueue` siempre crea
/// una sesión nueva. La sesión nueva espera a que la anterior suelte el
/// enlace de voz del guild antes de conectarse.
pub struct SessionRegistry {
    sessions: Arc<DashMap<GuildId, SessionHandle>>,
    link_slots: LinkSlots,
    connector: Arc<dyn VoiceConnector>,
    source: Arc<dyn MediaSource>,
    notices: NoticeSender,
    settings: SessionSettings,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn VoiceConnector>,
        source: Arc<dyn MediaSource>,
        notices: NoticeSender,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            link_slots: Arc::new(DashMap::new()),
            connector,
            source,
            notices,
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    /// Devuelve la sesión del guild o crea una uniéndose al canal del solicitante
    pub fn get_or_create(
        &self,
        guild_id: GuildId,
        requester_channel: Option<ChannelId>,
    ) -> PlaybackResult<SessionHandle> {
        let channel_id = requester_channel.ok_or(PlaybackError::NoVoiceChannel)?;

        let handle = match self.sessions.entry(guild_id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(self.spawn_session(guild_id, channel_id)).clone(),
        };
        Ok(handle)
    }

    pub fn has_session(&self, guild_id: GuildId) -> bool {
        self.sessions.contains_key(&guild_id)
    }

    /// Canal de voz de la sesión activa
    pub fn voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.sessions.get(&guild_id).map(|handle| handle.channel_id)
    }

    /// Encola una entrada; la descarga corre fuera del buzón de la sesión
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        requester_channel: Option<ChannelId>,
        requested_by: UserId,
        input: &str,
    ) -> PlaybackResult<EnqueueOutcome> {
        let handle = self.get_or_create(guild_id, requester_channel)?;

        let (reply, outcome) = oneshot::channel();
        handle
            .events
            .send(SessionEvent::Enqueue {
                input: input.to_string(),
                requested_by,
                reply,
            })
            .map_err(|_| PlaybackError::NoActiveSession)?;

        outcome.await.map_err(|_| PlaybackError::NoActiveSession)?
    }

    pub async fn pause(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.request(guild_id, |reply| SessionEvent::Pause { reply }).await?
    }

    pub async fn resume(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.request(guild_id, |reply| SessionEvent::Resume { reply }).await?
    }

    /// Salta la pista actual y devuelve la que se descartó
    pub async fn skip(&self, guild_id: GuildId) -> PlaybackResult<Track> {
        self.request(guild_id, |reply| SessionEvent::Skip { reply }).await?
    }

    /// Detiene y elimina la sesión
    pub async fn stop(&self, guild_id: GuildId) -> PlaybackResult<()> {
        let (_, handle) = self
            .sessions
            .remove(&guild_id)
            .ok_or(PlaybackError::NoActiveSession)?;

        let (reply, done) = oneshot::channel();
        if handle
            .events
            .send(SessionEvent::Stop { reply: Some(reply) })
            .is_ok()
        {
            // Si la sesión ya se estaba cerrando sola, el emisor se descarta
            let _ = done.await;
        }
        Ok(())
    }

    /// Como [`stop`](Self::stop), pero sin error si no hay sesión
    pub async fn remove(&self, guild_id: GuildId) {
        if self.stop(guild_id).await.is_err() {
            debug!("Sin sesión que eliminar en guild {}", guild_id);
        }
    }

    /// Estado de la cola; vacío si no hay sesión
    pub async fn get_queue(&self, guild_id: GuildId) -> QueueSnapshot {
        self.request(guild_id, |reply| SessionEvent::Snapshot { reply })
            .await
            .unwrap_or_default()
    }

    /// Nueva ocupación (sin contar bots) de un canal de voz del guild
    pub fn membership_changed(&self, guild_id: GuildId, channel_id: ChannelId, non_bot_members: usize) {
        if let Some(handle) = self.sessions.get(&guild_id) {
            let _ = handle.events.send(SessionEvent::MembershipChanged {
                channel_id,
                non_bot_members,
            });
        }
    }

    /// Cierra todas las sesiones
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        info!("🛑 Cerrando {} sesiones", guilds.len());

        for guild_id in guilds {
            self.remove(guild_id).await;
        }
    }

    async fn request<T>(
        &self,
        guild_id: GuildId,
        event: impl FnOnce(oneshot::Sender<T>) -> SessionEvent,
    ) -> PlaybackResult<T> {
        let events = self
            .sessions
            .get(&guild_id)
            .map(|handle| handle.events.clone())
            .ok_or(PlaybackError::NoActiveSession)?;

        let (reply, response) = oneshot::channel();
        events
            .send(event(reply))
            .map_err(|_| PlaybackError::NoActiveSession)?;

        response.await.map_err(|_| PlaybackError::NoActiveSession)
    }

    fn spawn_session(&self, guild_id: GuildId, channel_id: ChannelId) -> SessionHandle {
        let (events, mailbox) = flume::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let link_slot = self.link_slots.entry(guild_id).or_default().clone();

        let actor = SessionActor {
            id,
            guild_id,
            channel_id,
            mailbox,
            events: events.clone(),
            sessions: self.sessions.clone(),
            link_slots: self.link_slots.clone(),
            connector: self.connector.clone(),
            source: self.source.clone(),
            notices: self.notices.clone(),
            settings: self.settings.clone(),
        };
        tokio::spawn(actor.run(link_slot));

        info!("🆕 Sesión {} creada para guild {} en canal {}", id, guild_id, channel_id);
        SessionHandle {
            id,
            channel_id,
            events,
        }
    }
}

/// Tarea dueña de una sesión: conecta, vacía el buzón en orden y limpia al terminar
struct SessionActor {
    id: u64,
    guild_id: GuildId,
    channel_id: ChannelId,
    mailbox: flume::Receiver<SessionEvent>,
    events: SessionSender,
    sessions: Arc<DashMap<GuildId, SessionHandle>>,
    link_slots: LinkSlots,
    connector: Arc<dyn VoiceConnector>,
    source: Arc<dyn MediaSource>,
    notices: NoticeSender,
    settings: SessionSettings,
}

impl SessionActor {
    async fn run(self, link_slot: Arc<Mutex<()>>) {
        // Un solo enlace de voz vivo por guild
        let link_guard = link_slot.lock_owned().await;
        self.drive().await;
        drop(link_guard);

        // Nadie más espera el turno: la entrada sobra
        self.link_slots
            .remove_if(&self.guild_id, |_, slot| Arc::strong_count(slot) == 1);
    }

    async fn drive(&self) {
        let link = match VoiceLink::connect(
            self.connector.as_ref(),
            self.guild_id,
            self.channel_id,
            self.settings.reconnect_grace,
            self.events.clone(),
        )
        .await
        {
            Ok(link) => link,
            Err(e) => {
                error!("❌ No se pudo unir al canal {}: {}", self.channel_id, e);
                self.unregister();
                let reason = e.to_string();
                for event in self.mailbox.drain() {
                    event.reject(&reason);
                }
                return;
            }
        };

        let mut session = PlaybackSession::new(
            self.guild_id,
            link,
            &self.settings,
            self.source.clone(),
            self.events.clone(),
            self.notices.clone(),
        );

        let teardown = loop {
            match self.mailbox.recv_async().await {
                Ok(event) => {
                    if let Some(teardown) = session.handle(event).await {
                        break teardown;
                    }
                }
                Err(_) => break Teardown::Stopped(None),
            }
        };

        self.unregister();
        session.shutdown(teardown).await;
        debug!("Sesión {} terminada en guild {}", self.id, self.guild_id);
    }

    /// Se quita del registro solo si la entrada sigue siendo suya
    fn unregister(&self) {
        self.sessions
            .remove_if(&self.guild_id, |_, handle| handle.id == self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            queue::tests::track,
            session::{PlaybackState, SessionNotice},
            voice_link::fake::{Call, FakeConnector},
        },
        sources::MockMediaSource,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    const GUILD: GuildId = GuildId::new(1);
    const VOICE: Option<ChannelId> = Some(ChannelId::new(2));
    const USER: UserId = UserId::new(42);

    struct Harness {
        registry: SessionRegistry,
        connector: Arc<FakeConnector>,
        notices: flume::Receiver<SessionNotice>,
    }

    /// Fuente cuyas descargas esperan a que el test abra la compuerta
    struct GatedSource {
        gate: Arc<Semaphore>,
    }

    #[async_trait::async_trait]
    impl MediaSource for GatedSource {
        async fn fetch(&self, input: &str, _requested_by: UserId) -> PlaybackResult<Track> {
            let _permit = self.gate.acquire().await.map_err(PlaybackError::transport)?;
            Ok(track(input))
        }
    }

    fn harness() -> Harness {
        let mut source = MockMediaSource::new();
        source.expect_fetch().returning(|input, _| match input {
            "broken" => Err(PlaybackError::fetch("https://x/broken.mp3", "HTTP 404")),
            _ => Ok(track(input)),
        });
        harness_with(Arc::new(source))
    }

    fn harness_with(source: Arc<dyn MediaSource>) -> Harness {
        let connector = Arc::new(FakeConnector::default());
        let (notice_tx, notices) = flume::unbounded();
        let registry = SessionRegistry::new(
            connector.clone(),
            source,
            notice_tx,
            SessionSettings::default(),
        );

        Harness {
            registry,
            connector,
            notices,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("la condición no se cumplió a tiempo");
    }

    fn titles(snapshot: &QueueSnapshot) -> (Option<String>, Vec<String>) {
        (
            snapshot.current.as_ref().map(|t| t.title.clone()),
            snapshot.upcoming.iter().map(|t| t.title.clone()).collect(),
        )
    }

    #[tokio::test]
    async fn test_enqueue_requires_voice_channel() {
        let h = harness();
        let result = h.registry.enqueue(GUILD, None, USER, "a").await;

        assert!(matches!(result, Err(PlaybackError::NoVoiceChannel)));
        assert!(!h.registry.has_session(GUILD));
    }

    #[tokio::test]
    async fn test_commands_without_session() {
        let h = harness();
        assert!(matches!(h.registry.pause(GUILD).await, Err(PlaybackError::NoActiveSession)));
        assert!(matches!(h.registry.resume(GUILD).await, Err(PlaybackError::NoActiveSession)));
        assert!(matches!(h.registry.skip(GUILD).await, Err(PlaybackError::NoActiveSession)));
        assert!(matches!(h.registry.stop(GUILD).await, Err(PlaybackError::NoActiveSession)));
        assert_eq!(h.registry.get_queue(GUILD).await, QueueSnapshot::default());
        h.registry.remove(GUILD).await;
    }

    #[tokio::test]
    async fn test_two_enqueues_play_first_and_queue_second() {
        let h = harness();
        let first = h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();
        assert_eq!(first.snapshot.state, PlaybackState::Playing);

        h.registry.enqueue(GUILD, VOICE, USER, "b").await.unwrap();
        let snapshot = h.registry.get_queue(GUILD).await;
        assert_eq!(titles(&snapshot), (Some("a".into()), vec!["b".into()]));
        assert_eq!(h.registry.voice_channel(GUILD), VOICE);
    }

    #[tokio::test]
    async fn test_track_end_advances_queue() {
        let h = harness();
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();
        h.registry.enqueue(GUILD, VOICE, USER, "b").await.unwrap();

        let play_id = h.connector.shared.last_play_id().unwrap();
        h.connector
            .shared
            .events()
            .send(SessionEvent::PlaybackFinished { play_id })
            .unwrap();

        let snapshot = h.registry.get_queue(GUILD).await;
        assert_eq!(titles(&snapshot), (Some("b".into()), vec![]));
    }

    #[tokio::test]
    async fn test_failed_fetch_reports_error_and_keeps_session() {
        let h = harness();
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();

        let result = h.registry.enqueue(GUILD, VOICE, USER, "broken").await;
        assert!(matches!(result, Err(PlaybackError::Fetch { .. })));

        h.registry.enqueue(GUILD, VOICE, USER, "c").await.unwrap();
        let snapshot = h.registry.get_queue(GUILD).await;
        assert_eq!(titles(&snapshot), (Some("a".into()), vec!["c".into()]));
    }

    #[tokio::test]
    async fn test_stop_then_enqueue_creates_fresh_session() {
        let h = harness();
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();
        h.registry.enqueue(GUILD, VOICE, USER, "b").await.unwrap();

        h.registry.stop(GUILD).await.unwrap();
        assert!(!h.registry.has_session(GUILD));
        assert!(h.connector.shared.calls().contains(&Call::Leave));

        h.registry.enqueue(GUILD, VOICE, USER, "c").await.unwrap();
        let snapshot = h.registry.get_queue(GUILD).await;
        assert_eq!(titles(&snapshot), (Some("c".into()), vec![]));
        assert_eq!(h.connector.shared.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_join_rejects_enqueue() {
        let h = harness();
        h.connector.shared.connect_fails.store(true, Ordering::SeqCst);

        let result = h.registry.enqueue(GUILD, VOICE, USER, "a").await;
        assert!(matches!(result, Err(PlaybackError::Transport(_))));

        // El actor ya se dio de baja; el siguiente intento vuelve a conectar
        h.connector.shared.connect_fails.store(false, Ordering::SeqCst);
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();
        assert_eq!(h.connector.shared.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_channel_tears_down_after_idle_timeout() {
        let h = harness();
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();

        h.registry.membership_changed(GUILD, ChannelId::new(2), 0);
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(h.registry.has_session(GUILD));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!h.registry.has_session(GUILD));
        assert!(h.connector.shared.calls().contains(&Call::Leave));
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_returning_before_timeout_keeps_session() {
        let h = harness();
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();

        h.registry.membership_changed(GUILD, ChannelId::new(2), 0);
        tokio::time::sleep(Duration::from_secs(59)).await;
        h.registry.membership_changed(GUILD, ChannelId::new(2), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.registry.has_session(GUILD));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_removes_session_and_notifies() {
        let h = harness();
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();
        h.connector.shared.reconnect_fails.store(true, Ordering::SeqCst);

        h.connector
            .shared
            .events()
            .send(SessionEvent::LinkDisconnected)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(!h.registry.has_session(GUILD));
        let notices: Vec<_> = h.notices.try_iter().collect();
        assert!(notices
            .iter()
            .any(|n| matches!(n, SessionNotice::ConnectionLost { .. })));
        assert!(h.connector.shared.calls().contains(&Call::Reconnect));
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_session() {
        let h = harness();
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();
        h.registry
            .enqueue(GuildId::new(7), Some(ChannelId::new(8)), USER, "b")
            .await
            .unwrap();
        assert!(h.registry.has_session(GuildId::new(7)));

        h.registry.shutdown().await;
        assert!(!h.registry.has_session(GUILD));
        assert!(!h.registry.has_session(GuildId::new(7)));
    }

    #[tokio::test]
    async fn test_late_leave_of_old_link_keeps_new_session() {
        let h = harness();
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();
        let old_link = h.connector.shared.events();

        h.registry.stop(GUILD).await.unwrap();
        h.registry.enqueue(GUILD, VOICE, USER, "b").await.unwrap();

        // La salida del enlace anterior solo llega a su propio buzón
        let _ = old_link.send(SessionEvent::LinkClosed);
        let snapshot = h.registry.get_queue(GUILD).await;
        assert_eq!(titles(&snapshot), (Some("b".into()), vec![]));
        assert!(h.registry.has_session(GUILD));

        h.connector
            .shared
            .events()
            .send(SessionEvent::LinkClosed)
            .unwrap();
        wait_until(|| !h.registry.has_session(GUILD)).await;
    }

    #[tokio::test]
    async fn test_fetch_finishing_after_stop_is_discarded() {
        let gate = Arc::new(Semaphore::new(0));
        let Harness {
            registry,
            connector,
            ..
        } = harness_with(Arc::new(GatedSource { gate: gate.clone() }));
        let registry = Arc::new(registry);

        let pending = tokio::spawn({
            let registry = registry.clone();
            async move { registry.enqueue(GUILD, VOICE, USER, "a").await }
        });

        for _ in 0..100 {
            if registry.get_queue(GUILD).await.pending == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.get_queue(GUILD).await.pending, 1);

        registry.stop(GUILD).await.unwrap();
        gate.add_permits(1);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(PlaybackError::NoActiveSession)));
        assert!(!registry.has_session(GUILD));
        assert!(!connector
            .shared
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Play(..))));
    }

    #[tokio::test]
    async fn test_link_slot_released_after_teardown() {
        let h = harness();
        h.registry.enqueue(GUILD, VOICE, USER, "a").await.unwrap();
        assert!(h.registry.link_slots.contains_key(&GUILD));

        h.registry.stop(GUILD).await.unwrap();
        wait_until(|| h.registry.link_slots.is_empty()).await;
    }
}
