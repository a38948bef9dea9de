use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::{SessionEvent, SessionSender};

/// Cuenta regresiva de inactividad de una sesión.
///
/// Se arma cuando el canal queda sin miembros humanos (o cuando la cola se
/// agota) y se cancela cuando alguien vuelve. Al vencer publica
/// [`SessionEvent::IdleExpired`] con su generación; solo la generación
/// vigente cuenta, así una cuenta cancelada nunca destruye la sesión aunque
/// su evento ya estuviera en el buzón.
#[derive(Debug)]
pub struct IdleReaper {
    timeout: Duration,
    generation: u64,
    pending: Option<CancellationToken>,
    non_bot_members: Option<usize>,
}

impl IdleReaper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            generation: 0,
            pending: None,
            non_bot_members: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// El canal está vacío. Un conteo desconocido no cuenta como vacío
    pub fn channel_empty(&self) -> bool {
        self.non_bot_members == Some(0)
    }

    /// Actualiza la ocupación del canal de la sesión.
    ///
    /// Un canal vacío reinicia la cuenta aunque ya hubiera una en curso: el
    /// plazo se mide desde el último vaciado, no desde el fin de la cola.
    pub fn membership_changed(&mut self, non_bot_members: usize, events: &SessionSender) {
        self.non_bot_members = Some(non_bot_members);

        if non_bot_members == 0 {
            info!("⏳ Canal vacío, desconexión en {:?}", self.timeout);
            self.arm(events);
        } else if self.is_armed() {
            debug!("👥 {} miembros en el canal, cuenta cancelada", non_bot_members);
            self.cancel();
        }
    }

    /// Inicia una cuenta nueva, reemplazando la anterior
    pub fn arm(&mut self, events: &SessionSender) -> u64 {
        self.cancel();
        self.generation += 1;

        let generation = self.generation;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let timeout = self.timeout;
        let events = events.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = events.send(SessionEvent::IdleExpired { generation });
                }
            }
        });

        self.pending = Some(token);
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }

    /// Procesa el vencimiento `generation`. Devuelve `true` si la sesión debe cerrarse
    pub fn expired(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.pending.is_none() {
            return false;
        }
        self.pending = None;

        if self.channel_empty() {
            true
        } else {
            debug!("Cuenta de inactividad vencida con oyentes presentes, se ignora");
            false
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.cancel();
    }
}
