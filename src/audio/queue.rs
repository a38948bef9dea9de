use std::collections::VecDeque;
use tracing::{debug, info};

use crate::{
    error::{PlaybackError, PlaybackResult},
    sources::Track,
};

/// Identificador de una posición reservada en la cola
pub type SlotId = u64;

/// Posición de la cola: pendiente de descarga o lista para reproducir
#[derive(Debug, Clone)]
struct QueueSlot {
    id: SlotId,
    input: String,
    track: Option<Track>,
}

/// Cola FIFO de una sesión.
///
/// Las posiciones se reservan en el orden de llegada de las peticiones y se
/// rellenan cuando termina su descarga, de modo que el orden de reproducción
/// es siempre el orden de `reserve`, aunque las descargas terminen
/// desordenadas. Solo se reproduce la cabeza cuando ya está lista.
#[derive(Debug)]
pub struct TrackQueue {
    slots: VecDeque<QueueSlot>,
    next_id: SlotId,
    max_size: usize,
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            slots: VecDeque::new(),
            next_id: 0,
            max_size,
        }
    }

    /// Reserva una posición al final de la cola
    pub fn reserve(&mut self, input: &str) -> PlaybackResult<SlotId> {
        if self.slots.len() >= self.max_size {
            return Err(PlaybackError::QueueFull(self.max_size));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.slots.push_back(QueueSlot {
            id,
            input: input.to_string(),
            track: None,
        });

        debug!("📌 Posición {} reservada para: {}", id, input);
        Ok(id)
    }

    /// Completa una posición reservada. Devuelve `false` si ya no existe
    pub fn fill(&mut self, id: SlotId, track: Track) -> bool {
        match self.slots.iter_mut().find(|slot| slot.id == id) {
            Some(slot) => {
                info!("➕ Agregado a la cola: {}", track.title);
                slot.track = Some(track);
                true
            }
            None => false,
        }
    }

    /// Elimina una posición cuya descarga falló
    pub fn discard(&mut self, id: SlotId) -> Option<String> {
        let index = self.slots.iter().position(|slot| slot.id == id)?;
        self.slots.remove(index).map(|slot| slot.input)
    }

    /// Saca la cabeza de la cola si ya está lista (FIFO estricto)
    pub fn pop_ready(&mut self) -> Option<Track> {
        if self.slots.front()?.track.is_none() {
            return None;
        }
        let track = self.slots.pop_front()?.track;
        if let Some(ref track) = track {
            info!("➡️ Siguiente en cola: {}", track.title);
        }
        track
    }

    /// Pistas listas en orden de reproducción
    pub fn tracks(&self) -> Vec<Track> {
        self.slots.iter().filter_map(|slot| slot.track.clone()).collect()
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|slot| slot.track.is_none()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Vacía la cola y devuelve cuántas posiciones se descartaron
    pub fn clear(&mut self) -> usize {
        let removed = self.slots.len();
        self.slots.clear();
        if removed > 0 {
            info!("🗑️ Cola limpiada ({} posiciones)", removed);
        }
        removed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    pub(crate) fn track(name: &str) -> Track {
        Track {
            title: name.to_string(),
            source_input: name.to_string(),
            file_path: format!("/cache/{}.mp3", name).into(),
            size_bytes: 1024,
            requested_by: UserId::new(42),
            added_at: Utc::now(),
        }
    }

    fn titles(queue: &TrackQueue) -> Vec<String> {
        queue.tracks().into_iter().map(|t| t.title).collect()
    }

    #[test]
    fn test_order_follows_reservation_not_completion() {
        let mut queue = TrackQueue::new(10);
        let a = queue.reserve("a").unwrap();
        let b = queue.reserve("b").unwrap();
        let c = queue.reserve("c").unwrap();

        assert!(queue.fill(c, track("c")));
        assert!(queue.fill(a, track("a")));
        assert!(queue.fill(b, track("b")));

        assert_eq!(titles(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_pending_head_blocks_pop() {
        let mut queue = TrackQueue::new(10);
        let a = queue.reserve("a").unwrap();
        let b = queue.reserve("b").unwrap();
        queue.fill(b, track("b"));

        assert_eq!(queue.pop_ready(), None);
        assert_eq!(queue.pending(), 1);

        queue.discard(a);
        assert_eq!(queue.pop_ready().map(|t| t.title), Some("b".to_string()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_counts_pending_slots() {
        let mut queue = TrackQueue::new(2);
        queue.reserve("a").unwrap();
        let b = queue.reserve("b").unwrap();
        queue.fill(b, track("b"));

        assert!(matches!(queue.reserve("c"), Err(PlaybackError::QueueFull(2))));
        assert_eq!(queue.pending(), 1);
        assert_eq!(titles(&queue), vec!["b"]);
    }

    #[test]
    fn test_fill_after_clear_is_rejected() {
        let mut queue = TrackQueue::new(10);
        let a = queue.reserve("a").unwrap();
        assert_eq!(queue.clear(), 1);
        assert!(!queue.fill(a, track("a")));
        assert!(queue.is_empty());
    }
}
