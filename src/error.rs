use thiserror::Error;

/// Errores del dominio de reproducción.
///
/// Las variantes se agrupan en tres familias:
///
/// - **Entrada de usuario**: [`NoVoiceChannel`](Self::NoVoiceChannel),
///   [`NotPlaying`](Self::NotPlaying), [`NotPaused`](Self::NotPaused),
///   [`QueueFull`](Self::QueueFull). Se devuelven tal cual al usuario y no
///   modifican la sesión.
/// - **Obtención de medios**: [`Resolve`](Self::Resolve) y [`Fetch`](Self::Fetch).
///   El track afectado se descarta y la cola sigue avanzando.
/// - **Transporte**: [`Transport`](Self::Transport). Un reintento acotado y, si
///   vuelve a fallar, la sesión se destruye.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("the requester is not connected to a voice channel")]
    NoVoiceChannel,

    #[error("no active playback session for this guild")]
    NoActiveSession,

    #[error("nothing is playing")]
    NotPlaying,

    #[error("playback is not paused")]
    NotPaused,

    #[error("queue is full (max {0} tracks)")]
    QueueFull(usize),

    #[error("cannot resolve input '{input}': {reason}")]
    Resolve { input: String, reason: String },

    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("voice transport error: {0}")]
    Transport(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlaybackError {
    pub fn resolve(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolve {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl std::fmt::Display) -> Self {
        Self::Transport(reason.to_string())
    }

    /// Errores causados por la petición del usuario y no por el sistema
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NoVoiceChannel | Self::NotPlaying | Self::NotPaused | Self::QueueFull(_)
        )
    }

    /// Texto mostrado al usuario en la respuesta del comando
    pub fn user_message(&self) -> String {
        match self {
            Self::NoVoiceChannel => "❌ Debes estar en un canal de voz".to_string(),
            Self::NoActiveSession => "❌ No hay ninguna sesión activa en este servidor".to_string(),
            Self::NotPlaying => "❌ No hay nada reproduciéndose".to_string(),
            Self::NotPaused => "❌ La reproducción no está pausada".to_string(),
            Self::QueueFull(max) => format!("❌ La cola está llena (máximo {} pistas)", max),
            Self::Resolve { input, .. } => format!("❌ Entrada no válida: `{}`", input),
            Self::Fetch { .. } => "❌ No se pudo descargar el audio".to_string(),
            Self::Transport(_) => "❌ Error en la conexión de voz".to_string(),
            Self::Io(_) => "❌ Error interno del caché".to_string(),
        }
    }
}

pub type PlaybackResult<T> = std::result::Result<T, PlaybackError>;
