use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Cola
    pub max_queue_size: usize,

    // Caché en disco
    pub cache_dir: PathBuf,
    pub max_cache_files: usize,
    pub max_cache_size: u64, // En bytes
    pub cleanup_interval: Duration,

    // Tiempos de sesión
    pub idle_timeout: Duration,
    pub reconnect_grace: Duration,
    pub fetch_timeout: Duration,

    // Servicio de búsqueda de recitaciones
    pub quran_api_url: String,
    pub quran_reciter: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,

            // Caché
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "/app/cache".to_string())
                .into(),
            max_cache_files: std::env::var("MAX_CACHE_FILES")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
            max_cache_size: std::env::var("MAX_CACHE_SIZE_MB")
                .unwrap_or_else(|_| "100".to_string())
                .parse::<u64>()?
                * 1024
                * 1024,
            cleanup_interval: env_duration("CACHE_CLEANUP_INTERVAL", "10m")?,

            // Tiempos
            idle_timeout: env_duration("IDLE_TIMEOUT", "60s")?,
            reconnect_grace: env_duration("RECONNECT_GRACE", "5s")?,
            fetch_timeout: env_duration("FETCH_TIMEOUT", "60s")?,

            quran_api_url: std::env::var("QURAN_API_URL")
                .unwrap_or_else(|_| "https://api.alquran.cloud/v1".to_string()),
            quran_reciter: std::env::var("QURAN_RECITER")
                .unwrap_or_else(|_| "ar.alafasy".to_string()),
        };

        std::fs::create_dir_all(&config.cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Cache limits must be greater than zero
    /// - Timers must be non-zero
    /// - The lookup service URL must be an absolute http(s) URL
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.max_cache_files == 0 {
            anyhow::bail!("Max cache files must be greater than 0");
        }

        if self.max_cache_size == 0 {
            anyhow::bail!("Max cache size must be greater than 0");
        }

        if self.idle_timeout.is_zero() || self.cleanup_interval.is_zero() {
            anyhow::bail!("Idle timeout and cleanup interval must be greater than 0");
        }

        if self.fetch_timeout.is_zero() {
            anyhow::bail!("Fetch timeout must be greater than 0");
        }

        let api = url::Url::parse(&self.quran_api_url)
            .map_err(|e| anyhow::anyhow!("Invalid QURAN_API_URL '{}': {}", self.quran_api_url, e))?;
        if api.scheme() != "http" && api.scheme() != "https" {
            anyhow::bail!("QURAN_API_URL must be http or https, got: {}", api.scheme());
        }

        if self.quran_reciter.trim().is_empty() {
            anyhow::bail!("Quran reciter edition cannot be empty");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the bot token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Queue: {} max tracks\n  \
            Cache: {} ({} files, {} MB, cleanup every {})\n  \
            Timers: idle {}, reconnect grace {}, fetch {}\n  \
            Lookup: {} ({})",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.max_queue_size,
            self.cache_dir.display(),
            self.max_cache_files,
            self.max_cache_size / (1024 * 1024),
            humantime::format_duration(self.cleanup_interval),
            humantime::format_duration(self.idle_timeout),
            humantime::format_duration(self.reconnect_grace),
            humantime::format_duration(self.fetch_timeout),
            self.quran_api_url,
            self.quran_reciter,
        )
    }
}

/// Lee una duración legible ("60s", "10m") de una variable de entorno
fn env_duration(key: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim())
        .map_err(|e| anyhow::anyhow!("Invalid duration for {}: '{}' ({})", key, raw, e))
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            max_queue_size: 100,

            cache_dir: "/app/cache".into(),
            max_cache_files: 20,
            max_cache_size: 100 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(10 * 60),

            idle_timeout: Duration::from_secs(60),
            reconnect_grace: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(60),

            quran_api_url: "https://api.alquran.cloud/v1".to_string(),
            quran_reciter: "ar.alafasy".to_string(),
        }
    }
}
