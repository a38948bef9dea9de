//! # Sources Module
//!
//! Turns a user input into a playable [`Track`] backed by a file in the
//! disk cache.
//!
//! Two kinds of input are accepted:
//!
//! - **Direct URLs** (`http://`, `https://`) are downloaded as-is
//!   ([`direct_url`]).
//! - **Verse references** (`surah:ayah`, e.g. `2:255`) are mapped to a
//!   canonical recitation URL through the lookup service ([`quran`]).
//!
//! Anything else fails with [`PlaybackError::Resolve`]. An unsuccessful HTTP
//! response while downloading fails with [`PlaybackError::Fetch`].
//!
//! The response body is streamed chunk by chunk into the cache file; the
//! payload is never buffered whole in memory.

pub mod direct_url;
pub mod quran;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serenity::model::id::UserId;
use std::{path::{Path, PathBuf}, sync::Arc};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};

use crate::{
    cache::CacheStore,
    config::Config,
    error::{PlaybackError, PlaybackResult},
};
use quran::{QuranClient, VerseRef};

/// Pista lista para reproducir, respaldada por un archivo del caché.
///
/// Inmutable una vez creada. Se relaciona con las entradas del caché solo por
/// igualdad de ruta.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub title: String,
    pub source_input: String,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

/// Entrada resuelta a una URL descargable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    pub url: String,
    pub title: String,
}

/// Fuente de pistas consumida por las sesiones
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Resuelve la entrada y la descarga al caché
    async fn fetch(&self, input: &str, requested_by: UserId) -> PlaybackResult<Track>;
}

/// Descargador de audio que escribe directamente en el [`CacheStore`]
pub struct MediaFetcher {
    client: reqwest::Client,
    cache: Arc<CacheStore>,
    quran: QuranClient,
}

impl MediaFetcher {
    pub fn new(config: &Config, cache: Arc<CacheStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let quran = QuranClient::new(client.clone(), &config.quran_api_url, &config.quran_reciter);

        Ok(Self {
            client,
            cache,
            quran,
        })
    }

    /// Convierte la entrada en una URL descargable
    pub async fn resolve(&self, input: &str) -> PlaybackResult<ResolvedInput> {
        if let Some(url) = direct_url::parse_direct_url(input) {
            return Ok(ResolvedInput {
                title: direct_url::title_from_url(&url),
                url: url.into(),
            });
        }

        if VerseRef::looks_like(input) {
            let verse = VerseRef::parse(input)?;
            return self.quran.lookup(verse).await;
        }

        Err(PlaybackError::resolve(input, "expected a URL or surah:ayah"))
    }

    async fn download(&self, url: &str) -> PlaybackResult<(PathBuf, u64)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PlaybackError::fetch(url, e.to_string()))?;

        if !response.status().is_success() {
            return Err(PlaybackError::fetch(url, format!("HTTP {}", response.status())));
        }

        let file = self.cache.allocate();
        let written = write_body(url, response.bytes_stream(), &file.partial).await;

        let committed = match written {
            Ok(_) => file.commit().await.map_err(PlaybackError::from),
            Err(e) => Err(e),
        };

        match committed {
            Ok(size) => Ok((file.path, size)),
            Err(e) => {
                file.discard().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl MediaSource for MediaFetcher {
    async fn fetch(&self, input: &str, requested_by: UserId) -> PlaybackResult<Track> {
        let resolved = self.resolve(input).await?;

        let (file_path, size_bytes) = self.download(&resolved.url).await.inspect_err(|e| {
            warn!("❌ Descarga fallida para {}: {}", input, e);
        })?;

        info!(
            "📥 Descargado: {} ({} bytes) -> {}",
            resolved.title,
            size_bytes,
            file_path.display()
        );

        Ok(Track {
            title: resolved.title,
            source_input: input.to_string(),
            file_path,
            size_bytes,
            requested_by,
            added_at: Utc::now(),
        })
    }
}

/// Vuelca un cuerpo HTTP por fragmentos en `path` y devuelve los bytes escritos
async fn write_body<S, E>(url: &str, body: S, path: &Path) -> PlaybackResult<u64>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
{
    futures::pin_mut!(body);

    let mut file = fs::File::create(path).await?;
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| PlaybackError::fetch(url, e.to_string()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    Ok(written)
}
