//! # Cache Module
//!
//! Disk cache for downloaded recitation audio.
//!
//! The cache is a flat directory of media files named by random tokens
//! (`<uuid>.mp3`). There is no index file: the directory listing plus each
//! file's size and modification time are the only metadata, and they are
//! rebuilt from disk on every cleanup pass.
//!
//! ## Eviction
//!
//! A background task runs [`CacheStore::cleanup`] on a fixed interval,
//! independent of playback. Each pass sorts entries by last access (mtime)
//! and deletes the oldest ones until both limits hold:
//!
//! - at most `max_files` entries
//! - at most `max_bytes` total size
//!
//! A file that cannot be deleted is logged and skipped; the pass continues
//! with the next oldest entry.
//!
//! ## Writes
//!
//! Downloads are written to `<token>.part` and renamed to `<token>.mp3` once
//! the body is complete, so neither the player nor the eviction policy ever
//! sees a partial file. A `.part` file left behind by an interrupted process
//! is deleted by the cleanup pass once it has not been written to for longer
//! than the fetch timeout.
//!
//! ```env
//! CACHE_DIR=/app/cache
//! MAX_CACHE_FILES=20
//! MAX_CACHE_SIZE_MB=100
//! CACHE_CLEANUP_INTERVAL=10m
//! ```

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{fs, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extensión de los archivos de audio completos
pub const MEDIA_EXTENSION: &str = "mp3";
const PARTIAL_EXTENSION: &str = "part";
/// Antigüedad a partir de la cual un `.part` se considera abandonado
const DEFAULT_PARTIAL_TTL: Duration = Duration::from_secs(60 * 60);

/// Límites del caché
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_files: usize,
    pub max_bytes: u64,
}

/// Archivo del caché tal como se ve en disco
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_access: SystemTime,
}

/// Resultado de una pasada de limpieza
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub partials_removed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub remaining_bytes: u64,
}

/// Directorio plano de audio descargado con expulsión por antigüedad de acceso.
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    limits: CacheLimits,
    partial_ttl: Duration,
}

impl CacheStore {
    /// Abre (y crea si hace falta) el directorio de caché
    pub async fn open(dir: impl Into<PathBuf>, limits: CacheLimits) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        info!(
            "📁 Caché de audio en {} (máx {} archivos, {} bytes)",
            dir.display(),
            limits.max_files,
            limits.max_bytes
        );

        Ok(Self {
            dir,
            limits,
            partial_ttl: DEFAULT_PARTIAL_TTL,
        })
    }

    /// Tiempo sin escrituras tras el cual se borra una descarga a medias
    pub fn with_partial_ttl(mut self, ttl: Duration) -> Self {
        self.partial_ttl = ttl;
        self
    }

    /// Reserva un nombre único para una nueva descarga
    pub fn allocate(&self) -> CacheFile {
        let token = uuid::Uuid::new_v4().simple().to_string();
        CacheFile {
            path: self.dir.join(format!("{}.{}", token, MEDIA_EXTENSION)),
            partial: self.dir.join(format!("{}.{}", token, PARTIAL_EXTENSION)),
        }
    }

    /// Lista las entradas completas ordenadas de la más antigua a la más reciente
    pub async fn entries(&self) -> io::Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().map_or(true, |ext| ext != MEDIA_EXTENSION) {
                continue;
            }

            // El archivo puede desaparecer entre el listado y el stat
            let metadata = match item.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Sin metadata para {}: {}", path.display(), e);
                    continue;
                }
            };

            entries.push(CacheEntry {
                size_bytes: metadata.len(),
                last_access: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            });
        }

        entries.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.path.cmp(&b.path))
        });

        Ok(entries)
    }

    /// Borra los `.part` abandonados y elimina las entradas más antiguas
    /// hasta cumplir ambos límites
    pub async fn cleanup(&self) -> io::Result<CleanupReport> {
        let mut report = CleanupReport {
            partials_removed: self.remove_stale_partials().await?,
            ..CleanupReport::default()
        };

        let entries = self.entries().await?;
        let mut count = entries.len();
        let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();

        for entry in &entries {
            if count <= self.limits.max_files && total <= self.limits.max_bytes {
                break;
            }

            match fs::remove_file(&entry.path).await {
                Ok(()) => {
                    debug!("🗑️ Expulsado del caché: {}", entry.path.display());
                    count -= 1;
                    total = total.saturating_sub(entry.size_bytes);
                    report.removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    count -= 1;
                    total = total.saturating_sub(entry.size_bytes);
                }
                Err(e) => {
                    warn!("No se pudo eliminar {}: {}", entry.path.display(), e);
                    report.failed += 1;
                }
            }
        }

        report.remaining = count;
        report.remaining_bytes = total;
        Ok(report)
    }

    async fn remove_stale_partials(&self) -> io::Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.partial_ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().map_or(true, |ext| ext != PARTIAL_EXTENSION) {
                continue;
            }

            let modified = match item.metadata().await {
                Ok(metadata) if metadata.is_file() => {
                    metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)
                }
                _ => continue,
            };
            if modified > cutoff {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("🗑️ Descarga abandonada borrada: {}", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("No se pudo eliminar {}: {}", path.display(), e),
            }
        }

        Ok(removed)
    }

    /// Lanza la limpieza periódica hasta que se cancele `shutdown`
    pub fn spawn_cleanup_loop(
        self: Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Limpieza de caché detenida");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.cleanup().await {
                            Ok(report)
                                if report.removed > 0
                                    || report.failed > 0
                                    || report.partials_removed > 0 =>
                            {
                                info!(
                                    "🧹 Caché: {} eliminados, {} parciales, {} fallidos, {} restantes ({} bytes)",
                                    report.removed,
                                    report.partials_removed,
                                    report.failed,
                                    report.remaining,
                                    report.remaining_bytes
                                )
                            }
                            Ok(_) => debug!("🧹 Caché dentro de los límites"),
                            Err(e) => warn!("Error en limpieza de caché: {}", e),
                        }
                    }
                }
            }
        })
    }
}

/// Marca un archivo del caché como usado recientemente (actualiza su mtime)
pub async fn touch(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_modified(SystemTime::now())
    })
    .await
    .map_err(io::Error::other)?
}

/// Nombre reservado para una descarga: primero `.part`, luego `.mp3`
#[derive(Debug, Clone)]
pub struct CacheFile {
    pub path: PathBuf,
    pub partial: PathBuf,
}

impl CacheFile {
    /// Publica el archivo parcial y devuelve su tamaño final
    pub async fn commit(&self) -> io::Result<u64> {
        fs::rename(&self.partial, &self.path).await?;
        Ok(fs::metadata(&self.path).await?.len())
    }

    pub async fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.partial).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("No se pudo borrar {}: {}", self.partial.display(), e);
            }
        }
    }
}
