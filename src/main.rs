use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod audio;
mod bot;
mod cache;
mod config;
mod error;
mod sources;

use crate::audio::{
    registry::SessionRegistry, session::SessionSettings, voice_link::SongbirdConnector,
};
use crate::bot::{notices::spawn_notice_relay, OpenTilawaBot};
use crate::cache::{CacheLimits, CacheStore};
use crate::config::Config;
use crate::sources::MediaFetcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_tilawa=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🕌 Iniciando Open Tilawa v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let shutdown = CancellationToken::new();

    // Caché de audio en disco y su limpieza periódica
    let cache = Arc::new(
        CacheStore::open(
            &config.cache_dir,
            CacheLimits {
                max_files: config.max_cache_files,
                max_bytes: config.max_cache_size,
            },
        )
        .await?
        .with_partial_ttl(config.fetch_timeout),
    );
    let cleanup = cache
        .clone()
        .spawn_cleanup_loop(config.cleanup_interval, shutdown.clone());

    let fetcher = Arc::new(MediaFetcher::new(&config, cache)?);

    // Sesiones de reproducción sobre songbird
    let songbird = Songbird::serenity();
    let (notice_tx, notice_rx) = flume::unbounded();
    let sessions = Arc::new(SessionRegistry::new(
        Arc::new(SongbirdConnector::new(songbird.clone())),
        fetcher,
        notice_tx,
        SessionSettings::from(&config),
    ));

    // Intents mínimos: comandos y estados de voz
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = OpenTilawaBot::new(config.clone(), sessions.clone());
    let text_channels = handler.text_channels();

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    let relay = spawn_notice_relay(client.http.clone(), notice_rx, text_channels);

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");

        sessions.shutdown().await;
        signal_shutdown.cancel();
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    shutdown.cancel();
    let _ = cleanup.await;
    relay.abort();

    info!("👋 Open Tilawa detenido");
    Ok(())
}
