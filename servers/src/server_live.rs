use anyhow::{Context, Result};
use lib_common::connections::{
    CacheStore, MemoryBusTransport, MemoryCacheBackend, PubSubBus, RedisBusTransport,
    RedisCacheBackend,
};
use lib_common::core::{ChannelSink, LiveSession, Scope, WsConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

mod live_logic;
use live_logic::{config, logger, monitor, publisher};

/// Redis when configured, in-process otherwise.
fn backends(redis_url: Option<&str>) -> Result<(CacheStore, Arc<PubSubBus>)> {
    match redis_url {
        Some(url) => {
            let cache = RedisCacheBackend::new(url).context("invalid Redis URL for cache")?;
            let bus = RedisBusTransport::new(url).context("invalid Redis URL for pub/sub")?;
            Ok((CacheStore::new(Arc::new(cache)), Arc::new(PubSubBus::new(Arc::new(bus)))))
        }
        None => {
            log::warn!("No Redis URL configured; cache and pub/sub are process-local.");
            Ok((
                CacheStore::new(Arc::new(MemoryCacheBackend::new())),
                Arc::new(PubSubBus::new(Arc::new(MemoryBusTransport::new(1024)))),
            ))
        }
    }
}

async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::error!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = config::load_config()?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    log::info!("Starting server_live for {} on {}", settings.sport, settings.ws_url);

    let (cache, bus) = backends(settings.redis_url.as_deref())?;
    if !cache.init().await {
        log::warn!("Cache backend unavailable at startup; operations will degrade to defaults.");
    }
    if !bus.init().await {
        log::warn!("Pub/sub backend unavailable at startup; publishes will report no receivers.");
    }

    // Other processes switch the active sport over the bus.
    let (scope_rx, _) = publisher::follow_scope(&bus, Scope::sport(settings.sport.clone())).await;

    let (batch_tx, batch_rx) = mpsc::unbounded_channel();
    let mut session = LiveSession::new(
        settings.realtime.clone(),
        Arc::new(WsConnector::new(settings.ws_url.clone())),
        scope_rx,
    )
    .context("invalid realtime configuration")?;
    session.dispatcher_mut().set_analytics_sink(Arc::new(ChannelSink(batch_tx)));
    let (handle, session_task) = session.spawn();

    // Queued in the registry and replayed once the feed opens.
    handle.subscribe(settings.channels.clone())?;
    handle.connect()?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let publisher_handle = tokio::spawn(publisher::run(
        batch_rx,
        cache.clone(),
        Arc::clone(&bus),
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(
        Duration::from_secs(settings.stats_interval_seconds),
        handle.clone(),
        cache.clone(),
        shutdown_tx.subscribe(),
    ));

    wait_for_signal().await;

    // Session first, so its final flush reaches the publisher before it drains.
    if let Err(e) = handle.shutdown().await {
        log::warn!("Live session already stopped: {}", e);
    }
    let _ = shutdown_tx.send(());

    // Wait for components to shut down
    let _ = tokio::try_join!(session_task, publisher_handle, monitor_handle);

    bus.shutdown().await;
    cache.shutdown().await;

    log::info!("Shutdown complete.");
    Ok(())
}
