use lib_common::connections::cache_store::CLEANUP_TTL;
use lib_common::connections::{CacheStore, HealthStatus};
use lib_common::core::SessionHandle;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Logs session stats and cache health every `period` until shutdown.
/// Once per [`CLEANUP_TTL`] it also bounds cache keys stored without an expiry.
pub async fn run(
    period: Duration,
    session: SessionHandle,
    cache: CacheStore,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut check_interval = interval(period);
    // The first tick fires immediately.
    check_interval.tick().await;
    let mut cleanup_interval = interval(CLEANUP_TTL);
    cleanup_interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                match session.stats().await {
                    Ok(stats) => log::info!(
                        "{} | {:.1} msg/s | {} received | {} flushed ({} dropped) | queue {} | subs [{}]",
                        stats.status,
                        stats.messages_per_second,
                        stats.messages_received,
                        stats.update_count,
                        stats.dropped_updates,
                        stats.queue_size,
                        stats.subscriptions.join(",")
                    ),
                    Err(e) => {
                        log::warn!("Monitor stopping: {}", e);
                        break;
                    }
                }

                let health = cache.health_check().await;
                if health.status == HealthStatus::Unhealthy {
                    log::warn!("Cache unhealthy (connected: {})", health.connected);
                } else {
                    log::debug!("Cache healthy, {}ms, memory {}", health.latency_ms, health.memory);
                }
            }
            _ = cleanup_interval.tick() => {
                let stats = cache.cache_stats().await;
                log::info!(
                    "Cache: {} keys, {} used, {:.0}% hit rate, up {}s",
                    stats.keys_count,
                    stats.memory_usage,
                    stats.hit_rate * 100.0,
                    stats.uptime
                );
                cache.cleanup_expired_keys().await;
            }
        }
    }
}
