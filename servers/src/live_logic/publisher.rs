use lib_common::connections::{CacheStore, PubSubBus};
use lib_common::core::{AnalyticsBatch, Scope, UpdateKind};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

/// Bus topic for flushed batches of one sport.
pub fn updates_channel(sport: Option<&str>) -> String {
    format!("updates:{}", sport.unwrap_or("all"))
}

/// Bus topic that switches the active sport: `{"sport": "NBA"}`.
pub const SCOPE_CHANNEL: &str = "live:scope";

/// Scope watch fed by messages on [`SCOPE_CHANNEL`]. The flag is `false` when
/// the bus refused the subscription and the watch stays at `initial`.
pub async fn follow_scope(bus: &PubSubBus, initial: Scope) -> (watch::Receiver<Scope>, bool) {
    let (scope_tx, scope_rx) = watch::channel(initial);
    let subscribed = bus
        .subscribe(SCOPE_CHANNEL, move |msg| match msg.get("sport").and_then(|s| s.as_str()) {
            Some(sport) => {
                scope_tx.send_replace(Scope::sport(sport));
            }
            None => log::warn!("Ignoring scope message without a sport: {}", msg),
        })
        .await;
    if !subscribed {
        log::warn!("Could not subscribe to {}; the active sport will not follow bus updates.", SCOPE_CHANNEL);
    }
    (scope_rx, subscribed)
}

/// Fans each flushed batch out to other processes: published on the sport's
/// bus topic, cached as the sport's latest live batch, and stat updates for a
/// team stored as that team's newest performance snapshot.
pub async fn run(
    mut batches: mpsc::UnboundedReceiver<AnalyticsBatch>,
    cache: CacheStore,
    bus: Arc<PubSubBus>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                // Drain what the session flushed on its way out.
                while let Ok(batch) = batches.try_recv() {
                    publish_batch(&batch, &cache, &bus).await;
                }
                log::info!("Publisher received shutdown signal.");
                break;
            }
            batch = batches.recv() => match batch {
                Some(batch) => publish_batch(&batch, &cache, &bus).await,
                None => break,
            }
        }
    }
}

pub async fn publish_batch(batch: &AnalyticsBatch, cache: &CacheStore, bus: &PubSubBus) {
    let sport = batch.scope.sport.as_deref();
    let channel = updates_channel(sport);

    if !bus.publish(&channel, batch).await {
        log::debug!("No subscribers on {} for batch of {}", channel, batch.updates.len());
    }

    if let Some(sport) = sport {
        if !cache.cache_sports_data(sport, "live_updates", &batch.updates, None).await {
            log::warn!("Failed to cache live updates for {}", sport);
        }
    }

    for update in batch.updates.iter().filter(|u| u.kind == UpdateKind::Stat) {
        if let Some(team_id) = update.scope.team_id.as_deref() {
            cache.cache_team_performance(team_id, &update.payload, None).await;
        }
    }
}
