//! End-to-end runs of a `LiveSession` against an in-process peer, on tokio's
//! paused clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_common::connections::{CacheStore, MemoryBusTransport, MemoryCacheBackend, PubSubBus};
use lib_common::core::{
    AnalyticsBatch, ChannelConnector, ChannelSink, ConnectionState, LiveSession, OutboundFrame,
    PeerLink, Scope, SessionHandle, SessionStats, SharedUpdate, TransportEvent,
};
use lib_common::RealtimeConfig;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

struct Harness {
    handle: SessionHandle,
    peers: mpsc::UnboundedReceiver<PeerLink>,
    scope: watch::Sender<Scope>,
    batches: mpsc::UnboundedReceiver<AnalyticsBatch>,
    groups: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

fn start(config: RealtimeConfig) -> Harness {
    let (connector, peers) = ChannelConnector::new();
    let (scope, scope_rx) = watch::channel(Scope::sport("NFL"));
    let mut session = LiveSession::new(config, Arc::new(connector), scope_rx).unwrap();

    let (batch_tx, batches) = mpsc::unbounded_channel();
    session.dispatcher_mut().set_analytics_sink(Arc::new(ChannelSink(batch_tx)));

    let groups = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&groups);
    session.dispatcher_mut().register_handler(
        "score",
        Arc::new(move |updates: &[SharedUpdate]| {
            let ids = updates.iter().map(|u| u.id.clone()).collect();
            recorder.lock().unwrap().push(("score".to_string(), ids));
        }),
    );

    let (handle, _task) = session.spawn();
    Harness { handle, peers, scope, batches, groups }
}

async fn connect_and_open(h: &mut Harness) -> PeerLink {
    h.handle.connect().unwrap();
    let mut peer = h.peers.recv().await.unwrap();
    open(&h.handle, &mut peer).await;
    peer
}

async fn open(handle: &SessionHandle, peer: &mut PeerLink) {
    let mut changes = handle.state_changes();
    peer.emit(TransportEvent::Open);
    while changes.recv().await.unwrap().to != ConnectionState::Connected {}
    assert_eq!(next_json(peer).await["type"], "authenticate");
}

async fn next_json(peer: &mut PeerLink) -> Value {
    match peer.outbound.recv().await {
        Some(OutboundFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

async fn stats_when(handle: &SessionHandle, cond: impl Fn(&SessionStats) -> bool) -> SessionStats {
    for _ in 0..100 {
        let stats = handle.stats().await.unwrap();
        if cond(&stats) {
            return stats;
        }
        tokio::task::yield_now().await;
    }
    panic!("session never reached the expected state");
}

fn data_frame(id: &str, kind: &str) -> TransportEvent {
    let frame = json!({"type": "data", "data": {"id": id, "type": kind, "gameId": "g1"}});
    TransportEvent::Message(frame.to_string())
}

#[tokio::test(start_paused = true)]
async fn updates_within_one_interval_flush_as_one_batch() {
    let mut h = start(RealtimeConfig { batch_size: 10, batch_interval: 100, ..Default::default() });
    let peer = connect_and_open(&mut h).await;
    let start = Instant::now();

    for id in ["u1", "u2", "u3"] {
        peer.emit(data_frame(id, "score"));
    }
    let stats = stats_when(&h.handle, |s| s.queue_size == 3).await;
    assert_eq!(stats.flush_count, 0);
    assert!(h.groups.lock().unwrap().is_empty());

    let batch = h.batches.recv().await.unwrap();
    assert!(start.elapsed() <= Duration::from_millis(100));
    let ids: Vec<&str> = batch.updates.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "u2", "u3"]);
    assert_eq!(batch.scope, Scope::sport("NFL"));
    assert_eq!(
        *h.groups.lock().unwrap(),
        vec![("score".to_string(), vec!["u1".to_string(), "u2".into(), "u3".into()])]
    );

    let recent = h.handle.recent_updates().await.unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].scope.sport.as_deref(), Some("NFL"));
    assert!(h.batches.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn pong_sets_latency_and_clears_pending_ping() {
    let mut h = start(RealtimeConfig { heartbeat_interval: 1000, batch_updates: false, ..Default::default() });
    let mut peer = connect_and_open(&mut h).await;

    let ping = next_json(&mut peer).await;
    assert_eq!(ping["type"], "ping");
    let id = ping["id"].as_str().unwrap().to_string();
    assert_eq!(h.handle.stats().await.unwrap().pending_pings, 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    peer.emit(TransportEvent::Message(json!({"type": "pong", "id": id}).to_string()));

    let mut snapshot = h.handle.watch_snapshot();
    snapshot.wait_for(|s| s.latency_ms == 120).await.unwrap();
    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.pending_pings, 0);
    assert_eq!(stats.status, "Connected (120ms)");
}

#[tokio::test(start_paused = true)]
async fn unclean_close_retries_after_fixed_delay() {
    let mut h = start(RealtimeConfig {
        max_reconnect_attempts: 10,
        reconnect_interval: 5000,
        ..Default::default()
    });
    let peer = connect_and_open(&mut h).await;
    let mut changes = h.handle.state_changes();

    peer.emit(TransportEvent::Closed { code: 1006, reason: "gone".into() });
    let closed_at = Instant::now();

    let mut retry = h.peers.recv().await.unwrap();
    assert!(closed_at.elapsed() >= Duration::from_millis(5000));
    retry.emit(TransportEvent::Open);

    let mut seen = Vec::new();
    while seen.last() != Some(&ConnectionState::Connected) {
        let change = changes.recv().await.unwrap();
        if change.to == ConnectionState::Reconnecting {
            assert_eq!(change.snapshot.reconnect_attempts, 1);
            assert_eq!(change.snapshot.status, "Reconnecting (1/10)");
        }
        seen.push(change.to);
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Error,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(h.handle.snapshot().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_the_configured_maximum() {
    let mut h = start(RealtimeConfig {
        max_reconnect_attempts: 3,
        reconnect_interval: 1000,
        ..Default::default()
    });
    h.handle.connect().unwrap();

    let mut opened = 0;
    while let Ok(Some(peer)) = timeout(Duration::from_secs(60), h.peers.recv()).await {
        opened += 1;
        peer.emit(TransportEvent::Closed { code: 1006, reason: String::new() });
        assert!(h.handle.snapshot().reconnect_attempts <= 3);
    }
    assert_eq!(opened, 4);

    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.state, ConnectionState::Error);
    assert_eq!(stats.reconnect_attempts, 3);

    // Manual recovery.
    h.handle.connect().unwrap();
    let mut peer = h.peers.recv().await.unwrap();
    open(&h.handle, &mut peer).await;
    assert_eq!(h.handle.stats().await.unwrap().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_subscribe_keeps_one_entry_but_sends_twice() {
    let mut h = start(RealtimeConfig::default());
    let mut peer = connect_and_open(&mut h).await;

    h.handle.subscribe(["live_scores"]).unwrap();
    h.handle.subscribe(["live_scores"]).unwrap();

    for _ in 0..2 {
        let msg = next_json(&mut peer).await;
        assert_eq!(msg["type"], "subscribe");
        assert_eq!(msg["channel"], "live_scores");
        assert_eq!(msg["data"]["filters"]["includeInProgress"], true);
        assert_eq!(msg["data"]["sport"], "NFL");
    }
    assert_eq!(h.handle.stats().await.unwrap().subscriptions, vec!["live_scores".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn scope_change_resubscribes_with_new_sport() {
    let mut h = start(RealtimeConfig::default());
    let mut peer = connect_and_open(&mut h).await;
    h.handle.subscribe(["live_scores", "game_events"]).unwrap();
    next_json(&mut peer).await;
    next_json(&mut peer).await;

    h.scope.send(Scope::sport("NBA")).unwrap();

    let mut frames = Vec::new();
    for _ in 0..4 {
        frames.push(next_json(&mut peer).await);
    }
    let summary: Vec<(String, String)> = frames
        .iter()
        .map(|f| (f["type"].as_str().unwrap().to_string(), f["channel"].as_str().unwrap().to_string()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("unsubscribe".to_string(), "live_scores".to_string()),
            ("unsubscribe".to_string(), "game_events".to_string()),
            ("subscribe".to_string(), "live_scores".to_string()),
            ("subscribe".to_string(), "game_events".to_string()),
        ]
    );
    assert_eq!(frames[2]["data"]["sport"], "NBA");
}

#[tokio::test(start_paused = true)]
async fn unanswered_pings_close_the_link_and_reconnect() {
    let mut h = start(RealtimeConfig {
        heartbeat_interval: 1000,
        ping_timeout_factor: 2,
        reconnect_interval: 5000,
        batch_updates: false,
        ..Default::default()
    });
    let mut peer = connect_and_open(&mut h).await;

    assert_eq!(next_json(&mut peer).await["type"], "ping");
    assert_eq!(next_json(&mut peer).await["type"], "ping");
    match peer.outbound.recv().await {
        Some(OutboundFrame::Close { code, .. }) => assert_eq!(code, 4000),
        other => panic!("expected close frame, got {:?}", other),
    }

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Reconnecting);
    assert!(snapshot.last_error.unwrap().starts_with("Heartbeat timeout"));

    let before = Instant::now();
    assert!(h.peers.recv().await.is_some());
    assert!(before.elapsed() >= Duration::from_millis(5000));
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_terminal_and_clears_subscriptions() {
    let mut h = start(RealtimeConfig::default());
    let mut peer = connect_and_open(&mut h).await;
    h.handle.subscribe(["player_stats"]).unwrap();
    next_json(&mut peer).await;

    h.handle.disconnect().unwrap();
    assert_eq!(
        peer.outbound.recv().await,
        Some(OutboundFrame::Close { code: 1000, reason: "Manual disconnect".into() })
    );

    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.state, ConnectionState::Disconnected);
    assert!(stats.subscriptions.is_empty());
    assert_eq!(stats.status, "Disconnected");
    assert!(timeout(Duration::from_secs(120), h.peers.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_do_not_disturb_the_pipeline() {
    let mut h = start(RealtimeConfig { batch_updates: false, ..Default::default() });
    let peer = connect_and_open(&mut h).await;

    peer.emit(TransportEvent::Message("{{{".into()));
    peer.emit(TransportEvent::Message(json!({"type": "teleport"}).to_string()));
    peer.emit(TransportEvent::Message(json!({"type": "data", "data": {"no_type": 1}}).to_string()));
    peer.emit(data_frame("ok", "stat"));

    let batch = h.batches.recv().await.unwrap();
    assert_eq!(batch.updates.len(), 1);
    assert_eq!(batch.updates[0].id, "ok");
    let stats = stats_when(&h.handle, |s| s.messages_received == 4).await;
    assert_eq!(stats.update_count, 1);
    assert!(stats.is_connected);
}

#[tokio::test]
async fn flushed_batches_fan_out_over_bus_and_cache() {
    let mut h = start(RealtimeConfig { batch_updates: false, ..Default::default() });
    let peer = connect_and_open(&mut h).await;

    let bus = PubSubBus::new(Arc::new(MemoryBusTransport::new(64)));
    let cache = CacheStore::new(Arc::new(MemoryCacheBackend::new()));
    assert!(bus.init().await);
    assert!(cache.init().await);

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    assert!(bus.subscribe("updates:NFL", move |msg| {
        let _ = seen_tx.send(msg);
    }).await);

    peer.emit(data_frame("u9", "score"));
    let batch = h.batches.recv().await.unwrap();
    assert!(bus.publish("updates:NFL", &batch).await);
    assert!(cache.cache_sports_data("NFL", "live_updates", &batch.updates, None).await);

    let delivered = seen_rx.recv().await.unwrap();
    assert_eq!(delivered["updates"][0]["id"], "u9");
    let cached: Vec<Value> = cache.get_sports_data("NFL", "live_updates").await.unwrap();
    assert_eq!(cached[0]["type"], "score");
}
