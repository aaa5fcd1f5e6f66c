//! # Live Session
//!
//! One connection, one task. `LiveSession` owns the [`ConnectionManager`],
//! the [`UpdateDispatcher`] and the [`SubscriptionRegistry`] and mutates them
//! only from its own `tokio::select!` loop, so none of them need locks.
//!
//! The loop waits on:
//!
//! - commands from any [`SessionHandle`] clone,
//! - events from the current transport link,
//! - the heartbeat interval (only while connected),
//! - the batch interval (only while batching is enabled),
//! - the reconnect deadline (only while a retry is scheduled),
//! - changes of the active [`Scope`].
//!
//! Observers follow the connection through [`SessionHandle::state_changes`]
//! (every transition) or [`SessionHandle::watch_snapshot`] (latest value only).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::configs::{ConfigError, RealtimeConfig, RealtimeConfigPatch};
use crate::core::connection::{
    CloseDecision, ConnectionManager, ConnectionSnapshot, ConnectionState, StateChange,
};
use crate::core::dispatcher::{SharedUpdate, UpdateDispatcher};
use crate::core::model::{parse_inbound, ControlMessage, Inbound, MessageType, RealTimeUpdate, Scope};
use crate::core::registry::SubscriptionRegistry;
use crate::core::transport::{
    Connector, OutboundFrame, TransportEvent, TransportLink, ABNORMAL_CLOSURE, LIVENESS_FAILURE,
    NORMAL_CLOSURE,
};

/// Source of the active scope. Owned by whoever decides the current sport.
pub type ScopeProvider = watch::Receiver<Scope>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("live session has stopped")]
    Stopped,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

enum SessionCommand {
    Connect,
    Disconnect,
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Send { kind: MessageType, channel: Option<String>, data: Option<Value> },
    UpdateConfig(RealtimeConfigPatch, oneshot::Sender<Result<(), ConfigError>>),
    Stats(oneshot::Sender<SessionStats>),
    RecentUpdates(oneshot::Sender<Vec<SharedUpdate>>),
    Flush(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub is_connected: bool,
    pub state: ConnectionState,
    pub status: String,
    pub uptime_ms: u64,
    pub latency_ms: u64,
    pub messages_received: u64,
    pub messages_per_second: f64,
    pub reconnect_attempts: u32,
    pub subscriptions: Vec<String>,
    pub queue_size: usize,
    pub update_count: u64,
    pub flush_count: u64,
    pub dropped_updates: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub pending_pings: usize,
}

/// Cloneable front door to a running [`LiveSession`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    changes: broadcast::Sender<StateChange>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Stopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    pub fn connect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect)
    }

    pub fn subscribe<I, S>(&self, channels: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(SessionCommand::Subscribe(channels.into_iter().map(Into::into).collect()))
    }

    pub fn unsubscribe<I, S>(&self, channels: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(SessionCommand::Unsubscribe(channels.into_iter().map(Into::into).collect()))
    }

    /// Wraps `data` in a control envelope and sends it if connected.
    pub fn send_message(
        &self,
        kind: MessageType,
        channel: Option<String>,
        data: Option<Value>,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::Send { kind, channel, data })
    }

    pub async fn update_config(&self, patch: RealtimeConfigPatch) -> Result<(), SessionError> {
        self.request(|tx| SessionCommand::UpdateConfig(patch, tx)).await??;
        Ok(())
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(SessionCommand::Stats).await
    }

    pub async fn recent_updates(&self) -> Result<Vec<SharedUpdate>, SessionError> {
        self.request(SessionCommand::RecentUpdates).await
    }

    /// Forces a flush now; returns the batch size.
    pub async fn flush(&self) -> Result<usize, SessionError> {
        self.request(SessionCommand::Flush).await
    }

    /// Disconnects, flushes what is queued, and stops the task.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Shutdown).await
    }

    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }
}

pub struct LiveSession {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    connection: ConnectionManager,
    dispatcher: UpdateDispatcher,
    registry: SubscriptionRegistry,
    scope: ScopeProvider,
    scope_open: bool,
    link: Option<TransportLink>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    batch_timer: Option<Interval>,
}

impl LiveSession {
    pub fn new(
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
        scope: ScopeProvider,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            connection: ConnectionManager::new(&config),
            dispatcher: UpdateDispatcher::new(&config),
            registry: SubscriptionRegistry::new(),
            config,
            connector,
            scope,
            scope_open: true,
            link: None,
            reconnect_at: None,
            heartbeat: None,
            batch_timer: None,
        })
    }

    /// For registering handlers and the analytics sink before spawning.
    pub fn dispatcher_mut(&mut self) -> &mut UpdateDispatcher {
        &mut self.dispatcher
    }

    /// Starts the loop. It runs until `shutdown()` or every handle is dropped.
    pub fn spawn(self) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: tx,
            changes: self.connection.change_sender(),
            snapshot: self.connection.watch_snapshot(),
        };
        (handle, tokio::spawn(self.run(rx)))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        self.batch_timer = self.new_batch_timer();
        log::info!("Live session started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                event = next_event(&mut self.link) => {
                    let event = event.unwrap_or(TransportEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "transport dropped".to_string(),
                    });
                    self.handle_transport_event(event);
                }
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
                _ = tick(&mut self.heartbeat) => self.heartbeat_tick(),
                _ = tick(&mut self.batch_timer) => {
                    let scope = self.current_scope();
                    self.dispatcher.flush(&scope);
                }
                changed = self.scope.changed(), if self.scope_open => match changed {
                    Ok(()) => self.on_scope_change(),
                    Err(_) => {
                        log::debug!("Scope provider dropped; keeping last scope");
                        self.scope_open = false;
                    }
                },
            }
        }
        log::info!("Live session stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect => self.connect().await,
            SessionCommand::Disconnect => self.disconnect(),
            SessionCommand::Subscribe(channels) => {
                let scope = self.current_scope();
                for message in self.registry.subscribe(&channels, &scope) {
                    self.send_control(message);
                }
            }
            SessionCommand::Unsubscribe(channels) => {
                for message in self.registry.unsubscribe(&channels) {
                    self.send_control(message);
                }
            }
            SessionCommand::Send { kind, channel, data } => {
                self.send_control(ControlMessage::outbound(kind, channel, data));
            }
            SessionCommand::UpdateConfig(patch, reply) => {
                let _ = reply.send(self.update_config(patch));
            }
            SessionCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            SessionCommand::RecentUpdates(reply) => {
                let _ = reply.send(self.dispatcher.recent_updates());
            }
            SessionCommand::Flush(reply) => {
                let scope = self.current_scope();
                let _ = reply.send(self.dispatcher.flush(&scope));
            }
            // Handled by the loop.
            SessionCommand::Shutdown(_) => {}
        }
    }

    async fn connect(&mut self) {
        if !self.connection.begin_connect() {
            log::debug!("connect() ignored: already connected");
            return;
        }
        self.reconnect_at = None;
        self.heartbeat = None;
        self.link = None;

        match self.connector.open().await {
            Ok(link) => self.link = Some(link),
            Err(e) => self.connection.connect_failed(e.to_string()),
        }
    }

    fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.heartbeat = None;
        if let Some(link) = self.link.take() {
            let _ = link.send(OutboundFrame::Close {
                code: NORMAL_CLOSURE,
                reason: "Manual disconnect".to_string(),
            });
        }
        self.registry.clear();
        self.connection.disconnect();
    }

    fn shutdown(&mut self) {
        self.disconnect();
        let scope = self.current_scope();
        let flushed = self.dispatcher.flush(&scope);
        if flushed > 0 {
            log::info!("Flushed {} pending update(s) on shutdown", flushed);
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(text) => self.on_message(&text),
            TransportEvent::Error(error) => self.connection.on_error(error),
            TransportEvent::Closed { code, reason } => self.on_close(code, &reason),
        }
    }

    fn on_open(&mut self) {
        self.connection.on_open();
        self.heartbeat = Some(periodic(self.config.heartbeat_period()));

        let scope = self.current_scope();
        let auth = json!({
            "sport": scope.sport,
            "features": self.config.features,
            "compression": self.config.compression_enabled,
        });
        self.send_control(ControlMessage::outbound(MessageType::Authenticate, None, Some(auth)));

        for message in self.registry.replay(&scope) {
            self.send_control(message);
        }
    }

    fn on_message(&mut self, text: &str) {
        let now = Instant::now();
        self.connection.record_message(now);

        match parse_inbound(text) {
            Ok(Inbound::Pong { id: Some(id) }) => {
                if self.connection.on_pong(&id, now).is_none() {
                    log::debug!("Pong for unknown ping {}", id);
                }
            }
            Ok(Inbound::Pong { id: None }) => log::debug!("Pong without id ignored"),
            Ok(Inbound::Data(data)) => {
                let scope = self.current_scope();
                match RealTimeUpdate::from_data(&data, &scope) {
                    Ok(update) => {
                        self.dispatcher.enqueue(update, &scope);
                    }
                    Err(e) => log::warn!("Dropping update: {}", e),
                }
            }
            Ok(Inbound::Error(error)) => self.connection.on_server_error(error),
            Ok(Inbound::Ignored(kind)) => log::debug!("Ignoring inbound {:?} frame", kind),
            Err(e) => log::warn!("Dropping inbound frame: {}", e),
        }
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        self.heartbeat = None;
        self.link = None;
        self.reconnect_at = match self.connection.on_close(code, reason) {
            CloseDecision::Reconnect { delay, .. } => Some(Instant::now() + delay),
            CloseDecision::Stopped | CloseDecision::GiveUp => None,
        };
    }

    fn heartbeat_tick(&mut self) {
        if !self.connection.is_connected() {
            return;
        }
        let now = Instant::now();
        let timeout = self.config.ping_timeout();
        let stale = self.connection.evict_stale_pings(now, timeout);
        if stale > 0 {
            self.connection.liveness_failure(stale, timeout);
            if let Some(link) = self.link.take() {
                let _ = link.send(OutboundFrame::Close {
                    code: LIVENESS_FAILURE,
                    reason: "Heartbeat timeout".to_string(),
                });
            }
            self.on_close(LIVENESS_FAILURE, "Heartbeat timeout");
            return;
        }

        let id = self.connection.issue_ping(now);
        self.send_control(ControlMessage::outbound(MessageType::Ping, None, None).with_id(id));
    }

    fn on_scope_change(&mut self) {
        let scope = self.scope.borrow_and_update().clone();
        log::info!("Active scope changed to {:?}", scope.sport);
        if !self.connection.is_connected() || self.registry.is_empty() {
            return;
        }
        for message in self.registry.resync(&scope) {
            self.send_control(message);
        }
    }

    fn update_config(&mut self, patch: RealtimeConfigPatch) -> Result<(), ConfigError> {
        let merged = self.config.clone().merge(patch);
        merged.validate()?;

        let heartbeat_changed = merged.heartbeat_interval != self.config.heartbeat_interval;
        let batching_changed = merged.batch_updates != self.config.batch_updates
            || merged.batch_interval != self.config.batch_interval;
        self.config = merged;
        self.connection.apply_config(&self.config);
        self.dispatcher.apply_config(&self.config);

        if heartbeat_changed && self.connection.is_connected() {
            log::info!("Restarting heartbeat at {:?}", self.config.heartbeat_period());
            self.heartbeat = Some(periodic(self.config.heartbeat_period()));
        }
        if batching_changed {
            self.batch_timer = self.new_batch_timer();
        }
        Ok(())
    }

    fn send_control(&mut self, message: ControlMessage) {
        let link = match (&self.link, self.connection.is_connected()) {
            (Some(link), true) => link,
            _ => {
                log::warn!("Cannot send {:?} message - not connected", message.kind);
                return;
            }
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize {:?} message: {}", message.kind, e);
                return;
            }
        };
        if self.config.debug_mode {
            log::info!("Sending: {}", text);
        } else {
            log::trace!("Sending: {}", text);
        }
        if let Err(e) = link.send(OutboundFrame::Text(text)) {
            log::warn!("Failed to send {:?} message: {}", message.kind, e);
        }
    }

    fn stats(&self) -> SessionStats {
        let snapshot = self.connection.snapshot();
        SessionStats {
            is_connected: self.connection.is_connected(),
            state: snapshot.state,
            status: snapshot.status,
            uptime_ms: self.connection.uptime().as_millis() as u64,
            latency_ms: snapshot.latency_ms,
            messages_received: snapshot.messages_received,
            messages_per_second: snapshot.messages_per_second,
            reconnect_attempts: snapshot.reconnect_attempts,
            subscriptions: self.registry.channels().to_vec(),
            queue_size: self.dispatcher.queue_size(),
            update_count: self.dispatcher.update_count(),
            flush_count: self.dispatcher.flush_count(),
            dropped_updates: self.dispatcher.dropped_updates(),
            last_update: self.dispatcher.last_update(),
            error: snapshot.last_error,
            pending_pings: self.connection.pending_ping_count(),
        }
    }

    fn current_scope(&self) -> Scope {
        self.scope.borrow().clone()
    }

    fn new_batch_timer(&self) -> Option<Interval> {
        self.config.batch_updates.then(|| periodic(self.config.batch_period()))
    }
}

/// First tick one `period` from now.
fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_event(link: &mut Option<TransportLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{ChannelConnector, PeerLink};

    async fn started(config: RealtimeConfig) -> (SessionHandle, PeerLink, watch::Sender<Scope>) {
        let (connector, mut peers) = ChannelConnector::new();
        let (scope_tx, scope_rx) = watch::channel(Scope::sport("NFL"));
        let session = LiveSession::new(config, Arc::new(connector), scope_rx).unwrap();
        let (handle, _task) = session.spawn();
        handle.connect().unwrap();
        let peer = peers.recv().await.unwrap();
        (handle, peer, scope_tx)
    }

    async fn open(handle: &SessionHandle, peer: &mut PeerLink) -> Value {
        let mut changes = handle.state_changes();
        peer.emit(TransportEvent::Open);
        while changes.recv().await.unwrap().to != ConnectionState::Connected {}
        next_json(peer).await
    }

    /// Transport events and commands race inside `select!`; poll until settled.
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

    async fn next_json(peer: &mut PeerLink) -> Value {
        match peer.outbound.recv().await {
            Some(OutboundFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (connector, _peers) = ChannelConnector::new();
        let (_tx, rx) = watch::channel(Scope::default());
        let result = LiveSession::new(
            RealtimeConfig { batch_size: 0, ..Default::default() },
            Arc::new(connector),
            rx,
        );
        assert!(matches!(result, Err(ConfigError::MustBePositive("batchSize"))));
    }

    #[tokio::test(start_paused = true)]
    async fn authenticates_on_open() {
        let (handle, mut peer, _scope) = started(RealtimeConfig::default()).await;
        let auth = open(&handle, &mut peer).await;
        assert_eq!(auth["type"], "authenticate");
        assert_eq!(auth["data"]["sport"], "NFL");
        assert_eq!(auth["data"]["features"][0], "live_scores");
        assert_eq!(auth["data"]["compression"], true);
        assert_eq!(handle.snapshot().status, "Connected (0ms)");
    }

    #[tokio::test(start_paused = true)]
    async fn sends_while_disconnected_are_dropped() {
        let (connector, _peers) = ChannelConnector::new();
        let (_scope_tx, scope_rx) = watch::channel(Scope::default());
        let (handle, _task) = LiveSession::new(RealtimeConfig::default(), Arc::new(connector), scope_rx)
            .unwrap()
            .spawn();
        handle.subscribe(["live_scores"]).unwrap();
        let stats = handle.stats().await.unwrap();
        // The set is still updated.
        assert_eq!(stats.subscriptions, vec!["live_scores".to_string()]);
        assert_eq!(stats.state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_frame_sets_error_without_touching_queue() {
        let (handle, mut peer, _scope) = started(RealtimeConfig { batch_size: 50, ..Default::default() }).await;
        open(&handle, &mut peer).await;
        peer.emit(TransportEvent::Message(r#"{"type":"data","data":{"type":"stat"}}"#.into()));
        peer.emit(TransportEvent::Message(r#"{"type":"error","data":{"message":"quota"}}"#.into()));
        peer.emit(TransportEvent::Message("not json".into()));

        let stats = stats_when(&handle, |s| s.messages_received == 3).await;
        assert_eq!(stats.error.as_deref(), Some("quota"));
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.messages_received, 3);
        assert!(stats.is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_update_is_refused() {
        let (handle, _peer, _scope) = started(RealtimeConfig::default()).await;
        let patch = RealtimeConfigPatch { buffer_size: Some(0), ..Default::default() };
        assert!(matches!(handle.update_config(patch).await, Err(SessionError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_heartbeat_is_refused_and_session_keeps_running() {
        let (handle, mut peer, _scope) = started(RealtimeConfig::default()).await;
        open(&handle, &mut peer).await;
        let patch = RealtimeConfigPatch {
            heartbeat_interval: Some(u64::MAX),
            ping_timeout_factor: Some(u32::MAX),
            ..Default::default()
        };
        assert!(matches!(
            handle.update_config(patch).await,
            Err(SessionError::Config(ConfigError::TooLarge("heartbeatInterval", _)))
        ));

        // The old 30s heartbeat is still running.
        tokio::time::advance(Duration::from_secs(30)).await;
        let ping = next_json(&mut peer).await;
        assert_eq!(ping["type"], "ping");
        assert!(handle.stats().await.unwrap().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_and_closes_cleanly() {
        let (handle, mut peer, _scope) = started(RealtimeConfig { batch_size: 50, ..Default::default() }).await;
        open(&handle, &mut peer).await;
        peer.emit(TransportEvent::Message(r#"{"type":"data","data":{"type":"score"}}"#.into()));
        stats_when(&handle, |s| s.queue_size == 1).await;

        handle.shutdown().await.unwrap();
        assert_eq!(
            peer.outbound.recv().await,
            Some(OutboundFrame::Close { code: NORMAL_CLOSURE, reason: "Manual disconnect".into() })
        );
        assert!(matches!(handle.stats().await, Err(SessionError::Stopped)));
    }
}
