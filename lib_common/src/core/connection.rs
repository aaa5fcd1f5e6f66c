//! # Connection Manager
//!
//! Lifecycle state machine for one upstream transport. It owns no socket and
//! no timers: the session loop feeds it transport events and clock readings,
//! and it answers with decisions (reconnect or stop) while keeping the
//! observable [`ConnectionSnapshot`] current.
//!
//! ## States
//!
//! `Disconnected → Connecting → Connected`, with any unclean close going
//! through `Error` and, while retries remain, `Reconnecting`. Only a close with
//! code `1000` or an explicit [`ConnectionManager::disconnect`] returns to
//! `Disconnected`.
//!
//! ## Heartbeat bookkeeping
//!
//! Every ping is recorded as a pending correlation entry. A matching pong
//! yields the round-trip latency. Entries older than the ping timeout are
//! evicted by [`ConnectionManager::evict_stale_pings`] and count as a liveness
//! failure.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::configs::RealtimeConfig;
use crate::core::transport::NORMAL_CLOSURE;
use crate::utils::misc::utils::generate_id;

/// Capacity of the state-change broadcast. Slow observers lag, they never block.
const STATE_CHANGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Observable view of the connection, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub status: String,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub latency_ms: u64,
    pub last_error: Option<String>,
    pub messages_received: u64,
    pub messages_per_second: f64,
}

/// One transition, as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub snapshot: ConnectionSnapshot,
}

/// What the session loop should do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Clean close; stay `Disconnected`.
    Stopped,
    /// Retry after `delay`. `attempt` is 1-based.
    Reconnect { attempt: u32, delay: Duration },
    /// Retries exhausted or disabled; stay in `Error`.
    GiveUp,
}

/// Messages-per-second, recomputed once per elapsed second of traffic.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    total: u64,
    window_start: Option<Instant>,
    window_count: u64,
    per_second: f64,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self { total: 0, window_start: None, window_count: 0, per_second: 0.0 }
    }

    /// Returns `true` when the rate was recomputed.
    pub fn record(&mut self, now: Instant) -> bool {
        self.total += 1;
        self.window_count += 1;
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= Duration::from_secs(1) {
            self.per_second = self.window_count as f64 / elapsed.as_secs_f64();
            self.window_count = 0;
            self.window_start = Some(now);
            return true;
        }
        false
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn per_second(&self) -> f64 {
        self.per_second
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionManager {
    state: ConnectionState,
    last_connected_at: Option<DateTime<Utc>>,
    connected_since: Option<Instant>,
    reconnect_attempts: u32,
    latency_ms: u64,
    last_error: Option<String>,
    pending_pings: HashMap<String, Instant>,
    throughput: ThroughputMeter,

    auto_reconnect: bool,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,

    changes: broadcast::Sender<StateChange>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionManager {
    pub fn new(config: &RealtimeConfig) -> Self {
        let (changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        let mut manager = Self {
            state: ConnectionState::Disconnected,
            last_connected_at: None,
            connected_since: None,
            reconnect_attempts: 0,
            latency_ms: 0,
            last_error: None,
            pending_pings: HashMap::new(),
            throughput: ThroughputMeter::new(),
            auto_reconnect: config.auto_reconnect,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
            changes,
            snapshot_tx: watch::channel(ConnectionSnapshot::initial()).0,
        };
        manager.publish_snapshot();
        manager
    }

    pub fn apply_config(&mut self, config: &RealtimeConfig) {
        self.auto_reconnect = config.auto_reconnect;
        self.max_reconnect_attempts = config.max_reconnect_attempts;
        self.reconnect_delay = config.reconnect_delay();
        self.publish_snapshot();
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn pending_ping_count(&self) -> usize {
        self.pending_pings.len()
    }

    pub fn throughput(&self) -> &ThroughputMeter {
        &self.throughput
    }

    /// Time since the current connection opened, zero when not connected.
    pub fn uptime(&self) -> Duration {
        match (self.state, self.connected_since) {
            (ConnectionState::Connected, Some(since)) => since.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn change_sender(&self) -> broadcast::Sender<StateChange> {
        self.changes.clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            status: self.status(),
            last_connected_at: self.last_connected_at,
            reconnect_attempts: self.reconnect_attempts,
            latency_ms: self.latency_ms,
            last_error: self.last_error.clone(),
            messages_received: self.throughput.total(),
            messages_per_second: self.throughput.per_second(),
        }
    }

    /// Human readable status line.
    pub fn status(&self) -> String {
        match self.state {
            ConnectionState::Connected => format!("Connected ({}ms)", self.latency_ms),
            ConnectionState::Connecting => "Connecting...".to_string(),
            ConnectionState::Reconnecting => {
                format!("Reconnecting ({}/{})", self.reconnect_attempts, self.max_reconnect_attempts)
            }
            ConnectionState::Error => {
                format!("Error: {}", self.last_error.as_deref().unwrap_or("Unknown error"))
            }
            ConnectionState::Disconnected => "Disconnected".to_string(),
        }
    }

    /// Returns `false` when already connected and nothing should be opened.
    pub fn begin_connect(&mut self) -> bool {
        if self.state == ConnectionState::Connected {
            return false;
        }
        self.last_error = None;
        self.transition(ConnectionState::Connecting);
        true
    }

    /// The open call itself failed.
    pub fn connect_failed(&mut self, error: impl Into<String>) {
        let error = error.into();
        log::error!("Failed to open transport: {}", error);
        self.last_error = Some(error);
        self.transition(ConnectionState::Error);
    }

    pub fn on_open(&mut self) {
        self.last_connected_at = Some(Utc::now());
        self.connected_since = Some(Instant::now());
        self.reconnect_attempts = 0;
        self.last_error = None;
        self.pending_pings.clear();
        self.transition(ConnectionState::Connected);
    }

    pub fn on_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        log::error!("Transport error: {}", error);
        self.last_error = Some(error);
        self.transition(ConnectionState::Error);
    }

    /// Records an error reported by the peer without leaving the current state.
    pub fn on_server_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        log::warn!("Server reported error: {}", error);
        self.last_error = Some(error);
        self.publish_snapshot();
    }

    /// Decides what follows a transport close.
    pub fn on_close(&mut self, code: u16, reason: &str) -> CloseDecision {
        self.pending_pings.clear();
        self.connected_since = None;

        if code == NORMAL_CLOSURE {
            log::info!("Transport closed cleanly: {}", reason);
            self.transition(ConnectionState::Disconnected);
            return CloseDecision::Stopped;
        }

        log::warn!("Transport closed with code {}: {}", code, reason);
        if self.last_error.is_none() {
            self.last_error = Some(format!("Connection closed ({})", code));
        }
        self.transition(ConnectionState::Error);

        if !self.auto_reconnect {
            return CloseDecision::GiveUp;
        }
        if self.reconnect_attempts >= self.max_reconnect_attempts {
            log::error!(
                "Giving up after {} reconnect attempts; call connect() to retry",
                self.reconnect_attempts
            );
            return CloseDecision::GiveUp;
        }

        self.reconnect_attempts += 1;
        self.transition(ConnectionState::Reconnecting);
        log::info!(
            "Reconnect attempt {}/{} in {:?}",
            self.reconnect_attempts,
            self.max_reconnect_attempts,
            self.reconnect_delay
        );
        CloseDecision::Reconnect { attempt: self.reconnect_attempts, delay: self.reconnect_delay }
    }

    /// Explicit disconnect. Always lands in `Disconnected`.
    pub fn disconnect(&mut self) {
        self.pending_pings.clear();
        self.connected_since = None;
        self.reconnect_attempts = 0;
        self.latency_ms = 0;
        self.last_error = None;
        self.transition(ConnectionState::Disconnected);
    }

    /// Records a new ping and returns its correlation id.
    pub fn issue_ping(&mut self, now: Instant) -> String {
        let id = generate_id();
        self.pending_pings.insert(id.clone(), now);
        id
    }

    /// Resolves a pong. Unknown ids are ignored.
    pub fn on_pong(&mut self, id: &str, now: Instant) -> Option<u64> {
        let sent_at = self.pending_pings.remove(id)?;
        self.latency_ms = now.saturating_duration_since(sent_at).as_millis() as u64;
        log::debug!("Heartbeat latency {}ms", self.latency_ms);
        self.publish_snapshot();
        Some(self.latency_ms)
    }

    /// Drops pings older than `timeout`; returns how many were dropped.
    pub fn evict_stale_pings(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.pending_pings.len();
        self.pending_pings
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) < timeout);
        before - self.pending_pings.len()
    }

    /// Marks the link dead after unanswered pings.
    pub fn liveness_failure(&mut self, stale: usize, timeout: Duration) {
        let error = format!("Heartbeat timeout: {} ping(s) unanswered after {:?}", stale, timeout);
        log::warn!("{}", error);
        self.last_error = Some(error);
    }

    pub fn record_message(&mut self, now: Instant) {
        if self.throughput.record(now) {
            self.publish_snapshot();
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        self.state = to;
        let snapshot = self.publish_snapshot();
        if from == to {
            return;
        }
        log::info!("Connection state {} -> {} ({})", from, to, snapshot.status);
        // No receivers is fine.
        let _ = self.changes.send(StateChange { from, to, snapshot });
    }

    fn publish_snapshot(&mut self) -> ConnectionSnapshot {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        snapshot
    }
}

impl ConnectionSnapshot {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            status: "Disconnected".to_string(),
            last_connected_at: None,
            reconnect_attempts: 0,
            latency_ms: 0,
            last_error: None,
            messages_received: 0,
            messages_per_second: 0.0,
        }
    }
}
