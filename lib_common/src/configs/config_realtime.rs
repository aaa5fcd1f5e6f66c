//! # Realtime Pipeline Configuration
//!
//! `RealtimeConfig` carries every knob of the connection manager and the
//! update dispatcher. Field names serialize in `camelCase` so a JSON config
//! file reads the same as the wire-level option names (`autoReconnect`,
//! `batchInterval`, ...).
//!
//! `RealtimeConfigPatch` is the partial form: every field optional, merged
//! over a full config where `Some` wins. `maxPendingUpdates: null` in a patch
//! lifts the intake bound, while an absent field keeps it.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Upper bound for every millisecond interval option (one day).
pub const MAX_INTERVAL_MS: u64 = 86_400_000;

/// Invalid option values caught by [`RealtimeConfig::validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
    #[error("{0} must not exceed {1}")]
    TooLarge(&'static str, u64),
}

/// What to do with an arriving update when the intake queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Discard the oldest pending update to make room.
    #[default]
    DropOldest,
    /// Discard the arriving update.
    Reject,
}

/// Options for one live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeConfig {
    pub auto_reconnect: bool,
    /// Fixed delay between reconnect attempts, in milliseconds.
    pub reconnect_interval: u64,
    pub max_reconnect_attempts: u32,
    /// Milliseconds between heartbeat pings.
    pub heartbeat_interval: u64,
    /// Maximum number of updates retained in the recent-updates ring.
    pub buffer_size: usize,
    pub batch_updates: bool,
    /// Queue length that triggers an immediate flush.
    pub batch_size: usize,
    /// Milliseconds between time-based flushes.
    pub batch_interval: u64,
    pub prioritize_updates: bool,
    /// Forwarded to the server in the authenticate message.
    pub compression_enabled: bool,
    /// Logs every outbound frame at info level.
    pub debug_mode: bool,
    /// Feature names announced on authenticate.
    pub features: Vec<String>,
    /// Upper bound on pending (not yet flushed) updates. `None` means unbounded.
    pub max_pending_updates: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    /// A ping unanswered for `ping_timeout_factor * heartbeat_interval` is a liveness failure.
    pub ping_timeout_factor: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: 5000,
            max_reconnect_attempts: 10,
            heartbeat_interval: 30000,
            buffer_size: 1000,
            batch_updates: true,
            batch_size: 10,
            batch_interval: 100,
            prioritize_updates: true,
            compression_enabled: true,
            debug_mode: false,
            features: vec![
                "live_scores".to_string(),
                "player_stats".to_string(),
                "game_events".to_string(),
            ],
            max_pending_updates: None,
            overflow_policy: OverflowPolicy::DropOldest,
            ping_timeout_factor: 2,
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn batch_period(&self) -> Duration {
        Duration::from_millis(self.batch_interval)
    }

    /// Age after which an unanswered ping counts as a liveness failure.
    pub fn ping_timeout(&self) -> Duration {
        self.heartbeat_period()
            .checked_mul(self.ping_timeout_factor)
            .unwrap_or(Duration::MAX)
    }

    /// Rejects values that would stall the pipeline (zero intervals, empty
    /// buffers) or overflow a timer deadline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("reconnectInterval", self.reconnect_interval),
            ("heartbeatInterval", self.heartbeat_interval),
            ("batchInterval", self.batch_interval),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(ConfigError::TooLarge(name, MAX_INTERVAL_MS));
            }
        }
        if self.reconnect_interval == 0 {
            return Err(ConfigError::MustBePositive("reconnectInterval"));
        }
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::MustBePositive("heartbeatInterval"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::MustBePositive("bufferSize"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::MustBePositive("batchSize"));
        }
        if self.batch_interval == 0 {
            return Err(ConfigError::MustBePositive("batchInterval"));
        }
        if self.ping_timeout_factor == 0 {
            return Err(ConfigError::MustBePositive("pingTimeoutFactor"));
        }
        if self.max_pending_updates == Some(0) {
            return Err(ConfigError::MustBePositive("maxPendingUpdates"));
        }
        Ok(())
    }

    /// Applies `patch` over `self`, where `Some` values in the patch win.
    pub fn merge(self, patch: RealtimeConfigPatch) -> RealtimeConfig {
        RealtimeConfig {
            auto_reconnect: patch.auto_reconnect.unwrap_or(self.auto_reconnect),
            reconnect_interval: patch.reconnect_interval.unwrap_or(self.reconnect_interval),
            max_reconnect_attempts: patch.max_reconnect_attempts.unwrap_or(self.max_reconnect_attempts),
            heartbeat_interval: patch.heartbeat_interval.unwrap_or(self.heartbeat_interval),
            buffer_size: patch.buffer_size.unwrap_or(self.buffer_size),
            batch_updates: patch.batch_updates.unwrap_or(self.batch_updates),
            batch_size: patch.batch_size.unwrap_or(self.batch_size),
            batch_interval: patch.batch_interval.unwrap_or(self.batch_interval),
            prioritize_updates: patch.prioritize_updates.unwrap_or(self.prioritize_updates),
            compression_enabled: patch.compression_enabled.unwrap_or(self.compression_enabled),
            debug_mode: patch.debug_mode.unwrap_or(self.debug_mode),
            features: patch.features.unwrap_or(self.features),
            max_pending_updates: patch.max_pending_updates.unwrap_or(self.max_pending_updates),
            overflow_policy: patch.overflow_policy.unwrap_or(self.overflow_policy),
            ping_timeout_factor: patch.ping_timeout_factor.unwrap_or(self.ping_timeout_factor),
        }
    }
}

/// A partial [`RealtimeConfig`]; see [`RealtimeConfig::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeConfigPatch {
    pub auto_reconnect: Option<bool>,
    pub reconnect_interval: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub heartbeat_interval: Option<u64>,
    pub buffer_size: Option<usize>,
    pub batch_updates: Option<bool>,
    pub batch_size: Option<usize>,
    pub batch_interval: Option<u64>,
    pub prioritize_updates: Option<bool>,
    pub compression_enabled: Option<bool>,
    pub debug_mode: Option<bool>,
    pub features: Option<Vec<String>>,
    /// `Some(None)` resets the bound to unbounded.
    #[serde(deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub max_pending_updates: Option<Option<usize>>,
    pub overflow_policy: Option<OverflowPolicy>,
    pub ping_timeout_factor: Option<u32>,
}

/// Reads a present field, `null` included, as `Some`; absent fields fall back to `default`.
fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl RealtimeConfigPatch {
    /// Merges two patches, where `other` overrides `self` for `Some` values.
    pub fn merge(self, other: RealtimeConfigPatch) -> RealtimeConfigPatch {
        RealtimeConfigPatch {
            auto_reconnect: other.auto_reconnect.or(self.auto_reconnect),
            reconnect_interval: other.reconnect_interval.or(self.reconnect_interval),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
            heartbeat_interval: other.heartbeat_interval.or(self.heartbeat_interval),
            buffer_size: other.buffer_size.or(self.buffer_size),
            batch_updates: other.batch_updates.or(self.batch_updates),
            batch_size: other.batch_size.or(self.batch_size),
            batch_interval: other.batch_interval.or(self.batch_interval),
            prioritize_updates: other.prioritize_updates.or(self.prioritize_updates),
            compression_enabled: other.compression_enabled.or(self.compression_enabled),
            debug_mode: other.debug_mode.or(self.debug_mode),
            features: other.features.or(self.features),
            max_pending_updates: other.max_pending_updates.or(self.max_pending_updates),
            overflow_policy: other.overflow_policy.or(self.overflow_policy),
            ping_timeout_factor: other.ping_timeout_factor.or(self.ping_timeout_factor),
        }
    }
}
