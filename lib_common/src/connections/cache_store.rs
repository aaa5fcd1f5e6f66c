//! # Cache Store
//!
//! A JSON key/value cache with per-key expiry, layered over a pluggable
//! [`CacheBackend`] (Redis in production, [`MemoryCacheBackend`] in tests and
//! single-process deployments).
//!
//! Every public operation absorbs backend and serialization failures: the
//! error is logged and the caller gets a safe default (`false`, `None`, `0`
//! or a vector of `None`). Absence is never an error either.
//!
//! ## Key namespaces
//!
//! - `sports:<sport>:<dataType>:<YYYY-MM-DD>`
//! - `team:<teamId>:performance:<epochMillis>` (13-digit, zero padded)
//! - `feature:<featureName>:<inputHash>`
//!
//! ## Housekeeping
//!
//! [`CacheStore::cache_stats`] reports backend memory, key count, uptime and
//! the hit rate of [`CacheStore::get`] since construction.
//! [`CacheStore::cleanup_expired_keys`] gives every key that was stored
//! without a TTL a one hour expiry.
//!
//! [`MemoryCacheBackend`]: crate::connections::cache_memory::MemoryCacheBackend

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::misc::utils::{fixed_width_millis, now_millis, today_utc};

/// Default TTL for `sports:` entries.
pub const SPORTS_DATA_TTL_MINUTES: u64 = 15;
/// Default TTL for `team:` performance snapshots.
pub const TEAM_PERFORMANCE_TTL_MINUTES: u64 = 30;
/// Default TTL for `feature:` results.
pub const FEATURE_RESULT_TTL_MINUTES: u64 = 10;
/// Expiry given to persistent keys by [`CacheStore::cleanup_expired_keys`].
pub const CLEANUP_TTL: Duration = Duration::from_secs(3600);

/// Failures raised by a [`CacheBackend`]. They never escape [`CacheStore`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache backend is not connected")]
    NotConnected,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid key pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Remaining lifetime of a key, as reported by [`CacheBackend::ttl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    /// Stored without an expiry.
    Persistent,
    Expires(Duration),
}

/// Raw server figures behind [`CacheStore::cache_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendInfo {
    /// Human readable, in the `used_memory_human` format (`872B`, `1.05M`).
    pub memory_usage: String,
    pub keys_count: u64,
    pub uptime_secs: u64,
}

/// Raw string operations a cache backend must provide.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Opens connections. Called once from [`CacheStore::init`].
    async fn connect(&self) -> Result<(), CacheError>;
    /// Releases connections. Called once from [`CacheStore::shutdown`].
    async fn disconnect(&self) -> Result<(), CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    /// Deletes the given keys and returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
    /// Sets a new TTL on an existing key; `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
    async fn mset(&self, pairs: Vec<(String, String)>) -> Result<(), CacheError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;
    /// Lists live keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError>;
    async fn info(&self) -> Result<BackendInfo, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Overall health as reported by [`CacheStore::health_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub status: HealthStatus,
    pub latency_ms: u64,
    /// Backend memory usage, `"error"` when it could not be read.
    pub memory: String,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub connected: bool,
    pub memory_usage: String,
    pub keys_count: u64,
    /// Share of [`CacheStore::get`] calls that found a value, `0.0` before any read.
    pub hit_rate: f64,
    /// Backend uptime in seconds.
    pub uptime: u64,
}

#[derive(Default)]
struct ReadCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ReadCounters {
    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// The cache service. Construct one per process and share it behind an `Arc`.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    reads: Arc<ReadCounters>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            reads: Arc::new(ReadCounters::default()),
        }
    }

    /// Connects the backend. Returns `false` (and logs) on failure.
    pub async fn init(&self) -> bool {
        match self.backend.connect().await {
            Ok(()) => {
                log::info!("Cache store connected");
                true
            }
            Err(e) => {
                log::error!("Cache store failed to connect: {}", e);
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        match self.backend.disconnect().await {
            Ok(()) => log::info!("Cache store disconnected"),
            Err(e) => log::error!("Error disconnecting cache store: {}", e),
        }
    }

    /// Serializes `value` as JSON and stores it, optionally with a TTL.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Cache SET serialization error for key {}: {}", key, e);
                return false;
            }
        };
        match self.backend.set(key, serialized, ttl).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Cache SET error for key {}: {}", key, e);
                false
            }
        }
    }

    /// Reads and deserializes a value. Missing, expired or undecodable keys yield `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.backend.get(key).await {
            Ok(Some(raw)) => decode(key, &raw),
            Ok(None) => None,
            Err(e) => {
                log::error!("Cache GET error for key {}: {}", key, e);
                None
            }
        };
        self.reads.record(value.is_some());
        value
    }

    /// Deletes a key; `true` only if it existed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.delete(&[key.to_string()]).await {
            Ok(n) => n > 0,
            Err(e) => {
                log::error!("Cache DEL error for key {}: {}", key, e);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.backend.exists(key).await {
            Ok(found) => found,
            Err(e) => {
                log::error!("Cache EXISTS error for key {}: {}", key, e);
                false
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        match self.backend.expire(key, ttl).await {
            Ok(updated) => updated,
            Err(e) => {
                log::error!("Cache EXPIRE error for key {}: {}", key, e);
                false
            }
        }
    }

    /// Stores several values at once, without TTL.
    pub async fn mset<T: Serialize>(&self, pairs: &[(String, T)]) -> bool {
        let mut serialized = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match serde_json::to_string(value) {
                Ok(s) => serialized.push((key.clone(), s)),
                Err(e) => {
                    log::error!("Cache MSET serialization error for key {}: {}", key, e);
                    return false;
                }
            }
        }
        match self.backend.mset(serialized).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Cache MSET error: {}", e);
                false
            }
        }
    }

    /// Reads several keys. The result always has one slot per requested key.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        match self.backend.mget(keys).await {
            Ok(values) => keys
                .iter()
                .zip(values)
                .map(|(key, raw)| raw.and_then(|r| decode(key, &r)))
                .collect(),
            Err(e) => {
                log::error!("Cache MGET error: {}", e);
                keys.iter().map(|_| None).collect()
            }
        }
    }

    /// Deletes every key matching `pattern` and returns how many were removed.
    pub async fn flush_pattern(&self, pattern: &str) -> u64 {
        let keys = match self.backend.keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("Error listing keys for pattern {}: {}", pattern, e);
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }
        match self.backend.delete(&keys).await {
            Ok(n) => n,
            Err(e) => {
                log::error!("Error flushing pattern {}: {}", pattern, e);
                0
            }
        }
    }

    // --- Sports data ---

    pub fn sports_data_key(sport: &str, data_type: &str) -> String {
        format!("sports:{}:{}:{}", sport, data_type, today_utc())
    }

    /// Caches today's `data_type` payload for `sport`. TTL defaults to 15 minutes.
    pub async fn cache_sports_data<T: Serialize + ?Sized>(
        &self,
        sport: &str,
        data_type: &str,
        data: &T,
        ttl_minutes: Option<u64>,
    ) -> bool {
        let key = Self::sports_data_key(sport, data_type);
        let ttl = minutes(ttl_minutes.unwrap_or(SPORTS_DATA_TTL_MINUTES));
        self.set(&key, data, Some(ttl)).await
    }

    pub async fn get_sports_data<T: DeserializeOwned>(&self, sport: &str, data_type: &str) -> Option<T> {
        self.get(&Self::sports_data_key(sport, data_type)).await
    }

    // --- Team performance snapshots ---

    pub fn team_performance_key(team_id: &str, epoch_millis: i64) -> String {
        format!("team:{}:performance:{}", team_id, fixed_width_millis(epoch_millis))
    }

    /// Stores a new snapshot under a timestamp-suffixed key. TTL defaults to 30 minutes.
    pub async fn cache_team_performance<T: Serialize + ?Sized>(
        &self,
        team_id: &str,
        performance: &T,
        ttl_minutes: Option<u64>,
    ) -> bool {
        let key = Self::team_performance_key(team_id, now_millis());
        let ttl = minutes(ttl_minutes.unwrap_or(TEAM_PERFORMANCE_TTL_MINUTES));
        self.set(&key, performance, Some(ttl)).await
    }

    /// Returns the most recent live snapshot for a team.
    ///
    /// Lists every `team:<id>:performance:*` key and reads the
    /// lexicographically greatest one. O(n) in the number of snapshots, which
    /// is fine for the handful a team accumulates within its TTL.
    pub async fn get_team_performance<T: DeserializeOwned>(&self, team_id: &str) -> Option<T> {
        let pattern = format!("team:{}:performance:*", team_id);
        let mut keys = match self.backend.keys(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("Cache KEYS error for pattern {}: {}", pattern, e);
                return None;
            }
        };
        keys.sort();
        let latest = keys.pop()?;
        self.get(&latest).await
    }

    // --- Feature results ---

    pub fn feature_key(feature_name: &str, input_hash: &str) -> String {
        format!("feature:{}:{}", feature_name, input_hash)
    }

    /// Caches a computed feature result. TTL defaults to 10 minutes.
    pub async fn cache_feature_result<T: Serialize + ?Sized>(
        &self,
        feature_name: &str,
        input_hash: &str,
        result: &T,
        ttl_minutes: Option<u64>,
    ) -> bool {
        let key = Self::feature_key(feature_name, input_hash);
        let ttl = minutes(ttl_minutes.unwrap_or(FEATURE_RESULT_TTL_MINUTES));
        self.set(&key, result, Some(ttl)).await
    }

    pub async fn get_feature_result<T: DeserializeOwned>(&self, feature_name: &str, input_hash: &str) -> Option<T> {
        self.get(&Self::feature_key(feature_name, input_hash)).await
    }

    // --- Health ---

    pub async fn ping(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Cache PING error: {}", e);
                false
            }
        }
    }

    pub async fn health_check(&self) -> CacheHealth {
        let started = Instant::now();
        let connected = self.ping().await;
        let memory = if connected {
            self.cache_stats().await.memory_usage
        } else {
            "error".to_string()
        };
        CacheHealth {
            status: if connected { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
            latency_ms: started.elapsed().as_millis() as u64,
            memory,
            connected,
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        match self.backend.info().await {
            Ok(info) => CacheStats {
                connected: true,
                memory_usage: info.memory_usage,
                keys_count: info.keys_count,
                hit_rate: self.reads.hit_rate(),
                uptime: info.uptime_secs,
            },
            Err(e) => {
                log::error!("Error getting cache stats: {}", e);
                CacheStats {
                    connected: false,
                    memory_usage: "error".to_string(),
                    keys_count: 0,
                    hit_rate: 0.0,
                    uptime: 0,
                }
            }
        }
    }

    /// Gives every key stored without a TTL an expiry of [`CLEANUP_TTL`].
    /// Returns how many keys were updated.
    pub async fn cleanup_expired_keys(&self) -> u64 {
        let keys = match self.backend.keys("*").await {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("Error cleaning expired keys: {}", e);
                return 0;
            }
        };
        let mut cleaned = 0;
        for key in keys {
            match self.backend.ttl(&key).await {
                Ok(KeyTtl::Persistent) => {
                    if self.expire(&key, CLEANUP_TTL).await {
                        cleaned += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => log::error!("Cache TTL error for key {}: {}", key, e),
            }
        }
        if cleaned > 0 {
            log::info!("Applied default expiry to {} persistent cache keys", cleaned);
        }
        cleaned
    }
}

/// Formats a byte count the way Redis reports `used_memory_human`.
pub fn human_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{}B", bytes)
    } else if b < KIB * KIB {
        format!("{:.2}K", b / KIB)
    } else if b < KIB * KIB * KIB {
        format!("{:.2}M", b / (KIB * KIB))
    } else {
        format!("{:.2}G", b / (KIB * KIB * KIB))
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            log::error!("Cache value for key {} is not valid JSON: {}", key, e);
            None
        }
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}
