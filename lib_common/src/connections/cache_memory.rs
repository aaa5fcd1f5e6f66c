//! # In-Memory Cache Backend
//!
//! A process-local [`CacheBackend`] for tests and single-node deployments.
//! Expiry is evaluated lazily on every access against `tokio::time::Instant`,
//! so a read after the deadline reports the key as absent even if it has not
//! been swept yet. `keys` patterns are matched with [`glob::Pattern`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use glob::Pattern;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::cache_store::{human_bytes, BackendInfo, CacheBackend, CacheError, KeyTtl};

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    started: Instant,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            started: Instant::now(),
        }
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn connect(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CacheError> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries.get(key).is_some_and(|e| e.is_live(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mset(&self, pairs: Vec<(String, String)>) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        for (key, value) in pairs {
            entries.insert(key, MemoryEntry { value, expires_at: None });
        }
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(keys
            .iter()
            .map(|key| {
                entries
                    .get(key)
                    .filter(|e| e.is_live(now))
                    .map(|e| e.value.clone())
            })
            .collect())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let pattern = Pattern::new(pattern)?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.is_live(now));
        Ok(entries
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(match entries.get(key) {
            Some(entry) if entry.is_live(now) => match entry.expires_at {
                Some(deadline) => KeyTtl::Expires(deadline - now),
                None => KeyTtl::Persistent,
            },
            _ => KeyTtl::Missing,
        })
    }

    async fn info(&self) -> Result<BackendInfo, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.is_live(now));
        let bytes: usize = entries.iter().map(|(k, e)| k.len() + e.value.len()).sum();
        Ok(BackendInfo {
            memory_usage: human_bytes(bytes as u64),
            keys_count: entries.len() as u64,
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
        })
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
