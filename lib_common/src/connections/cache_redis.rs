//! # Redis Cache Backend
//!
//! Provides the production [`CacheBackend`] on top of an async Redis
//! `ConnectionManager`, which transparently reconnects after transient
//! failures. Values are stored as JSON strings; TTLs are applied with
//! millisecond precision (`SET .. PX`, `PEXPIRE`).
//!
//! Cache statistics come from the `INFO memory`, `INFO keyspace` and
//! `INFO server` sections.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use super::cache_store::{BackendInfo, CacheBackend, CacheError, KeyTtl};

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// A handler for Redis cache interactions.
pub struct RedisCacheBackend {
    /// The internal Redis client instance.
    client: Client,
    /// Multiplexed connection, present between `connect` and `disconnect`.
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisCacheBackend {
    /// Creates a new backend from a connection string. No I/O happens until `connect`.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub fn new(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, CacheError> {
        self.conn.read().await.clone().ok_or(CacheError::NotConnected)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Value of `field` in an `INFO` reply (`field:value` lines).
fn info_field<'a>(info: &'a str, field: &str) -> Option<&'a str> {
    info.lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
        .map(str::trim)
}

/// Sums `keys=` over every `dbN:keys=..,expires=..` line of `INFO keyspace`.
fn keyspace_keys(keyspace: &str) -> u64 {
    keyspace
        .lines()
        .filter(|line| line.starts_with("db"))
        .filter_map(|line| {
            let (_, stats) = line.split_once(':')?;
            stats
                .split(',')
                .find_map(|pair| pair.strip_prefix("keys="))
                .and_then(|n| n.trim().parse::<u64>().ok())
        })
        .sum()
}

fn parse_info(memory: &str, keyspace: &str, server: &str) -> BackendInfo {
    BackendInfo {
        memory_usage: info_field(memory, "used_memory_human").unwrap_or("unknown").to_string(),
        keys_count: keyspace_keys(keyspace),
        uptime_secs: info_field(server, "uptime_in_seconds")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn connect(&self) -> Result<(), CacheError> {
        let manager = self.client.get_connection_manager().await?;
        *self.conn.write().await = Some(manager);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CacheError> {
        // Dropping the last manager clone closes the socket.
        self.conn.write().await.take();
        Ok(())
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn mset(&self, pairs: Vec<(String, String)>) -> Result<(), CacheError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("MSET");
        for (key, value) in &pairs {
            cmd.arg(key).arg(value);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        let mut conn = self.conn().await?;
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn info(&self) -> Result<BackendInfo, CacheError> {
        let mut conn = self.conn().await?;
        let memory: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
        let keyspace: String = redis::cmd("INFO").arg("keyspace").query_async(&mut conn).await?;
        let server: String = redis::cmd("INFO").arg("server").query_async(&mut conn).await?;
        Ok(parse_info(&memory, &keyspace, &server))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheError::Backend(format!("unexpected PING reply: {}", pong)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_before_connect_report_not_connected() {
        let backend = RedisCacheBackend::new("redis://127.0.0.1:6399/").unwrap();
        assert!(matches!(backend.get("k").await, Err(CacheError::NotConnected)));
        assert!(matches!(backend.ping().await, Err(CacheError::NotConnected)));
    }

    #[test]
    fn invalid_urls_are_rejected_up_front() {
        assert!(RedisCacheBackend::new("not a url").is_err());
    }

    #[test]
    fn sub_millisecond_ttls_round_up() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
    }

    #[test]
    fn info_sections_are_parsed() {
        let memory = "# Memory\r\nused_memory:1103456\r\nused_memory_human:1.05M\r\nused_memory_rss:9000\r\n";
        let keyspace = "# Keyspace\r\ndb0:keys=12,expires=3,avg_ttl=0\r\ndb1:keys=5,expires=0,avg_ttl=0\r\n";
        let server = "# Server\r\nredis_version:7.2.4\r\nuptime_in_seconds:3600\r\n";

        let info = parse_info(memory, keyspace, server);
        assert_eq!(info.memory_usage, "1.05M");
        assert_eq!(info.keys_count, 17);
        assert_eq!(info.uptime_secs, 3600);

        let empty = parse_info("", "# Keyspace\r\n", "");
        assert_eq!(empty.memory_usage, "unknown");
        assert_eq!(empty.keys_count, 0);
    }
}
