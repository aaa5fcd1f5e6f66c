use anyhow::{bail, Context, Result};
use clap::Parser;
use lib_common::configs::{OverflowPolicy, RealtimeConfig, RealtimeConfigPatch};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Live sports update relay: WebSocket feed to Redis cache and pub/sub", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "LIVE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LIVE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LIVE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LIVE_WS_URL", help = "Upstream WebSocket feed URL.")]
    pub ws_url: Option<String>,

    #[clap(long, env = "LIVE_REDIS_URL", help = "Redis URL for cache and pub/sub. In-process backends when unset.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "LIVE_SPORT", help = "Initially active sport.")]
    pub sport: Option<String>,

    #[clap(long, env = "LIVE_CHANNELS", value_delimiter = ',', help = "Channels to subscribe to, comma separated.")]
    pub channels: Option<Vec<String>>,

    #[clap(long, env = "LIVE_STATS_INTERVAL_SECONDS", help = "Seconds between session stats log lines.")]
    pub stats_interval_seconds: Option<u64>,

    // --- Realtime pipeline ---
    #[clap(long, env = "LIVE_AUTO_RECONNECT", help = "Reconnect after unclean closes.")]
    pub auto_reconnect: Option<bool>,

    #[clap(long, env = "LIVE_RECONNECT_INTERVAL_MS", help = "Fixed delay before each reconnect attempt.")]
    pub reconnect_interval: Option<u64>,

    #[clap(long, env = "LIVE_MAX_RECONNECT_ATTEMPTS", help = "Reconnect attempts before giving up.")]
    pub max_reconnect_attempts: Option<u32>,

    #[clap(long, env = "LIVE_HEARTBEAT_INTERVAL_MS", help = "Milliseconds between pings.")]
    pub heartbeat_interval: Option<u64>,

    #[clap(long, env = "LIVE_BUFFER_SIZE", help = "Recent updates kept in memory.")]
    pub buffer_size: Option<usize>,

    #[clap(long, env = "LIVE_BATCH_UPDATES", help = "Batch updates before dispatching.")]
    pub batch_updates: Option<bool>,

    #[clap(long, env = "LIVE_BATCH_SIZE", help = "Queue length that triggers a flush.")]
    pub batch_size: Option<usize>,

    #[clap(long, env = "LIVE_BATCH_INTERVAL_MS", help = "Milliseconds between timed flushes.")]
    pub batch_interval: Option<u64>,

    #[clap(long, env = "LIVE_PRIORITIZE_UPDATES", help = "Order each batch by update priority.")]
    pub prioritize_updates: Option<bool>,

    #[clap(long, env = "LIVE_COMPRESSION", help = "Ask the feed for compressed frames.")]
    pub compression_enabled: Option<bool>,

    #[clap(long, env = "LIVE_DEBUG_MODE", help = "Log every outbound frame at info level.")]
    pub debug_mode: Option<bool>,

    #[clap(long, env = "LIVE_FEATURES", value_delimiter = ',', help = "Feature flags sent on authenticate.")]
    pub features: Option<Vec<String>>,

    #[clap(long, env = "LIVE_MAX_PENDING_UPDATES", help = "Cap on queued updates between flushes.")]
    pub max_pending_updates: Option<usize>,

    #[clap(long, env = "LIVE_OVERFLOW_POLICY", help = "dropOldest or reject, when the queue cap is hit.")]
    pub overflow_policy: Option<String>,

    #[clap(long, env = "LIVE_PING_TIMEOUT_FACTOR", help = "Heartbeat intervals before an unanswered ping is fatal.")]
    pub ping_timeout_factor: Option<u32>,
}

/// Fully resolved startup settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub log_level: String,
    pub ws_url: String,
    pub redis_url: Option<String>,
    pub sport: String,
    pub channels: Vec<String>,
    pub stats_interval_seconds: u64,
    pub realtime: RealtimeConfig,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            ws_url: other.ws_url.or(self.ws_url),
            redis_url: other.redis_url.or(self.redis_url),
            sport: other.sport.or(self.sport),
            channels: other.channels.or(self.channels),
            stats_interval_seconds: other.stats_interval_seconds.or(self.stats_interval_seconds),
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

    fn realtime_patch(&self) -> Result<RealtimeConfigPatch> {
        let overflow_policy = match self.overflow_policy.as_deref() {
            None => None,
            Some("dropOldest") | Some("drop_oldest") => Some(OverflowPolicy::DropOldest),
            Some("reject") => Some(OverflowPolicy::Reject),
            Some(other) => bail!("unknown overflow policy '{}' (expected dropOldest or reject)", other),
        };
        Ok(RealtimeConfigPatch {
            auto_reconnect: self.auto_reconnect,
            reconnect_interval: self.reconnect_interval,
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: self.heartbeat_interval,
            buffer_size: self.buffer_size,
            batch_updates: self.batch_updates,
            batch_size: self.batch_size,
            batch_interval: self.batch_interval,
            prioritize_updates: self.prioritize_updates,
            compression_enabled: self.compression_enabled,
            debug_mode: self.debug_mode,
            features: self.features.clone(),
            max_pending_updates: self.max_pending_updates.map(Some),
            overflow_policy,
            ping_timeout_factor: self.ping_timeout_factor,
        })
    }

    fn into_settings(self) -> Result<Settings> {
        let realtime = RealtimeConfig::default().merge(self.realtime_patch()?);
        realtime.validate().context("invalid realtime configuration")?;

        let stats_interval_seconds = self.stats_interval_seconds.unwrap_or(60);
        if stats_interval_seconds == 0 {
            bail!("stats_interval_seconds must be greater than zero");
        }

        Ok(Settings {
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            ws_url: self.ws_url.context("no upstream feed configured (ws_url)")?,
            redis_url: self.redis_url,
            sport: self.sport.unwrap_or_else(|| "NFL".to_string()),
            channels: self.channels.unwrap_or_else(|| realtime.features.clone()),
            stats_interval_seconds,
            realtime,
        })
    }
}

fn defaults() -> Config {
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ws_url: Some("ws://localhost:3001/live".to_string()),
        sport: Some("NFL".to_string()),
        stats_interval_seconds: Some(60),
        ..Default::default()
    }
}

/// Defaults, then the JSON config file, then env/CLI.
pub fn load_config() -> Result<Settings> {
    load_config_from(Config::parse())
}

pub fn load_config_from(cli: Config) -> Result<Settings> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_live.conf"));

    let mut current_config = defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => log::warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => log::warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config.merge(cli).into_settings()
}
