//! # Configuration Modules
//!
//! Options for the realtime pipeline. The server binary layers its own
//! file/env/CLI loading on top of these types.

/// Realtime connection, heartbeat and batching options.
pub mod config_realtime;

pub use config_realtime::{ConfigError, OverflowPolicy, RealtimeConfig, RealtimeConfigPatch};
