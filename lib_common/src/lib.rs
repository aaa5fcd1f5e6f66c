//! # lib_common
//!
//! Building blocks for a live sports update pipeline. Each folder sits behind
//! a cargo feature of the same name. Nothing is enabled by default; `full`
//! turns on every folder.

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "utils")]
pub mod utils;

#[cfg(feature = "configs")]
pub use configs::{RealtimeConfig, RealtimeConfigPatch};
#[cfg(feature = "utils")]
pub use utils::misc::utils::*;
