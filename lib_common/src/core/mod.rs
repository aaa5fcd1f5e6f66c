//! # Core Pipeline Module
//!
//! The client side of the live update pipeline: everything between an
//! upstream WebSocket feed and the handlers, history ring and analytics sink
//! that consume its updates.
//!
//! ## Core Components:
//!
//! - **`model`**: the JSON control envelope, [`RealTimeUpdate`] and the active
//!   [`Scope`].
//!
//! - **`transport`** / **`ws_transport`**: the [`Connector`] seam and its
//!   `tokio-tungstenite` implementation.
//!
//! - **`connection`**: the connection lifecycle state machine with heartbeat
//!   latency tracking and the fixed-delay reconnect policy.
//!
//! - **`dispatcher`**: batching, stable priority ordering, grouping by update
//!   type and the bounded recent-updates ring.
//!
//! - **`registry`**: the per-connection channel set and its filter payloads.
//!
//! - **`session`**: the single-task event loop tying the above together, and
//!   the [`SessionHandle`] used to drive it.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Connection lifecycle state machine.
pub mod connection;
/// Batching and prioritizing update dispatcher.
pub mod dispatcher;
/// Wire envelope and update model.
pub mod model;
/// Active channel subscriptions.
pub mod registry;
/// The per-connection event loop.
pub mod session;
/// Transport abstraction.
pub mod transport;
/// WebSocket connector.
pub mod ws_transport;

// --- Public API Re-exports ---
pub use connection::{
    CloseDecision, ConnectionManager, ConnectionSnapshot, ConnectionState, StateChange,
    ThroughputMeter,
};
pub use dispatcher::{
    AnalyticsBatch, AnalyticsSink, ChannelSink, Intake, SharedUpdate, UpdateDispatcher, UpdateHandler,
};
pub use model::{ControlMessage, MessageType, RealTimeUpdate, Scope, UpdateKind, UpdateScope};
pub use registry::SubscriptionRegistry;
pub use session::{LiveSession, ScopeProvider, SessionError, SessionHandle, SessionStats};
pub use transport::{
    ChannelConnector, Connector, OutboundFrame, PeerLink, TransportError, TransportEvent,
    TransportLink,
};
pub use ws_transport::WsConnector;
