//! # Transport Seam
//!
//! The session loop never touches a socket directly. It asks a [`Connector`]
//! for a [`TransportLink`]: an outbound frame sender plus a stream of
//! [`TransportEvent`]s in the same order a browser-style socket would report
//! them (`Open`, any number of `Message`s and `Error`s, then one `Closed`).
//!
//! [`crate::core::ws_transport::WsConnector`] implements this over
//! `tokio-tungstenite`. [`ChannelConnector`] hands the far end of each link to
//! an in-process peer, which is how feeds are bridged without a socket.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Close code for an intentional shutdown. The only code treated as clean.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the peer vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code the client uses when the heartbeat detects a dead link.
pub const LIVENESS_FAILURE: u16 = 4000;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Connect(String),
    #[error("transport is closed")]
    Closed,
}

/// What the transport reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Closed { code: u16, reason: String },
}

/// What the session asks the transport to write.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// The session's end of one connection attempt.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    pub fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// The peer's end of a [`TransportLink`].
#[derive(Debug)]
pub struct PeerLink {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl PeerLink {
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Creates a connected link/peer pair.
pub fn link_pair() -> (TransportLink, PeerLink) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    (
        TransportLink { outbound: out_tx, events: ev_rx },
        PeerLink { events: ev_tx, outbound: out_rx },
    )
}

/// Opens one transport per call. Returning `Err` means the open itself
/// failed; handshake failures are reported as events on the link.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<TransportLink, TransportError>;
}

/// In-process connector. Every `open()` produces a fresh link and hands the
/// peer end to whoever holds the receiver returned by [`ChannelConnector::new`].
pub struct ChannelConnector {
    peers: mpsc::UnboundedSender<PeerLink>,
    refuse: Mutex<Option<String>>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerLink>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers, refuse: Mutex::new(None) }, rx)
    }

    /// Makes every later `open()` fail with `reason`; `None` clears it.
    pub async fn refuse_with(&self, reason: Option<String>) {
        *self.refuse.lock().await = reason;
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        if let Some(reason) = self.refuse.lock().await.clone() {
            return Err(TransportError::Connect(reason));
        }
        let (link, peer) = link_pair();
        self.peers.send(peer).map_err(|_| TransportError::Connect("no peer listening".into()))?;
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_connector_hands_out_peers() {
        let (connector, mut peers) = ChannelConnector::new();
        let mut link = connector.open().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        assert!(peer.emit(TransportEvent::Open));
        assert_eq!(link.events.recv().await, Some(TransportEvent::Open));

        link.send(OutboundFrame::Text("hi".into())).unwrap();
        assert_eq!(peer.outbound.recv().await, Some(OutboundFrame::Text("hi".into())));
    }

    #[tokio::test]
    async fn refused_open_returns_error() {
        let (connector, _peers) = ChannelConnector::new();
        connector.refuse_with(Some("dns failure".into())).await;
        let err = connector.open().await.unwrap_err();
        assert!(err.to_string().contains("dns failure"));
    }

    #[tokio::test]
    async fn dropped_peer_closes_outbound() {
        let (link, peer) = link_pair();
        drop(peer);
        assert!(matches!(link.send(OutboundFrame::Text("x".into())), Err(TransportError::Closed)));
    }
}
