//! WebSocket [`Connector`] over `tokio-tungstenite`.
//!
//! `open()` only validates the URL and spawns a pump task; the handshake runs
//! inside the pump so the session loop never blocks on the network. A failed
//! handshake surfaces as `Error` followed by `Closed { code: 1006 }`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message as WsMessage,
    },
};

use crate::core::transport::{
    Connector, OutboundFrame, TransportError, TransportEvent, TransportLink, ABNORMAL_CLOSURE,
};

/// Close code reported when the server's close frame carried none.
const NO_STATUS_RECEIVED: u16 = 1005;

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(request, out_rx, ev_tx));
        Ok(TransportLink { outbound: out_tx, events: ev_rx })
    }
}

async fn pump(
    request: Request,
    mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    ev_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    log::info!("Connecting to {}", request.uri());
    let ws_stream = match connect_async(request).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            log::error!("WebSocket handshake failed: {}", e);
            let _ = ev_tx.send(TransportEvent::Error(e.to_string()));
            let _ = ev_tx.send(TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
            });
            return;
        }
    };
    let _ = ev_tx.send(TransportEvent::Open);
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    log::trace!("Sending upstream: {}", text);
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        log::error!("Failed to send frame: {}", e);
                        let _ = ev_tx.send(TransportEvent::Error(e.to_string()));
                        let _ = ev_tx.send(TransportEvent::Closed { code: ABNORMAL_CLOSURE, reason: String::new() });
                        return;
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    log::debug!("Closing upstream with code {}: {}", code, reason);
                    let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
                    let _ = write.send(WsMessage::Close(Some(frame))).await;
                    return;
                }
                // Session dropped the link.
                None => {
                    let _ = write.close().await;
                    return;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if ev_tx.send(TransportEvent::Message(text.as_str().to_string())).is_err() {
                        let _ = write.close().await;
                        return;
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        let _ = ev_tx.send(TransportEvent::Message(text));
                    }
                    Err(_) => log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    let _ = ev_tx.send(TransportEvent::Closed { code, reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("Upstream error: {}", e);
                    let _ = ev_tx.send(TransportEvent::Error(e.to_string()));
                    let _ = ev_tx.send(TransportEvent::Closed { code: ABNORMAL_CLOSURE, reason: String::new() });
                    return;
                }
                None => {
                    let _ = ev_tx.send(TransportEvent::Closed { code: ABNORMAL_CLOSURE, reason: String::new() });
                    return;
                }
            },
        }
    }
}
