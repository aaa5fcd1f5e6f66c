//! # Publish/Subscribe Bus
//!
//! Channel-based fan-out between processes. A [`BusTransport`] moves raw
//! strings; [`PubSubBus`] adds JSON (de)serialization, the callback registry,
//! and the degrade-to-default error contract shared with the cache store.
//!
//! Each subscribed channel gets its own listener task reading a dedicated
//! stream from the transport, so a slow subscriber never holds up
//! `publish`, which always goes through the transport's publisher side.
//! A listener whose stream ends (the transport dropped the subscription)
//! removes itself, so the next `subscribe` on that channel listens afresh.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Failures raised by a [`BusTransport`]. They never escape [`PubSubBus`].
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus backend error: {0}")]
    Backend(String),
    #[error("bus backend is not connected")]
    NotConnected,
}

/// Raw payloads published on one channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Invoked once per message published on the channel it was registered for.
pub type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;

#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn connect(&self) -> Result<(), BusError>;
    async fn disconnect(&self) -> Result<(), BusError>;
    /// Broadcasts `payload` and returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: String) -> Result<u64, BusError>;
    /// Opens a stream of payloads published on exactly `channel`.
    /// The subscription is live once this returns.
    async fn listen(&self, channel: &str) -> Result<MessageStream, BusError>;
}

struct ChannelListener {
    /// Distinguishes a resubscribed listener from the one it replaced.
    id: u64,
    callbacks: Arc<RwLock<Vec<MessageCallback>>>,
    cancel: CancellationToken,
}

type ListenerMap = Arc<Mutex<HashMap<String, ChannelListener>>>;

/// The pub/sub service. Construct one per process and share it behind an `Arc`.
pub struct PubSubBus {
    transport: Arc<dyn BusTransport>,
    listeners: ListenerMap,
    next_listener_id: AtomicU64,
}

impl PubSubBus {
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self {
            transport,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub async fn init(&self) -> bool {
        match self.transport.connect().await {
            Ok(()) => {
                log::info!("Pub/sub bus connected");
                true
            }
            Err(e) => {
                log::error!("Pub/sub bus failed to connect: {}", e);
                false
            }
        }
    }

    /// Stops every listener task and closes the transport.
    pub async fn shutdown(&self) {
        let mut listeners = self.listeners.lock().await;
        for (_, listener) in listeners.drain() {
            listener.cancel.cancel();
        }
        drop(listeners);
        if let Err(e) = self.transport.disconnect().await {
            log::error!("Error disconnecting pub/sub bus: {}", e);
        }
    }

    /// Serializes `message` and broadcasts it. `true` if at least one subscriber got it.
    pub async fn publish<T: Serialize + ?Sized>(&self, channel: &str, message: &T) -> bool {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                log::error!("PUBLISH serialization error for channel {}: {}", channel, e);
                return false;
            }
        };
        match self.transport.publish(channel, payload).await {
            Ok(receivers) => receivers > 0,
            Err(e) => {
                log::error!("PUBLISH error for channel {}: {}", channel, e);
                false
            }
        }
    }

    /// Registers `callback` for messages on `channel`. Returns `false` if the
    /// transport could not open the subscription.
    pub async fn subscribe<F>(&self, channel: &str, callback: F) -> bool
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let callback: MessageCallback = Arc::new(callback);
        let mut listeners = self.listeners.lock().await;

        if let Some(listener) = listeners.get(channel) {
            // A cancelled listener has lost its stream and is about to remove itself.
            if !listener.cancel.is_cancelled() {
                listener.callbacks.write().await.push(callback);
                return true;
            }
            listeners.remove(channel);
        }

        let stream = match self.transport.listen(channel).await {
            Ok(s) => s,
            Err(e) => {
                log::error!("SUBSCRIBE error for channel {}: {}", channel, e);
                return false;
            }
        };

        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let callbacks = Arc::new(RwLock::new(vec![callback]));
        let cancel = CancellationToken::new();
        tokio::spawn(run_listener(
            id,
            channel.to_string(),
            stream,
            Arc::clone(&callbacks),
            cancel.clone(),
            Arc::clone(&self.listeners),
        ));
        listeners.insert(channel.to_string(), ChannelListener { id, callbacks, cancel });
        log::debug!("Subscribed to bus channel {}", channel);
        true
    }

    /// Removes every callback registered for `channel` and closes its stream.
    pub async fn unsubscribe(&self, channel: &str) {
        if let Some(listener) = self.listeners.lock().await.remove(channel) {
            listener.cancel.cancel();
            log::debug!("Unsubscribed from bus channel {}", channel);
        }
    }

    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.listeners.lock().await.keys().cloned().collect()
    }
}

async fn run_listener(
    id: u64,
    channel: String,
    mut stream: MessageStream,
    callbacks: Arc<RwLock<Vec<MessageCallback>>>,
    cancel: CancellationToken,
    listeners: ListenerMap,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => {
                let Some(raw) = next else {
                    log::warn!("Bus stream for channel {} ended", channel);
                    cancel.cancel();
                    let mut listeners = listeners.lock().await;
                    if listeners.get(&channel).is_some_and(|l| l.id == id) {
                        listeners.remove(&channel);
                    }
                    break;
                };
                match serde_json::from_str::<Value>(&raw) {
                    Ok(message) => {
                        for callback in callbacks.read().await.iter() {
                            callback(message.clone());
                        }
                    }
                    Err(e) => log::error!("Error parsing pub/sub message on {}: {}", channel, e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::pubsub_memory::MemoryBusTransport;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn bus() -> (PubSubBus, Arc<MemoryBusTransport>) {
        let transport = Arc::new(MemoryBusTransport::new(64));
        (PubSubBus::new(transport.clone()), transport)
    }

    fn collector() -> (impl Fn(Value) + Send + Sync + 'static, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (move |v| { let _ = tx.send(v); }, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Option<Value> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn messages_stay_on_their_channel() {
        let (bus, _) = bus();
        let (on_a, mut rx_a) = collector();
        let (on_b, mut rx_b) = collector();
        assert!(bus.subscribe("A", on_a).await);
        assert!(bus.subscribe("B", on_b).await);

        assert!(bus.publish("A", &json!({"score": 1})).await);
        assert_eq!(recv(&mut rx_a).await, Some(json!({"score": 1})));
        assert_eq!(recv(&mut rx_b).await, None);
    }

    #[tokio::test]
    async fn every_callback_on_a_channel_is_invoked() {
        let (bus, _) = bus();
        let (first, mut rx1) = collector();
        let (second, mut rx2) = collector();
        bus.subscribe("scores", first).await;
        bus.subscribe("scores", second).await;

        assert!(bus.publish("scores", &json!("goal")).await);
        assert_eq!(recv(&mut rx1).await, Some(json!("goal")));
        assert_eq!(recv(&mut rx2).await, Some(json!("goal")));
    }

    #[tokio::test]
    async fn publish_without_subscribers_reports_false() {
        let (bus, _) = bus();
        assert!(!bus.publish("empty", &json!(1)).await);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (bus, _) = bus();
        let (cb, mut rx) = collector();
        bus.subscribe("games", cb).await;
        bus.unsubscribe("games").await;
        assert!(bus.subscribed_channels().await.is_empty());

        // The listener task drops its receiver once cancelled.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!bus.publish("games", &json!(1)).await);
        assert_eq!(recv(&mut rx).await, None);
    }

    #[tokio::test]
    async fn resubscribe_after_stream_end_delivers_again() {
        let (bus, transport) = bus();
        let (stale, _stale_rx) = collector();
        assert!(bus.subscribe("A", stale).await);

        // Dropping every topic ends the listener's stream.
        transport.disconnect().await.unwrap();
        for _ in 0..100 {
            if bus.subscribed_channels().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(bus.subscribed_channels().await.is_empty());

        let (cb, mut rx) = collector();
        assert!(bus.subscribe("A", cb).await);
        assert!(bus.publish("A", &json!(1)).await);
        assert_eq!(recv(&mut rx).await, Some(json!(1)));
    }

    #[tokio::test]
    async fn malformed_payloads_are_skipped() {
        let (bus, transport) = bus();
        let (cb, mut rx) = collector();
        bus.subscribe("raw", cb).await;

        transport.publish("raw", "{broken".to_string()).await.unwrap();
        transport.publish("raw", "2".to_string()).await.unwrap();
        assert_eq!(recv(&mut rx).await, Some(json!(2)));
    }
}
