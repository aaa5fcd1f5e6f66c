//! In-process [`BusTransport`] built on one `tokio::sync::broadcast` channel per topic.
//! A topic is dropped once its last listener stream is gone.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};

use super::pubsub_bus::{BusError, BusTransport, MessageStream};

pub struct MemoryBusTransport {
    /// Topic → broadcast sender.
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    /// Buffer size for each topic; lagging listeners skip what they missed.
    buffer_size: usize,
}

impl MemoryBusTransport {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Number of topics that still have a sender registered.
    pub async fn topic_count(&self) -> usize {
        self.topics.lock().await.len()
    }
}

#[async_trait]
impl BusTransport for MemoryBusTransport {
    async fn connect(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.topics.lock().await.clear();
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<u64, BusError> {
        let mut topics = self.topics.lock().await;
        let Some(tx) = topics.get(channel) else {
            return Ok(0);
        };
        if tx.receiver_count() == 0 {
            topics.remove(channel);
            return Ok(0);
        }
        // send() fails only when there are no receivers
        Ok(tx.send(payload).map_or(0, |n| n as u64))
    }

    async fn listen(&self, channel: &str) -> Result<MessageStream, BusError> {
        let mut topics = self.topics.lock().await;
        topics.retain(|_, tx| tx.receiver_count() > 0);
        let rx = topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .subscribe();

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Memory bus listener lagged, skipped {} messages", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn topics_without_listeners_are_pruned() {
        let transport = MemoryBusTransport::new(8);
        let mut scores = transport.listen("scores").await.unwrap();
        let games = transport.listen("games").await.unwrap();
        assert_eq!(transport.topic_count().await, 2);

        assert_eq!(transport.publish("scores", "1".into()).await.unwrap(), 1);
        assert_eq!(scores.next().await, Some("1".to_string()));

        drop(games);
        assert_eq!(transport.publish("games", "2".into()).await.unwrap(), 0);
        assert_eq!(transport.topic_count().await, 1);

        drop(scores);
        let _odds = transport.listen("odds").await.unwrap();
        assert_eq!(transport.topic_count().await, 1);
    }
}
