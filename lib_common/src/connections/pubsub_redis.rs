//! # Redis Pub/Sub Transport
//!
//! Publishing goes through a multiplexed `ConnectionManager`; every
//! subscribed channel opens its own dedicated pub/sub connection, so a
//! blocked subscriber never stalls publish throughput.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use super::pubsub_bus::{BusError, BusTransport, MessageStream};

impl From<RedisError> for BusError {
    fn from(e: RedisError) -> Self {
        BusError::Backend(e.to_string())
    }
}

pub struct RedisBusTransport {
    client: Client,
    publisher: RwLock<Option<ConnectionManager>>,
}

impl RedisBusTransport {
    /// Creates a new transport from a connection string. No I/O happens until `connect`.
    pub fn new(url: &str) -> RedisResult<Self> {
        Ok(Self {
            client: Client::open(url)?,
            publisher: RwLock::new(None),
        })
    }
}

#[async_trait]
impl BusTransport for RedisBusTransport {
    async fn connect(&self) -> Result<(), BusError> {
        let manager = self.client.get_connection_manager().await?;
        *self.publisher.write().await = Some(manager);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.publisher.write().await.take();
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<u64, BusError> {
        let mut conn = self
            .publisher
            .read()
            .await
            .clone()
            .ok_or(BusError::NotConnected)?;
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn listen(&self, channel: &str) -> Result<MessageStream, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(p) => Some(p),
                Err(e) => {
                    log::error!("Undecodable payload on channel {}: {}", channel, e);
                    None
                }
            };
            async move { payload }
        });
        Ok(Box::pin(stream))
    }
}
