//! Redis PUBLISH/SUBSCRIBE backend.
//!
//! Publishes share one multiplexed connection. Each subscription gets its own
//! pub/sub connection, since a Redis connection in subscribe mode cannot run
//! other commands.

use crate::client::{Broker, MessageHandler, Subscription};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Redis-backed broker.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
}

impl RedisBroker {
    /// Connect to a Redis server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", url);
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis");

        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, &payload[..]).await?;
        debug!("Published {} bytes to '{}'", payload.len(), channel);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, on_message: MessageHandler) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!("Subscribed to Redis channel '{}'", channel);

        let name = channel.to_string();
        Ok(Subscription::spawn(channel, move |mut shutdown| async move {
            {
                let messages = pubsub.on_message();
                tokio::pin!(messages);

                loop {
                    tokio::select! {
                        biased;

                        _ = &mut shutdown => break,

                        msg = messages.next() => match msg {
                            Some(msg) => {
                                on_message(Bytes::copy_from_slice(msg.get_payload_bytes()));
                            }
                            None => {
                                warn!("Redis subscription for '{}' ended unexpectedly", name);
                                break;
                            }
                        }
                    }
                }
            }

            pubsub.unsubscribe(&name).await?;
            info!("Unsubscribed from Redis channel '{}'", name);
            Ok(())
        }))
    }
}
