//! NATS core publish/subscribe backend.

use crate::client::{Broker, MessageHandler, Subscription};
use crate::error::{BrokerError, Result};
use crate::subject::validate_literal_subject;
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

/// NATS-backed broker.
#[derive(Clone)]
pub struct NatsBroker {
    client: Client,
}

impl NatsBroker {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Nats(e.into()))?;
        info!("Connected to NATS");

        Ok(Self { client })
    }
}

fn literal_subject(channel: &str) -> Result<String> {
    match validate_literal_subject(channel) {
        Some(reason) => Err(BrokerError::InvalidChannel {
            channel: channel.to_string(),
            reason,
        }),
        None => Ok(channel.to_string()),
    }
}

#[async_trait]
impl Broker for NatsBroker {
    /// Publish using NATS core (fire-and-forget).
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let subject = literal_subject(channel)?;
        let len = payload.len();
        self.client
            .publish(subject, payload)
            .await
            .map_err(|e| BrokerError::Nats(e.into()))?;
        debug!("Published {} bytes to '{}'", len, channel);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, on_message: MessageHandler) -> Result<Subscription> {
        let subject = literal_subject(channel)?;
        let mut subscriber = self.client.subscribe(subject).await?;
        // Round-trip so the server has the SUB before we report it live.
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Nats(e.into()))?;
        info!("Subscribed to NATS subject '{}'", channel);

        let name = channel.to_string();
        Ok(Subscription::spawn(channel, move |mut shutdown| async move {
            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown => break,

                    msg = subscriber.next() => match msg {
                        Some(msg) => on_message(msg.payload),
                        None => {
                            warn!("NATS subscription for '{}' ended unexpectedly", name);
                            break;
                        }
                    }
                }
            }

            subscriber
                .unsubscribe()
                .await
                .map_err(|e| BrokerError::Nats(e.into()))?;
            info!("Unsubscribed from NATS subject '{}'", name);
            Ok(())
        }))
    }
}
