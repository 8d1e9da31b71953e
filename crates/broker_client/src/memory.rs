//! In-process broker for single-node runs and tests.
//!
//! Each channel is a `tokio::sync::broadcast` channel. The broker also keeps
//! counters of subscribe/unsubscribe calls and a log of every publish, which
//! tests use to check subscription bookkeeping.

use crate::client::{Broker, MessageHandler, Subscription};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default buffer size for per-channel broadcast queues.
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1024;

/// In-memory pub/sub broker.
pub struct MemoryBroker {
    /// Channel → broadcast sender.
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    buffer_size: usize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    published: Mutex<Vec<(String, Bytes)>>,
    failing: AtomicBool,
}

impl MemoryBroker {
    /// Create a broker with the default per-channel buffer.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_CHANNEL_BUFFER_SIZE)
    }

    /// Create a broker with a custom per-channel buffer.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            channels: DashMap::new(),
            buffer_size,
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent publish and subscribe fail (simulated outage).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful subscribe calls.
    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Number of unsubscribe calls.
    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Subscriptions opened and not yet closed.
    pub fn active_subscriptions(&self) -> usize {
        self.subscribe_count() - self.unsubscribe_count()
    }

    /// Every successful publish so far, in call order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Text payloads published to one channel, in call order.
    pub fn published_to(&self, channel: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| String::from_utf8_lossy(&payload).into_owned())
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker set to fail".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.check_available()?;

        if let Ok(mut log) = self.published.lock() {
            log.push((channel.to_string(), payload.clone()));
        }

        if let Some(tx) = self.channels.get(channel) {
            // No receivers is fine: nobody is listening on this channel.
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, on_message: MessageHandler) -> Result<Subscription> {
        self.check_available()?;

        let mut rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .subscribe();
        self.subscribes.fetch_add(1, Ordering::SeqCst);

        let name = channel.to_string();
        Ok(Subscription::spawn(channel, move |mut shutdown| async move {
            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown => break,

                    msg = rx.recv() => match msg {
                        Ok(payload) => on_message(payload),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Subscription on '{}' lagged, skipped {} messages", name, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            Ok(())
        }))
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        let channel = subscription.channel().to_string();
        let result = subscription.close().await;

        self.channels
            .remove_if(&channel, |_, tx| tx.receiver_count() == 0);
        debug!("Memory subscription on '{}' closed", channel);
        result
    }
}
