//! Channel multiplexer: many WebSocket connections onto one broker
//! subscription per channel.
//!
//! The [`ChannelRegistry`] maps each channel with at least one registered
//! connection to exactly one [`ChannelMultiplexer`]. The multiplexer owns the
//! channel's broker subscription and fans every delivered payload out to the
//! connections registered at delivery time.
//!
//! ## Consistency
//!
//! - Instance creation goes through the `DashMap` entry API, so concurrent
//!   first registrations on a channel all land on the same instance.
//! - Each instance has an async lifecycle lock. `register` and `unregister`
//!   hold it across the broker round-trip (subscribe / unsubscribe), which
//!   serializes them per channel and makes the subscribe single-flight.
//! - The last `unregister` marks the instance closed and removes it from the
//!   map while holding that lock. A `register` that looked the instance up
//!   before removal sees `closed` and retries against a fresh instance.
//! - Fan-out sends while iterating the member map, so a member removed by a
//!   completed `unregister` is never sent to again.

use crate::error::{RelayError, Result};
use axum::extract::ws::{Message, Utf8Bytes};
use broker_client::{Broker, MessageHandler, Subscription};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// The part of a connection the multiplexer sees: identity, channel and the
/// sending end of its outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Channel the connection belongs to.
    pub channel: String,
    /// Outbound queue drained by the connection's socket writer.
    pub tx: mpsc::Sender<Message>,
    /// Timestamp (ms) when the connection was accepted.
    pub connected_at: i64,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(channel: impl Into<String>, buffer_size: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        let handle = Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            tx,
            connected_at: Utc::now().timestamp_millis(),
        };
        (handle, rx)
    }

    /// Queue a message for the socket without waiting.
    /// Fails if the queue is full (slow client) or the writer is gone.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.tx.try_send(msg).map_err(RelayError::from)
    }
}

enum SubscriptionState {
    /// No subscribe attempted yet.
    Pending,
    Live(Subscription),
    /// Subscribe failed or the subscription was closed.
    Inactive,
}

struct Lifecycle {
    subscription: SubscriptionState,
    closed: bool,
}

/// One channel's broker subscription and live member set.
pub struct ChannelMultiplexer {
    channel: String,
    members: Arc<DashMap<ConnectionId, ConnectionHandle>>,
    lifecycle: Mutex<Lifecycle>,
}

impl ChannelMultiplexer {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            members: Arc::new(DashMap::new()),
            lifecycle: Mutex::new(Lifecycle {
                subscription: SubscriptionState::Pending,
                closed: false,
            }),
        }
    }

    /// Channel served by this multiplexer.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Number of registered connections.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Delivery callback handed to the broker.
    fn delivery_handler(&self) -> MessageHandler {
        let members = self.members.clone();
        let channel = self.channel.clone();
        Arc::new(move |payload| {
            fan_out(&channel, &members, payload);
        })
    }
}

/// Forward one payload to every member; returns the number of successful sends.
///
/// UTF-8 payloads go out as text frames, anything else as binary.
fn fan_out(channel: &str, members: &DashMap<ConnectionId, ConnectionHandle>, payload: Bytes) -> usize {
    let text = match std::str::from_utf8(&payload) {
        Ok(text) => Some(Utf8Bytes::from(text)),
        Err(_) => {
            debug!("Non-UTF-8 payload on '{}', relaying as binary", channel);
            None
        }
    };

    let mut delivered = 0;
    for member in members.iter() {
        let msg = match &text {
            Some(text) => Message::Text(text.clone()),
            None => Message::Binary(payload.clone()),
        };

        match member.send(msg) {
            Ok(()) => delivered += 1,
            Err(e) => {
                debug!(
                    "Failed to deliver to connection {} on '{}': {}",
                    member.id, channel, e
                );
                counter!("relay_fanout_drops_total").increment(1);
            }
        }
    }

    counter!("relay_fanout_deliveries_total").increment(delivered as u64);
    delivered
}

/// Process-wide registry: channel → multiplexer.
///
/// Built once at startup and shared by reference with every connection.
pub struct ChannelRegistry {
    broker: Arc<dyn Broker>,
    channels: DashMap<String, Arc<ChannelMultiplexer>>,
}

impl ChannelRegistry {
    /// Create an empty registry over a broker.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            channels: DashMap::new(),
        }
    }

    /// Add a connection to its channel's multiplexer, creating the
    /// multiplexer (and its broker subscription) if needed.
    ///
    /// Idempotent. Broker failures are logged; the connection is registered
    /// either way.
    pub async fn register(&self, conn: &ConnectionHandle) {
        loop {
            let mux = self
                .channels
                .entry(conn.channel.clone())
                .or_insert_with(|| Arc::new(ChannelMultiplexer::new(&conn.channel)))
                .clone();

            let mut lifecycle = mux.lifecycle.lock().await;
            if lifecycle.closed {
                // Torn down between lookup and lock; the map no longer holds it.
                continue;
            }

            if matches!(lifecycle.subscription, SubscriptionState::Pending) {
                lifecycle.subscription = self.open_subscription(&mux).await;
            }

            if mux.members.insert(conn.id, conn.clone()).is_none() {
                debug!(
                    "Connection {} registered on '{}' ({} members)",
                    conn.id,
                    mux.channel,
                    mux.members.len()
                );
            }
            return;
        }
    }

    async fn open_subscription(&self, mux: &ChannelMultiplexer) -> SubscriptionState {
        match self
            .broker
            .subscribe(&mux.channel, mux.delivery_handler())
            .await
        {
            Ok(subscription) => {
                info!("Channel '{}' opened", mux.channel);
                gauge!("relay_active_channels").set(self.channels.len() as f64);
                SubscriptionState::Live(subscription)
            }
            Err(e) => {
                warn!("Failed to subscribe to '{}': {}", mux.channel, e);
                counter!("relay_broker_errors_total").increment(1);
                SubscriptionState::Inactive
            }
        }
    }

    /// Remove a connection from whichever multiplexer holds it.
    ///
    /// Idempotent; unknown connections and channels are ignored. Removing the
    /// last member closes the broker subscription and drops the channel.
    pub async fn unregister(&self, conn: &ConnectionHandle) {
        let mux = match self.channels.get(&conn.channel) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(
                    "Unregister of connection {} on unknown channel '{}' ignored",
                    conn.id, conn.channel
                );
                return;
            }
        };

        let mut lifecycle = mux.lifecycle.lock().await;
        if lifecycle.closed || mux.members.remove(&conn.id).is_none() {
            return;
        }
        debug!("Connection {} unregistered from '{}'", conn.id, mux.channel);

        if !mux.members.is_empty() {
            return;
        }

        lifecycle.closed = true;
        self.channels
            .remove_if(&mux.channel, |_, current| Arc::ptr_eq(current, &mux));
        gauge!("relay_active_channels").set(self.channels.len() as f64);

        let state = std::mem::replace(&mut lifecycle.subscription, SubscriptionState::Inactive);
        if let SubscriptionState::Live(subscription) = state {
            if let Err(e) = self.broker.unsubscribe(subscription).await {
                warn!("Failed to unsubscribe from '{}': {}", mux.channel, e);
                counter!("relay_broker_errors_total").increment(1);
            }
        }
        info!("Channel '{}' closed", mux.channel);
    }

    /// Number of channels with at least one registered connection.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether a multiplexer exists for `channel`.
    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Number of connections registered on `channel`.
    pub fn member_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|mux| mux.member_count())
            .unwrap_or(0)
    }

    /// Total registered connections across all channels.
    pub fn connection_count(&self) -> usize {
        self.channels.iter().map(|mux| mux.member_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_client::{BrokerError, MemoryBroker};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry() -> (Arc<MemoryBroker>, ChannelRegistry) {
        let broker = Arc::new(MemoryBroker::new());
        let registry = ChannelRegistry::new(broker.clone());
        (broker, registry)
    }

    async fn recv_text(rx: &mut mpsc::Receiver<Message>) -> Option<String> {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Message::Text(text))) => Some(text.as_str().to_string()),
            _ => None,
        }
    }

    async fn assert_silent(rx: &mut mpsc::Receiver<Message>) {
        let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err(), "unexpected delivery: {:?}", result);
    }

    /// Memory broker whose subscribe takes a while, to widen the window in
    /// which concurrent registrations overlap.
    struct SlowBroker {
        inner: MemoryBroker,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Broker for SlowBroker {
        async fn publish(&self, channel: &str, payload: Bytes) -> broker_client::Result<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(
            &self,
            channel: &str,
            on_message: MessageHandler,
        ) -> broker_client::Result<Subscription> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.subscribe(channel, on_message).await
        }

        async fn unsubscribe(&self, subscription: Subscription) -> broker_client::Result<()> {
            self.inner.unsubscribe(subscription).await
        }
    }

    #[tokio::test]
    async fn test_fan_out_stays_within_channel() {
        let (broker, registry) = registry();
        let (a, mut rx_a) = ConnectionHandle::new("/room1", 16);
        let (b, mut rx_b) = ConnectionHandle::new("/room1", 16);
        let (c, mut rx_c) = ConnectionHandle::new("/room2", 16);

        registry.register(&a).await;
        registry.register(&b).await;
        registry.register(&c).await;

        broker
            .publish("/room1", Bytes::from_static(b"hello room1"))
            .await
            .unwrap();

        assert_eq!(recv_text(&mut rx_a).await.as_deref(), Some("hello room1"));
        assert_eq!(recv_text(&mut rx_b).await.as_deref(), Some("hello room1"));
        assert_silent(&mut rx_c).await;
    }

    #[tokio::test]
    async fn test_one_subscription_per_channel() {
        let (broker, registry) = registry();
        let (a, _rx_a) = ConnectionHandle::new("/room1", 16);
        let (b, _rx_b) = ConnectionHandle::new("/room1", 16);

        registry.register(&a).await;
        registry.register(&b).await;

        assert_eq!(broker.subscribe_count(), 1);
        assert_eq!(registry.channel_count(), 1);
        assert_eq!(registry.member_count("/room1"), 2);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (broker, registry) = registry();
        let (a, mut rx_a) = ConnectionHandle::new("/room1", 16);

        registry.register(&a).await;
        registry.register(&a).await;

        assert_eq!(broker.subscribe_count(), 1);
        assert_eq!(registry.member_count("/room1"), 1);

        broker.publish("/room1", Bytes::from_static(b"once")).await.unwrap();
        assert_eq!(recv_text(&mut rx_a).await.as_deref(), Some("once"));
        assert_silent(&mut rx_a).await;
    }

    #[tokio::test]
    async fn test_teardown_on_last_unregister() {
        let (broker, registry) = registry();
        let (a, _rx_a) = ConnectionHandle::new("/fresh", 16);

        registry.register(&a).await;
        assert!(registry.contains("/fresh"));

        registry.unregister(&a).await;

        assert_eq!(broker.subscribe_count(), 1);
        assert_eq!(broker.unsubscribe_count(), 1);
        assert!(!registry.contains("/fresh"));
        assert_eq!(registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_kept_while_members_remain() {
        let (broker, registry) = registry();
        let (a, _rx_a) = ConnectionHandle::new("/room1", 16);
        let (b, mut rx_b) = ConnectionHandle::new("/room1", 16);

        registry.register(&a).await;
        registry.register(&b).await;
        registry.unregister(&a).await;

        assert_eq!(broker.unsubscribe_count(), 0);
        assert!(registry.contains("/room1"));

        broker.publish("/room1", Bytes::from_static(b"still here")).await.unwrap();
        assert_eq!(recv_text(&mut rx_b).await.as_deref(), Some("still here"));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let (broker, registry) = registry();
        let (a, _rx_a) = ConnectionHandle::new("/room1", 16);
        let (never, _rx_never) = ConnectionHandle::new("/room1", 16);
        let (elsewhere, _rx_elsewhere) = ConnectionHandle::new("/unknown", 16);

        // Never registered, channel unknown.
        registry.unregister(&elsewhere).await;
        registry.unregister(&never).await;

        registry.register(&a).await;
        // Never registered, channel known.
        registry.unregister(&never).await;
        assert_eq!(registry.member_count("/room1"), 1);

        registry.unregister(&a).await;
        registry.unregister(&a).await;

        assert_eq!(broker.subscribe_count(), 1);
        assert_eq!(broker.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_no_delivery_after_unregister() {
        let (broker, registry) = registry();
        let (a, mut rx_a) = ConnectionHandle::new("/room1", 16);
        let (b, mut rx_b) = ConnectionHandle::new("/room1", 16);

        registry.register(&a).await;
        registry.register(&b).await;
        registry.unregister(&a).await;

        broker.publish("/room1", Bytes::from_static(b"after")).await.unwrap();

        assert_eq!(recv_text(&mut rx_b).await.as_deref(), Some("after"));
        assert_silent(&mut rx_a).await;
    }

    #[tokio::test]
    async fn test_reopen_after_teardown() {
        let (broker, registry) = registry();
        let (a, _rx_a) = ConnectionHandle::new("/room1", 16);
        let (b, mut rx_b) = ConnectionHandle::new("/room1", 16);

        registry.register(&a).await;
        registry.unregister(&a).await;
        registry.register(&b).await;

        assert_eq!(broker.subscribe_count(), 2);
        assert_eq!(broker.active_subscriptions(), 1);

        broker.publish("/room1", Bytes::from_static(b"again")).await.unwrap();
        assert_eq!(recv_text(&mut rx_b).await.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_failed_send_does_not_block_others() {
        let (broker, registry) = registry();
        let (full, mut rx_full) = ConnectionHandle::new("/room1", 1);
        let (gone, rx_gone) = ConnectionHandle::new("/room1", 16);
        let (ok, mut rx_ok) = ConnectionHandle::new("/room1", 16);

        registry.register(&full).await;
        registry.register(&gone).await;
        registry.register(&ok).await;

        full.send(Message::Text("filler".into())).unwrap();
        drop(rx_gone);

        broker.publish("/room1", Bytes::from_static(b"news")).await.unwrap();

        assert_eq!(recv_text(&mut rx_ok).await.as_deref(), Some("news"));
        assert_eq!(recv_text(&mut rx_full).await.as_deref(), Some("filler"));
        assert_silent(&mut rx_full).await;
    }

    #[tokio::test]
    async fn test_binary_payload_relayed_as_binary() {
        let (broker, registry) = registry();
        let (a, mut rx_a) = ConnectionHandle::new("/room1", 16);
        registry.register(&a).await;

        broker
            .publish("/room1", Bytes::from_static(&[0xff, 0xfe]))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            Message::Binary(data) => assert_eq!(data.to_vec(), vec![0xffu8, 0xfe]),
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_failure_still_registers() {
        let (broker, registry) = registry();
        broker.set_failing(true);
        let (a, _rx_a) = ConnectionHandle::new("/room1", 16);

        registry.register(&a).await;
        assert!(registry.contains("/room1"));
        assert_eq!(broker.subscribe_count(), 0);

        // No retry on later registrations for the same instance.
        broker.set_failing(false);
        let (b, _rx_b) = ConnectionHandle::new("/room1", 16);
        registry.register(&b).await;
        assert_eq!(broker.subscribe_count(), 0);

        registry.unregister(&a).await;
        registry.unregister(&b).await;
        assert_eq!(broker.unsubscribe_count(), 0);
        assert!(!registry.contains("/room1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_subscribe() {
        let broker = Arc::new(SlowBroker {
            inner: MemoryBroker::new(),
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ChannelRegistry::new(broker.clone()));

        let mut receivers = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let (handle, rx) = ConnectionHandle::new("/brand-new", 16);
            receivers.push(rx);
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register(&handle).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.inner.subscribe_count(), 1);
        assert_eq!(registry.member_count("/brand-new"), 16);

        broker
            .publish("/brand-new", Bytes::from_static(b"all"))
            .await
            .unwrap();
        for rx in receivers.iter_mut() {
            assert_eq!(recv_text(rx).await.as_deref(), Some("all"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscriptions_track_channels_under_churn() {
        let broker = Arc::new(SlowBroker {
            inner: MemoryBroker::new(),
            delay: Duration::from_millis(1),
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ChannelRegistry::new(broker.clone()));

        let mut tasks = Vec::new();
        for i in 0..64u64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                // Pseudo-random channel and hold pattern per task.
                let seed = i.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let channel = format!("/room{}", seed % 5);
                let (handle, _rx) = ConnectionHandle::new(channel, 16);

                for round in 0..(1 + seed % 4) {
                    registry.register(&handle).await;
                    tokio::time::sleep(Duration::from_millis((seed >> 8) % 3 + round)).await;
                    registry.unregister(&handle).await;
                }

                // Every third task stays connected.
                if i % 3 == 0 {
                    registry.register(&handle).await;
                    Some(handle)
                } else {
                    None
                }
            }));
        }

        let mut survivors = Vec::new();
        for task in tasks {
            if let Some(handle) = task.await.unwrap() {
                survivors.push(handle);
            }
        }

        let mut live_channels: Vec<&str> = survivors.iter().map(|h| h.channel.as_str()).collect();
        live_channels.sort();
        live_channels.dedup();

        assert_eq!(registry.channel_count(), live_channels.len());
        assert_eq!(broker.inner.active_subscriptions(), live_channels.len());
        assert_eq!(registry.connection_count(), survivors.len());

        for handle in &survivors {
            registry.unregister(handle).await;
        }
        assert_eq!(registry.channel_count(), 0);
        assert_eq!(broker.inner.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_failure_still_drops_channel() {
        struct FailingUnsubscribe(MemoryBroker);

        #[async_trait]
        impl Broker for FailingUnsubscribe {
            async fn publish(&self, channel: &str, payload: Bytes) -> broker_client::Result<()> {
                self.0.publish(channel, payload).await
            }

            async fn subscribe(
                &self,
                channel: &str,
                on_message: MessageHandler,
            ) -> broker_client::Result<Subscription> {
                self.0.subscribe(channel, on_message).await
            }

            async fn unsubscribe(&self, subscription: Subscription) -> broker_client::Result<()> {
                drop(subscription);
                Err(BrokerError::Unavailable("down".to_string()))
            }
        }

        let registry = ChannelRegistry::new(Arc::new(FailingUnsubscribe(MemoryBroker::new())));
        let (a, _rx_a) = ConnectionHandle::new("/room1", 16);

        registry.register(&a).await;
        registry.unregister(&a).await;
        assert!(!registry.contains("/room1"));
    }
}
