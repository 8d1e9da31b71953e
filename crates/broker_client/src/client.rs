//! The broker contract and the subscription handle shared by all backends.

use crate::error::{BrokerError, Result};
use crate::memory::MemoryBroker;
use crate::nats_broker::NatsBroker;
use crate::redis_broker::RedisBroker;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Callback invoked for every payload delivered on a subscribed channel.
///
/// Called from the subscription's delivery task, in broker delivery order.
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Pub/sub operations the relay needs from a message broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish a payload to a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Open a subscription on a channel.
    ///
    /// Returns once the subscription is live on the broker; from then on
    /// `on_message` is called for every payload published to `channel`
    /// until the subscription is closed with [`Broker::unsubscribe`].
    async fn subscribe(&self, channel: &str, on_message: MessageHandler) -> Result<Subscription>;

    /// Close a subscription opened by [`Broker::subscribe`].
    async fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        subscription.close().await
    }
}

/// Handle to a live broker subscription.
///
/// Owns the delivery task. Dropping the handle without calling
/// [`Broker::unsubscribe`] still stops delivery, but the backend teardown
/// result is lost.
pub struct Subscription {
    id: u64,
    channel: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl Subscription {
    /// Spawn the delivery task for a subscription.
    ///
    /// `run` receives the shutdown signal and must return once it fires (or
    /// once the broker stream ends), after releasing the backend subscription.
    pub fn spawn<F, Fut>(channel: &str, run: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(run(shutdown_rx));
        debug!("Subscription {} opened on '{}'", id, channel);

        Self {
            id,
            channel: channel.to_string(),
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Unique id of this subscription within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Channel this subscription delivers from.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stop delivery and wait for the backend teardown to finish.
    pub async fn close(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            // The task may already be gone if the broker stream ended.
            let _ = shutdown.send(());
        }

        let result = match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| BrokerError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        };

        debug!("Subscription {} closed on '{}'", self.id, self.channel);
        result
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Connect to the broker named by `url`, choosing the backend by scheme.
pub async fn connect(url: &str) -> Result<Arc<dyn Broker>> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme);

    match scheme {
        Some("redis") | Some("rediss") => {
            let broker = RedisBroker::connect(url).await?;
            Ok(Arc::new(broker))
        }
        Some("nats") | Some("tls") => {
            let broker = NatsBroker::connect(url).await?;
            Ok(Arc::new(broker))
        }
        Some("memory") => {
            info!("Using in-process memory broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        _ => Err(BrokerError::UnsupportedUrl(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_close_signals_and_joins_task() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let subscription = Subscription::spawn("/room", move |shutdown| async move {
            let _ = shutdown.await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(subscription.channel(), "/room");
        subscription.close().await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_returns_teardown_error() {
        let subscription = Subscription::spawn("/room", |shutdown| async move {
            let _ = shutdown.await;
            Err(BrokerError::Unavailable("gone".to_string()))
        });

        let result = subscription.close().await;
        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_subscription_ids_are_unique() {
        let a = Subscription::spawn("/a", |shutdown| async move {
            let _ = shutdown.await;
            Ok(())
        });
        let b = Subscription::spawn("/a", |shutdown| async move {
            let _ = shutdown.await;
            Ok(())
        });

        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let result = connect("kafka://localhost:9092").await;
        assert!(matches!(result, Err(BrokerError::UnsupportedUrl(_))));

        let result = connect("localhost:6379").await;
        assert!(matches!(result, Err(BrokerError::UnsupportedUrl(_))));
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let broker = connect("memory://").await.unwrap();
        broker.publish("/room", Bytes::from_static(b"hi")).await.unwrap();
    }
}
