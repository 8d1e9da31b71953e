//! Publish/subscribe broker boundary for the room relay.
//!
//! The relay only needs three things from a broker: publish a payload to a
//! named channel, open a subscription that calls back for every payload on
//! that channel, and close that subscription again. [`Broker`] captures that
//! contract; the backends below implement it.
//!
//! ## Backends
//!
//! | URL scheme            | Backend          |
//! |-----------------------|------------------|
//! | `redis://`, `rediss://` | [`RedisBroker`]  |
//! | `nats://`, `tls://`   | [`NatsBroker`]   |
//! | `memory://`           | [`MemoryBroker`] |

pub mod client;
pub mod error;
pub mod memory;
pub mod nats_broker;
pub mod redis_broker;
pub mod subject;

pub use client::{connect, Broker, MessageHandler, Subscription};
pub use error::{BrokerError, Result};
pub use memory::MemoryBroker;
pub use nats_broker::NatsBroker;
pub use redis_broker::RedisBroker;
