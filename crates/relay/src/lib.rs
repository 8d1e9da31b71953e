//! WebSocket relay: browser connections grouped into rooms, each room backed
//! by a single broker subscription.
//!
//! This service:
//! - Accepts WebSocket upgrades on any path; the path names the channel
//! - Reads an (unverified) session token from a cookie
//! - Shares one broker subscription among all connections on a channel
//! - Answers `ping` by publishing `pong <n>` through the broker
//! - Announces learners on the channel's roster when they connect
//!
//! ## Architecture
//!
//! ```text
//! Broker (Redis / NATS / memory)
//!         ↓  one subscription per channel
//! ChannelMultiplexer (fan-out over a DashMap of members)
//!         ↓  bounded per-connection queues
//! Connection (socket reader + writer task)
//!         ↓
//! WebSocket clients
//! ```
//!
//! The [`ChannelRegistry`] is created once at startup and shared through
//! [`AppState`]; nothing is process-global.

pub mod config;
pub mod connection;
pub mod error;
pub mod multiplexer;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::RelayConfig;
pub use connection::{Connection, ConnectionState, PingCounter};
pub use error::{RelayError, Result};
pub use multiplexer::{ChannelMultiplexer, ChannelRegistry, ConnectionHandle, ConnectionId};
pub use protocol::{BrokerEvent, ControlToken, RosterActivity, RosterStatus};
pub use server::{create_router, AppState};
pub use session::{Role, Session};
