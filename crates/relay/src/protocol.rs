//! Wire formats: client control tokens and broker payloads.

use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Relay
// ============================================================================

/// Text payload that asks for a `pong` to be published on the channel.
pub const PING: &str = "ping";

/// Text payload that asks the relay to close the socket.
pub const CLOSE: &str = "close";

/// Reserved text payload interpreted as a command instead of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    Ping,
    Close,
}

impl ControlToken {
    /// Match a text frame against the control tokens (exact, case-sensitive).
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            PING => Some(Self::Ping),
            CLOSE => Some(Self::Close),
            _ => None,
        }
    }
}

// ============================================================================
// Relay → Broker
// ============================================================================

/// Payload published in answer to a `ping`.
pub fn pong_payload(sequence: u64) -> String {
    format!("pong {}", sequence)
}

/// Structured event published on a channel.
///
/// Serialized as `{"t": <kind>, "d": <data>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "camelCase")]
pub enum BrokerEvent {
    /// A participant joined or left the room.
    RosterActivity(RosterActivity),
}

/// Roster change for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterActivity {
    pub ref_id: String,
    pub status: RosterStatus,
}

/// Roster status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RosterStatus {
    Joined,
}

impl BrokerEvent {
    /// Roster event announcing that `ref_id` joined.
    pub fn joined(ref_id: impl Into<String>) -> Self {
        Self::RosterActivity(RosterActivity {
            ref_id: ref_id.into(),
            status: RosterStatus::Joined,
        })
    }
}
