//! Signaling relay connection
//!
//! [`SignalingClient`] keeps one WebSocket to the relay alive; the
//! connection manager is its only writer, through [`SignalingLink`].

mod client;
mod messages;

pub use client::SignalingClient;
pub use messages::{IceCandidate, SignalingMessage};

use crate::error::Result;

/// Inbound side of the signaling connection
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Socket (re)established
    Connected,
    /// Socket lost; a reconnect is already scheduled
    Disconnected { reason: String },
    Message(SignalingMessage),
}

/// Outbound side of the signaling connection
pub trait SignalingLink: Send + Sync {
    /// Send a message to the relay
    ///
    /// Fails with `SignalingDisconnected` while there is no connection.
    fn send(&self, message: &SignalingMessage) -> Result<()>;

    fn is_connected(&self) -> bool;
}
