//! Room event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::protocol::{ControlKind, MediaKind};
use crate::session::SessionState;
use crate::transport::TransportStrategy;

/// Room event (serializable for UI bridges)
///
/// Events are tagged with their type for easy parsing:
/// ```json
/// {
///   "event": "session.state_changed",
///   "data": { "participant": "user_1", "state": "active", "transport": "fast_path" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RoomEvent {
    /// Transport strategy chosen at startup, or switched after an early
    /// fast path failure
    #[serde(rename = "room.strategy_selected")]
    StrategySelected { strategy: TransportStrategy },

    #[serde(rename = "signaling.connected")]
    SignalingConnected,

    #[serde(rename = "signaling.disconnected")]
    SignalingDisconnected { reason: String },

    #[serde(rename = "room.joined")]
    RoomJoined { room_id: String, user_id: String },

    #[serde(rename = "room.left")]
    RoomLeft { room_id: String },

    #[serde(rename = "participant.joined")]
    ParticipantJoined {
        participant: String,
        display_name: Option<String>,
    },

    #[serde(rename = "participant.left")]
    ParticipantLeft { participant: String },

    /// Session moved through its lifecycle
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        participant: String,
        state: SessionState,
        transport: TransportStrategy,
    },

    /// Session failed terminally; it is closed right after this event
    #[serde(rename = "session.failed")]
    SessionFailed { participant: String, error: String },

    #[serde(rename = "session.ice_restart")]
    IceRestart { participant: String },

    /// Control datagram received from a remote participant
    #[serde(rename = "control.received")]
    RemoteControl {
        participant: String,
        kind: ControlKind,
        value: bool,
    },

    /// One media kind stopped working after a codec configuration failure
    #[serde(rename = "media.degraded")]
    MediaDegraded { kind: MediaKind, reason: String },
}

impl RoomEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StrategySelected { .. } => "room.strategy_selected",
            Self::SignalingConnected => "signaling.connected",
            Self::SignalingDisconnected { .. } => "signaling.disconnected",
            Self::RoomJoined { .. } => "room.joined",
            Self::RoomLeft { .. } => "room.left",
            Self::ParticipantJoined { .. } => "participant.joined",
            Self::ParticipantLeft { .. } => "participant.left",
            Self::SessionStateChanged { .. } => "session.state_changed",
            Self::SessionFailed { .. } => "session.failed",
            Self::IceRestart { .. } => "session.ice_restart",
            Self::RemoteControl { .. } => "control.received",
            Self::MediaDegraded { .. } => "media.degraded",
        }
    }

    /// Participant the event refers to, if any
    pub fn participant(&self) -> Option<&str> {
        match self {
            Self::ParticipantJoined { participant, .. }
            | Self::ParticipantLeft { participant }
            | Self::SessionStateChanged { participant, .. }
            | Self::SessionFailed { participant, .. }
            | Self::IceRestart { participant }
            | Self::RemoteControl { participant, .. } => Some(participant),
            _ => None,
        }
    }
}
