//! Signaling messages exchanged through the relay
//!
//! JSON objects tagged by `type`, with camelCase fields:
//!
//! ```json
//! { "type": "request-transport", "roomId": "r1", "userId": "user_a", "targetUserId": "user_b" }
//! ```

use serde::{Deserialize, Serialize};

/// ICE candidate as produced by the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Signaling message
///
/// `user_id` is always the participant the message is about: the sender for
/// client messages, the joining/leaving/remote participant for relay
/// messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Announce ourselves in a room
    JoinRoom {
        room_id: String,
        user_id: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        supports_fast_path: bool,
    },
    /// Another participant joined
    UserJoined {
        user_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// A participant left
    UserLeft { user_id: String },
    /// Ask the relay for a fast path endpoint shared with `target_user_id`
    RequestTransport {
        room_id: String,
        user_id: String,
        target_user_id: String,
    },
    /// Fast path endpoint for the session with `user_id`
    TransportInfo {
        user_id: String,
        transport_endpoint: String,
    },
    Offer {
        room_id: String,
        user_id: String,
        target_user_id: String,
        sdp: String,
        #[serde(default)]
        ice_restart: bool,
    },
    Answer {
        room_id: String,
        user_id: String,
        target_user_id: String,
        sdp: String,
    },
    IceCandidate {
        room_id: String,
        user_id: String,
        target_user_id: String,
        candidate: IceCandidate,
    },
    LeaveRoom { room_id: String, user_id: String },
}

impl SignalingMessage {
    /// Wire name of the message type
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::RequestTransport { .. } => "request-transport",
            Self::TransportInfo { .. } => "transport-info",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::LeaveRoom { .. } => "leave-room",
        }
    }

    /// Participant the message originates from or refers to
    pub fn user_id(&self) -> &str {
        match self {
            Self::JoinRoom { user_id, .. }
            | Self::UserJoined { user_id, .. }
            | Self::UserLeft { user_id }
            | Self::RequestTransport { user_id, .. }
            | Self::TransportInfo { user_id, .. }
            | Self::Offer { user_id, .. }
            | Self::Answer { user_id, .. }
            | Self::IceCandidate { user_id, .. }
            | Self::LeaveRoom { user_id, .. } => user_id,
        }
    }

    /// Recipient of a point-to-point message
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::RequestTransport { target_user_id, .. }
            | Self::Offer { target_user_id, .. }
            | Self::Answer { target_user_id, .. }
            | Self::IceCandidate { target_user_id, .. } => Some(target_user_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
