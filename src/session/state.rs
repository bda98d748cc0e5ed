//! Session and room lifecycle states

use serde::{Deserialize, Serialize};

/// Per-participant session state
///
/// `Idle -> Negotiating -> Active -> Closing -> Closed`, with
/// `Negotiating -> Closing` on failure and `Idle -> Closing` when a session
/// is torn down before negotiation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Negotiating,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Negotiating)
                | (Idle, Closing)
                | (Negotiating, Active)
                | (Negotiating, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    /// Only active sessions carry media
    pub fn accepts_media(self) -> bool {
        self == SessionState::Active
    }

    /// Closing or closed
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Room membership state of the local participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Disconnected,
    JoiningSignal,
    InRoom,
}

impl RoomState {
    pub fn can_transition_to(self, next: RoomState) -> bool {
        use RoomState::*;
        matches!(
            (self, next),
            (Disconnected, JoiningSignal)
                | (JoiningSignal, InRoom)
                | (JoiningSignal, Disconnected)
                | (InRoom, Disconnected)
        )
    }
}

impl std::fmt::Display for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomState::Disconnected => write!(f, "disconnected"),
            RoomState::JoiningSignal => write!(f, "joining_signal"),
            RoomState::InRoom => write!(f, "in_room"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 5] = [
        SessionState::Idle,
        SessionState::Negotiating,
        SessionState::Active,
        SessionState::Closing,
        SessionState::Closed,
    ];

    #[test]
    fn test_allowed_transitions() {
        let allowed: Vec<(SessionState, SessionState)> = ALL
            .iter()
            .flat_map(|&from| ALL.iter().map(move |&to| (from, to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(allowed.len(), 6);
        assert!(SessionState::Idle.can_transition_to(SessionState::Negotiating));
        assert!(SessionState::Negotiating.can_transition_to(SessionState::Closing));
        assert!(!SessionState::Idle.can_transition_to(SessionState::Active));
        assert!(!SessionState::Closed.can_transition_to(SessionState::Idle));
        assert!(!SessionState::Active.can_transition_to(SessionState::Negotiating));
    }

    #[test]
    fn test_only_active_accepts_media() {
        for state in ALL {
            assert_eq!(state.accepts_media(), state == SessionState::Active);
        }
    }

    #[test]
    fn test_room_transitions() {
        assert!(RoomState::Disconnected.can_transition_to(RoomState::JoiningSignal));
        assert!(RoomState::InRoom.can_transition_to(RoomState::Disconnected));
        assert!(!RoomState::Disconnected.can_transition_to(RoomState::InRoom));
    }
}
