//! Per-participant session record

mod state;

pub use state::{RoomState, SessionState};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::transport::{TransportSession, TransportStrategy};

/// Which side drives negotiation for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent `request-transport` or the first offer
    Initiator,
    /// Answered the remote side
    Responder,
}

/// Media state last announced by the remote participant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteMediaState {
    pub muted: bool,
    pub video_off: bool,
    pub connected: bool,
}

/// One remote participant as tracked by the connection manager
pub struct Session {
    pub participant: String,
    /// Tags events from the current transport handle
    pub session_id: u64,
    pub display_name: Option<String>,
    pub transport: TransportStrategy,
    pub role: Role,
    pub remote: RemoteMediaState,
    pub created_at: DateTime<Utc>,
    state: SessionState,
    handle: Option<Arc<dyn TransportSession>>,
}

impl Session {
    pub fn new(participant: impl Into<String>, transport: TransportStrategy, role: Role) -> Self {
        Self {
            participant: participant.into(),
            session_id: 0,
            display_name: None,
            transport,
            role,
            remote: RemoteMediaState::default(),
            created_at: Utc::now(),
            state: SessionState::Idle,
            handle: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "session {}: {} -> {} not allowed",
                self.participant, self.state, next
            )));
        }
        debug!("Session {} {} -> {}", self.participant, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn handle(&self) -> Option<&Arc<dyn TransportSession>> {
        self.handle.as_ref()
    }

    pub fn set_handle(&mut self, handle: Arc<dyn TransportSession>) {
        self.handle = Some(handle);
    }

    pub fn take_handle(&mut self) -> Option<Arc<dyn TransportSession>> {
        self.handle.take()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            participant: self.participant.clone(),
            display_name: self.display_name.clone(),
            state: self.state,
            transport: self.transport,
            remote: self.remote,
            age_secs: (Utc::now() - self.created_at).num_seconds().max(0) as u64,
        }
    }
}

/// Snapshot of a session for listings
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub participant: String,
    pub display_name: Option<String>,
    pub state: SessionState,
    pub transport: TransportStrategy,
    pub remote: RemoteMediaState,
    pub age_secs: u64,
}
