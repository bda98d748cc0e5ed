//! Fallback session over a peer connection
//!
//! SDP and ICE travel through the relay: the session reports what it wants
//! sent as [`SessionEventKind::Outbound`] and the manager forwards it.
//!
//! Remote candidates that arrive before the remote description are held
//! back and applied in arrival order once the description is set.
//!
//! ICE watchdog: when `checking` outlasts the configured timeout the
//! initiator issues one ICE restart offer and the responder waits one more
//! period for it. A second timeout fails the session with
//! `NegotiationTimeout`.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{SessionEventKind, SessionEventSender, TransportSession, TransportStrategy};
use crate::error::{AppError, Result};
use crate::media::MediaPipeline;
use crate::protocol::{ControlSignal, EncodedChunk, MediaKind};
use crate::session::Role;
use crate::signaling::{IceCandidate, SignalingMessage};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for IceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceState::New => write!(f, "new"),
            IceState::Checking => write!(f, "checking"),
            IceState::Connected => write!(f, "connected"),
            IceState::Completed => write!(f, "completed"),
            IceState::Disconnected => write!(f, "disconnected"),
            IceState::Failed => write!(f, "failed"),
            IceState::Closed => write!(f, "closed"),
        }
    }
}

/// Event raised by a peer link
#[derive(Debug)]
pub enum PeerEvent {
    IceState(IceState),
    /// Locally gathered candidate to forward to the remote side
    LocalCandidate(IceCandidate),
    /// One encoded chunk reassembled from a remote track
    RemoteChunk { kind: MediaKind, chunk: EncodedChunk },
    /// Message on the control data channel
    ControlData(Bytes),
}

/// Peer connection operations the fallback session relies on
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create and apply a local offer, returning its SDP
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Apply a remote offer, create and apply the answer, returning its SDP
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    async fn apply_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn write_chunk(&self, kind: MediaKind, chunk: &EncodedChunk) -> Result<()>;

    async fn send_control(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer links for remote participants
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, participant: &str) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<PeerEvent>)>;
}

/// Who we are in the room, for addressing outbound messages
#[derive(Debug, Clone)]
pub struct Addressing {
    pub room_id: String,
    pub local_id: String,
}

#[derive(Default)]
struct Negotiation {
    remote_description: bool,
    pending: Vec<IceCandidate>,
}

struct Inner {
    participant: String,
    role: Role,
    addressing: Addressing,
    link: Arc<dyn PeerLink>,
    events: SessionEventSender,
    pipeline: Arc<MediaPipeline>,
    negotiation: Mutex<Negotiation>,
    checking_timeout: Duration,
    throttler: LogThrottler,
}

impl Inner {
    fn offer(&self, sdp: String, ice_restart: bool) -> SignalingMessage {
        SignalingMessage::Offer {
            room_id: self.addressing.room_id.clone(),
            user_id: self.addressing.local_id.clone(),
            target_user_id: self.participant.clone(),
            sdp,
            ice_restart,
        }
    }

    async fn restart_ice(&self) -> Result<()> {
        let sdp = self.link.create_offer(true).await?;
        info!("Issuing ICE restart offer to {}", self.participant);
        self.events.emit(SessionEventKind::Outbound(self.offer(sdp, true)));
        self.events.emit(SessionEventKind::IceRestart);
        Ok(())
    }

    /// Mark the remote description as applied and flush held candidates
    async fn flush_candidates(&self, negotiation: &mut Negotiation) {
        negotiation.remote_description = true;
        let pending = std::mem::take(&mut negotiation.pending);
        if !pending.is_empty() {
            debug!("Applying {} buffered candidates from {}", pending.len(), self.participant);
        }
        for candidate in pending {
            if let Err(e) = self.link.add_ice_candidate(candidate).await {
                warn!("Failed to apply buffered candidate from {}: {}", self.participant, e);
            }
        }
    }
}

/// Fallback session with one remote participant
pub struct FallbackSession {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    closed: AtomicBool,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl FallbackSession {
    /// Wrap a peer link and start its event loop
    pub fn start(
        link: Arc<dyn PeerLink>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        role: Role,
        addressing: Addressing,
        pipeline: Arc<MediaPipeline>,
        events: SessionEventSender,
        checking_timeout: Duration,
    ) -> Arc<Self> {
        let inner = Arc::new(Inner {
            participant: events.participant().to_string(),
            role,
            addressing,
            link,
            events,
            pipeline,
            negotiation: Mutex::new(Negotiation::default()),
            checking_timeout,
            throttler: LogThrottler::with_secs(5),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(event_loop(inner.clone(), peer_events, cancel.clone()));

        debug!("Fallback session started for {} as {:?}", inner.participant, role);
        Arc::new(Self {
            inner,
            cancel,
            closed: AtomicBool::new(false),
            tasks: SyncMutex::new(vec![task]),
        })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send the initial offer
    pub async fn initiate(&self) -> Result<()> {
        let sdp = self.inner.link.create_offer(false).await?;
        self.inner
            .events
            .emit(SessionEventKind::Outbound(self.inner.offer(sdp, false)));
        Ok(())
    }

    /// Apply a remote offer (initial or restart) and send our answer
    pub async fn accept_offer(&self, sdp: &str) -> Result<()> {
        let mut negotiation = self.inner.negotiation.lock().await;
        let answer = self.inner.link.accept_offer(sdp).await?;
        self.inner.flush_candidates(&mut negotiation).await;
        drop(negotiation);

        self.inner.events.emit(SessionEventKind::Outbound(SignalingMessage::Answer {
            room_id: self.inner.addressing.room_id.clone(),
            user_id: self.inner.addressing.local_id.clone(),
            target_user_id: self.inner.participant.clone(),
            sdp: answer,
        }));
        Ok(())
    }

    pub async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let mut negotiation = self.inner.negotiation.lock().await;
        self.inner.link.apply_answer(sdp).await?;
        self.inner.flush_candidates(&mut negotiation).await;
        Ok(())
    }

    /// Apply a remote candidate, or hold it until the remote description is set
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut negotiation = self.inner.negotiation.lock().await;
        if !negotiation.remote_description {
            trace!("Buffering early candidate from {}", self.inner.participant);
            negotiation.pending.push(candidate);
            return Ok(());
        }
        self.inner.link.add_ice_candidate(candidate).await
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidates(&self) -> usize {
        self.inner.negotiation.lock().await.pending.len()
    }
}

#[async_trait]
impl TransportSession for FallbackSession {
    fn kind(&self) -> TransportStrategy {
        TransportStrategy::Fallback
    }

    fn participant(&self) -> &str {
        &self.inner.participant
    }

    async fn send_chunk(&self, kind: MediaKind, chunk: &EncodedChunk) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::InvalidState(format!(
                "peer connection to {} is closed",
                self.inner.participant
            )));
        }
        let result = self.inner.link.write_chunk(kind, chunk).await;
        if let Err(e) = &result {
            warn_throttled!(
                self.inner.throttler,
                "write_chunk",
                "Failed to write {} chunk to {}: {}",
                kind,
                self.inner.participant,
                e
            );
        }
        result
    }

    async fn send_control(&self, signal: ControlSignal) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::InvalidState(format!(
                "peer connection to {} is closed",
                self.inner.participant
            )));
        }
        self.inner
            .link
            .send_control(Bytes::copy_from_slice(&signal.to_bytes()))
            .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.inner.link.close().await {
            debug!("Peer close for {} reported: {}", self.inner.participant, e);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Fallback session closed for {}", self.inner.participant);
    }

    fn into_fallback(self: Arc<Self>) -> Option<Arc<FallbackSession>> {
        Some(self)
    }
}

async fn event_loop(inner: Arc<Inner>, mut peer_events: mpsc::UnboundedReceiver<PeerEvent>, cancel: CancellationToken) {
    let participant = inner.participant.clone();
    let mut deadline: Option<Instant> = None;
    let mut timeouts = 0u32;
    let mut connected = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until(deadline), if deadline.is_some() => {
                timeouts += 1;
                if timeouts == 1 {
                    warn!(
                        "ICE for {} still checking after {:?}",
                        participant, inner.checking_timeout
                    );
                    if inner.role == Role::Initiator {
                        if let Err(e) = inner.restart_ice().await {
                            warn!("ICE restart for {} failed: {}", participant, e);
                        }
                    }
                    deadline = Some(Instant::now() + inner.checking_timeout);
                } else {
                    deadline = None;
                    inner.events.emit(SessionEventKind::Failed(AppError::NegotiationTimeout(format!(
                        "ICE checking with {} did not complete after restart",
                        participant
                    ))));
                }
                continue;
            }
            event = peer_events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            PeerEvent::IceState(state) => {
                debug!("ICE state for {}: {}", participant, state);
                match state {
                    IceState::New => {}
                    IceState::Checking => {
                        // the deadline keeps running across the restart offer
                        if deadline.is_none() && !connected && timeouts < 2 {
                            deadline = Some(Instant::now() + inner.checking_timeout);
                        }
                    }
                    IceState::Connected | IceState::Completed => {
                        deadline = None;
                        if !connected {
                            connected = true;
                            inner.events.emit(SessionEventKind::Connected);
                        }
                    }
                    IceState::Disconnected | IceState::Failed | IceState::Closed => {
                        deadline = None;
                        inner.events.emit(SessionEventKind::Disconnected {
                            reason: format!("ICE {}", state),
                        });
                    }
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                inner.events.emit(SessionEventKind::Outbound(SignalingMessage::IceCandidate {
                    room_id: inner.addressing.room_id.clone(),
                    user_id: inner.addressing.local_id.clone(),
                    target_user_id: participant.clone(),
                    candidate,
                }));
            }
            PeerEvent::RemoteChunk { kind, chunk } => {
                if let Err(e) = inner.pipeline.decode_remote(&participant, kind, chunk).await {
                    debug!("Decode of {} chunk from {} failed: {}", kind, participant, e);
                }
            }
            PeerEvent::ControlData(data) => match ControlSignal::parse(&data) {
                Ok(signal) => inner.events.emit(SessionEventKind::Control(signal)),
                Err(e) => {
                    warn_throttled!(inner.throttler, "control", "Bad control message from {}: {}", participant, e);
                }
            },
        }
    }
    debug!("Peer event loop for {} stopped", participant);
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
