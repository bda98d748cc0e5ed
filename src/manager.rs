//! Connection manager
//!
//! # Architecture
//!
//! ```text
//! SignalingClient --SignalingEvent--> ConnectionManager::run
//!                                          |
//!            +-----------------------------+---------------------------+
//!            |                             |                           |
//!     Session registry            FastPathSession / FallbackSession   MediaPipeline
//!  (one per participant)              (TransportSession)            (per-participant sinks)
//!            ^                             |
//!            +-------- SessionEvent -------+
//! ```
//!
//! The transport strategy is chosen once at construction. The only change
//! afterwards is a single switch from fast path to fallback when fast path
//! establishment fails before any session ever became active.
//!
//! All signaling and session events are handled on the task running
//! [`ConnectionManager::run`]; the public send/toggle methods only read the
//! registry.

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, RoomEvent};
use crate::media::{MediaPipeline, RawFrame};
use crate::protocol::{ControlKind, ControlSignal, EncodedChunk, MediaKind};
use crate::session::{Role, RoomState, Session, SessionInfo, SessionState};
use crate::signaling::{IceCandidate, SignalingEvent, SignalingLink, SignalingMessage};
use crate::transport::fallback::Addressing;
use crate::transport::{
    determine_strategy, FallbackSession, FastPathSession, MuxConnector, PeerFactory, PlatformCapabilities,
    SessionEvent, SessionEventKind, SessionEventSender, TransportSession, TransportStrategy,
};

/// Remote candidates kept per participant before its session exists
const MAX_EARLY_CANDIDATES: usize = 64;

/// Transport backends available to the manager
#[derive(Clone, Default)]
pub struct Transports {
    /// QUIC (or in-memory) connector for the fast path
    pub connector: Option<Arc<dyn MuxConnector>>,
    /// Peer connection factory for the fallback path
    pub peers: Option<Arc<dyn PeerFactory>>,
}

struct RoomContext {
    state: RoomState,
    room_id: Option<String>,
}

/// Local media state announced to remote participants
#[derive(Debug, Clone, Copy, Default)]
struct LocalMedia {
    muted: bool,
    video_off: bool,
}

/// Room and session orchestrator
pub struct ConnectionManager {
    config: AppConfig,
    local_id: String,
    display_name: String,
    strategy: ArcSwap<TransportStrategy>,
    fallback_available: bool,
    /// Set once any session reached Active; disables the fallback switch
    ever_active: AtomicBool,
    signaling: Arc<dyn SignalingLink>,
    transports: Transports,
    pipeline: Arc<MediaPipeline>,
    events: EventBus,
    room: RwLock<RoomContext>,
    sessions: Mutex<HashMap<String, Session>>,
    early_candidates: Mutex<HashMap<String, Vec<IceCandidate>>>,
    local: Mutex<LocalMedia>,
    next_session_id: AtomicU64,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Pick the transport strategy and build the manager
    ///
    /// A backend missing from `transports` counts as an unavailable
    /// capability. Fails with `UnsupportedPlatform` when neither transport
    /// is usable; no sessions can exist in that case.
    pub fn new(
        config: AppConfig,
        capabilities: PlatformCapabilities,
        signaling: Arc<dyn SignalingLink>,
        transports: Transports,
        pipeline: Arc<MediaPipeline>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let capabilities = PlatformCapabilities {
            fast_transport: capabilities.fast_transport && transports.connector.is_some(),
            peer_transport: capabilities.peer_transport && transports.peers.is_some(),
            ..capabilities
        };
        let strategy = determine_strategy(&capabilities);
        if strategy == TransportStrategy::Unsupported {
            error!("No usable transport: {:?}", capabilities);
            return Err(AppError::UnsupportedPlatform);
        }

        let local_id = format!("user_{}", uuid::Uuid::new_v4());
        info!("Transport strategy: {} (local id {})", strategy, local_id);
        events.publish(RoomEvent::StrategySelected { strategy });

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            display_name: config.room.display_name.clone(),
            config,
            local_id,
            strategy: ArcSwap::from_pointee(strategy),
            fallback_available: capabilities.peer_transport,
            ever_active: AtomicBool::new(false),
            signaling,
            transports,
            pipeline,
            events,
            room: RwLock::new(RoomContext {
                state: RoomState::Disconnected,
                room_id: None,
            }),
            sessions: Mutex::new(HashMap::new()),
            early_candidates: Mutex::new(HashMap::new()),
            local: Mutex::new(LocalMedia::default()),
            next_session_id: AtomicU64::new(1),
            session_tx,
            session_rx: Mutex::new(Some(session_rx)),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn strategy(&self) -> TransportStrategy {
        **self.strategy.load()
    }

    pub fn room_state(&self) -> RoomState {
        self.room.read().state
    }

    pub fn room_id(&self) -> Option<String> {
        self.room.read().room_id.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pipeline(&self) -> &Arc<MediaPipeline> {
        &self.pipeline
    }

    /// Snapshot of all tracked sessions, ordered by participant
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self.sessions.lock().values().map(Session::info).collect();
        list.sort_by(|a, b| a.participant.cmp(&b.participant));
        list
    }

    pub fn session_state(&self, participant: &str) -> Option<SessionState> {
        self.sessions.lock().get(participant).map(Session::state)
    }

    // ---------------------------------------------------------------------
    // Room membership
    // ---------------------------------------------------------------------

    /// Join `room_id`, or a freshly named room when `None`
    ///
    /// Returns the room id. If signaling is down the join is sent as soon
    /// as it reconnects.
    pub fn join_room(&self, room_id: Option<String>) -> Result<String> {
        let room_id = room_id.unwrap_or_else(|| format!("room_{}", uuid::Uuid::new_v4()));
        {
            let mut room = self.room.write();
            if !room.state.can_transition_to(RoomState::JoiningSignal) {
                return Err(AppError::InvalidState(format!(
                    "cannot join {}: room state is {}",
                    room_id, room.state
                )));
            }
            room.state = RoomState::JoiningSignal;
            room.room_id = Some(room_id.clone());
        }
        info!("Joining room {} as {}", room_id, self.local_id);
        self.announce_join(&room_id);
        Ok(room_id)
    }

    fn announce_join(&self, room_id: &str) {
        let message = SignalingMessage::JoinRoom {
            room_id: room_id.to_string(),
            user_id: self.local_id.clone(),
            display_name: Some(self.display_name.clone()),
            supports_fast_path: self.strategy() == TransportStrategy::FastPath,
        };
        if let Err(e) = self.signaling.send(&message) {
            warn!("join-room for {} deferred until signaling reconnects: {}", room_id, e);
            return;
        }

        let joined = {
            let mut room = self.room.write();
            if room.state == RoomState::JoiningSignal {
                room.state = RoomState::InRoom;
                true
            } else {
                false
            }
        };
        if joined {
            self.events.publish(RoomEvent::RoomJoined {
                room_id: room_id.to_string(),
                user_id: self.local_id.clone(),
            });
        }
    }

    /// Close every session and leave the room
    pub async fn leave_room(&self) -> Result<()> {
        let room_id = {
            let room = self.room.read();
            if room.state == RoomState::Disconnected {
                return Ok(());
            }
            room.room_id.clone()
        };

        let participants: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for participant in participants {
            self.close_session(&participant, "left room").await;
        }
        self.early_candidates.lock().clear();

        if let Some(room_id) = &room_id {
            let message = SignalingMessage::LeaveRoom {
                room_id: room_id.clone(),
                user_id: self.local_id.clone(),
            };
            if let Err(e) = self.signaling.send(&message) {
                warn!("Failed to send leave-room for {}: {}", room_id, e);
            }
        }

        {
            let mut room = self.room.write();
            room.state = RoomState::Disconnected;
            room.room_id = None;
        }
        if let Some(room_id) = room_id {
            info!("Left room {}", room_id);
            self.events.publish(RoomEvent::RoomLeft { room_id });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Outbound media and control
    // ---------------------------------------------------------------------

    fn active_handles(&self) -> Vec<Arc<dyn TransportSession>> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.state().accepts_media())
            .filter_map(|s| s.handle().cloned())
            .collect()
    }

    /// Send one encoded chunk to every active session
    ///
    /// Returns the number of sessions that took it. Per-session failures
    /// are logged by the session and do not affect the others.
    pub async fn send_chunk(&self, kind: MediaKind, chunk: &EncodedChunk) -> Result<usize> {
        let mut delivered = 0;
        for handle in self.active_handles() {
            if handle.send_chunk(kind, chunk).await.is_ok() {
                delivered += 1;
            }
        }
        trace!("{} chunk ts={} sent to {} sessions", kind, chunk.timestamp_micros, delivered);
        Ok(delivered)
    }

    /// Encode a local frame and send it to every active session
    pub async fn send_frame(&self, frame: RawFrame) -> Result<usize> {
        let kind = frame.kind();
        match self.pipeline.encode_local(frame).await? {
            Some(chunk) => self.send_chunk(kind, &chunk).await,
            None => Ok(0),
        }
    }

    /// Send a control signal to one participant, or to every active session
    pub async fn send_control(&self, signal: ControlSignal, target: Option<&str>) -> Result<usize> {
        let handles = match target {
            Some(participant) => {
                let handle = {
                    let sessions = self.sessions.lock();
                    let session = sessions
                        .get(participant)
                        .ok_or_else(|| AppError::NotFound(format!("session {}", participant)))?;
                    if !session.state().accepts_media() {
                        return Err(AppError::InvalidState(format!(
                            "session {} is {}",
                            participant,
                            session.state()
                        )));
                    }
                    session.handle().cloned()
                };
                handle.into_iter().collect()
            }
            None => self.active_handles(),
        };

        let mut delivered = 0;
        for handle in handles {
            match handle.send_control(signal).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Control {:?} to {} failed: {}", signal, handle.participant(), e),
            }
        }
        Ok(delivered)
    }

    /// Flip local audio mute; returns the new muted flag
    pub async fn toggle_mute(&self) -> Result<bool> {
        let muted = {
            let mut local = self.local.lock();
            local.muted = !local.muted;
            local.muted
        };
        self.pipeline.set_kind_enabled(MediaKind::Audio, !muted);
        self.send_control(ControlSignal::new(ControlKind::Mute, muted), None).await?;
        info!("Local audio {}", if muted { "muted" } else { "unmuted" });
        Ok(muted)
    }

    /// Flip local video; returns the new video-off flag
    pub async fn toggle_video(&self) -> Result<bool> {
        let video_off = {
            let mut local = self.local.lock();
            local.video_off = !local.video_off;
            local.video_off
        };
        self.pipeline.set_kind_enabled(MediaKind::Video, !video_off);
        self.send_control(ControlSignal::new(ControlKind::VideoOff, video_off), None)
            .await?;
        info!("Local video {}", if video_off { "off" } else { "on" });
        Ok(video_off)
    }

    // ---------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------

    /// Process signaling and session events until shutdown or until the
    /// signaling channel closes
    pub async fn run(self: Arc<Self>, mut signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>) -> Result<()> {
        let mut session_rx = self
            .session_rx
            .lock()
            .take()
            .ok_or_else(|| AppError::InvalidState("connection manager is already running".to_string()))?;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = session_rx.recv() => {
                    self.handle_session_event(event).await;
                }
                event = signaling_rx.recv() => match event {
                    Some(event) => self.handle_signaling(event).await,
                    None => {
                        info!("Signaling event channel closed");
                        break;
                    }
                },
            }
        }
        debug!("Connection manager loop stopped");
        Ok(())
    }

    /// Leave the room, close every session and release the pipeline
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.leave_room().await {
            warn!("Failed to leave room during shutdown: {}", e);
        }
        self.cancel.cancel();
        self.pipeline.dispose();
        info!("Connection manager shut down");
    }

    /// React to one event from the signaling connection
    pub async fn handle_signaling(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                self.events.publish(RoomEvent::SignalingConnected);
                let rejoin = {
                    let room = self.room.read();
                    match (&room.room_id, room.state) {
                        (Some(room_id), RoomState::JoiningSignal | RoomState::InRoom) => Some(room_id.clone()),
                        _ => None,
                    }
                };
                if let Some(room_id) = rejoin {
                    info!("Signaling connected, announcing membership in {}", room_id);
                    self.announce_join(&room_id);
                }
            }
            SignalingEvent::Disconnected { reason } => {
                // sessions keep their transports; only relay traffic is lost
                warn!("Signaling disconnected: {}", reason);
                self.events.publish(RoomEvent::SignalingDisconnected { reason });
            }
            SignalingEvent::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(self: &Arc<Self>, message: SignalingMessage) {
        if message.user_id() == self.local_id {
            trace!("Ignoring own {}", message.message_type());
            return;
        }
        if let Some(target) = message.target_id() {
            if target != self.local_id {
                trace!("Ignoring {} addressed to {}", message.message_type(), target);
                return;
            }
        }
        if self.room_state() == RoomState::Disconnected {
            debug!("Ignoring {} outside a room", message.message_type());
            return;
        }

        match message {
            SignalingMessage::UserJoined { user_id, display_name } => {
                self.on_user_joined(&user_id, display_name).await;
            }
            SignalingMessage::UserLeft { user_id } => {
                self.early_candidates.lock().remove(&user_id);
                if self.sessions.lock().contains_key(&user_id) {
                    self.close_session(&user_id, "participant left").await;
                    self.events.publish(RoomEvent::ParticipantLeft { participant: user_id });
                }
            }
            SignalingMessage::TransportInfo {
                user_id,
                transport_endpoint,
            } => {
                self.on_transport_info(&user_id, transport_endpoint);
            }
            SignalingMessage::Offer {
                user_id,
                sdp,
                ice_restart,
                ..
            } => {
                self.on_offer(&user_id, &sdp, ice_restart).await;
            }
            SignalingMessage::Answer { user_id, sdp, .. } => {
                let Some(session) = self.fallback_handle(&user_id) else {
                    warn!("Answer from {} without a pending offer", user_id);
                    return;
                };
                if let Err(e) = session.apply_answer(&sdp).await {
                    self.fail_session(&user_id, e).await;
                }
            }
            SignalingMessage::IceCandidate { user_id, candidate, .. } => {
                match self.fallback_handle(&user_id) {
                    Some(session) => {
                        if let Err(e) = session.add_remote_candidate(candidate).await {
                            warn!("Failed to add candidate from {}: {}", user_id, e);
                        }
                    }
                    None => {
                        let mut early = self.early_candidates.lock();
                        let pending = early.entry(user_id.clone()).or_default();
                        if pending.len() < MAX_EARLY_CANDIDATES {
                            trace!("Holding candidate from {} until its offer arrives", user_id);
                            pending.push(candidate);
                        } else {
                            warn!("Too many early candidates from {}, dropping", user_id);
                        }
                    }
                }
            }
            SignalingMessage::JoinRoom { .. }
            | SignalingMessage::LeaveRoom { .. }
            | SignalingMessage::RequestTransport { .. } => {
                debug!("Ignoring relay-bound {}", message.message_type());
            }
        }
    }

    async fn on_user_joined(self: &Arc<Self>, participant: &str, display_name: Option<String>) {
        if !self.track_participant(participant, display_name, Role::Initiator) {
            debug!("{} already tracked, ignoring user-joined", participant);
            return;
        }

        match self.strategy() {
            TransportStrategy::FastPath => {
                self.set_state(participant, SessionState::Negotiating);
                let message = SignalingMessage::RequestTransport {
                    room_id: self.room_id().unwrap_or_default(),
                    user_id: self.local_id.clone(),
                    target_user_id: participant.to_string(),
                };
                if let Err(e) = self.signaling.send(&message) {
                    self.fail_session(participant, e).await;
                }
            }
            _ => {
                self.set_state(participant, SessionState::Negotiating);
                self.negotiate_fallback(participant).await;
            }
        }
    }

    fn on_transport_info(self: &Arc<Self>, participant: &str, endpoint: String) {
        if self.strategy() != TransportStrategy::FastPath {
            debug!("Ignoring transport-info for {} under {}", participant, self.strategy());
            return;
        }

        let pending = {
            let sessions = self.sessions.lock();
            sessions
                .get(participant)
                .map(|s| s.state() == SessionState::Negotiating && s.handle().is_none())
        };
        match pending {
            Some(true) => {}
            Some(false) => {
                debug!("Duplicate transport-info for {}", participant);
                return;
            }
            None => {
                self.track_participant(participant, None, Role::Responder);
                self.set_state(participant, SessionState::Negotiating);
            }
        }
        self.open_fast_path(participant, endpoint);
    }

    async fn on_offer(self: &Arc<Self>, participant: &str, sdp: &str, ice_restart: bool) {
        if self.strategy() == TransportStrategy::FastPath {
            if self.ever_active.load(Ordering::SeqCst) || !self.fallback_available {
                warn!("Ignoring offer from {} while on the fast path", participant);
                return;
            }
            // the remote side already gave up on the fast path
            self.switch_to_fallback("remote participant negotiated a peer connection");
        }

        if let Some(session) = self.fallback_handle(participant) {
            if session.role() == Role::Responder || ice_restart {
                if let Err(e) = session.accept_offer(sdp).await {
                    self.fail_session(participant, e).await;
                }
                return;
            }
            // both sides offered; the lower id keeps the initiator role
            if self.local_id.as_str() < participant {
                debug!("Offer collision with {}, keeping ours", participant);
                return;
            }
            debug!("Offer collision with {}, answering theirs", participant);
        }

        if !self.sessions.lock().contains_key(participant) {
            self.track_participant(participant, None, Role::Responder);
        }
        if self.session_state(participant) == Some(SessionState::Idle) {
            self.set_state(participant, SessionState::Negotiating);
        }

        match self.start_fallback(participant, Role::Responder).await {
            Ok(session) => {
                if let Err(e) = session.accept_offer(sdp).await {
                    self.fail_session(participant, e).await;
                }
            }
            Err(e) => self.fail_session(participant, e).await,
        }
    }

    /// React to one event reported by a transport session
    pub async fn handle_session_event(self: &Arc<Self>, event: SessionEvent) {
        let SessionEvent {
            participant,
            session_id,
            kind,
        } = event;

        let current = self.sessions.lock().get(&participant).map(|s| s.session_id);
        if current != Some(session_id) {
            trace!("Dropping event from stale session {} of {}", session_id, participant);
            return;
        }

        match kind {
            SessionEventKind::Connected => {
                if self.set_state(&participant, SessionState::Active) {
                    self.ever_active.store(true, Ordering::SeqCst);
                    info!("Session with {} is active", participant);
                    self.announce_media_state(&participant).await;
                }
            }
            SessionEventKind::Disconnected { reason } => {
                info!("Session with {} disconnected: {}", participant, reason);
                self.close_session(&participant, &reason).await;
            }
            SessionEventKind::Failed(e) => self.fail_session(&participant, e).await,
            SessionEventKind::Control(signal) => {
                if let Some(session) = self.sessions.lock().get_mut(&participant) {
                    match signal.kind {
                        ControlKind::Mute => session.remote.muted = signal.value,
                        ControlKind::VideoOff => session.remote.video_off = signal.value,
                        ControlKind::Connected => session.remote.connected = signal.value,
                    }
                }
                debug!("Control from {}: {:?}", participant, signal);
                self.events.publish(RoomEvent::RemoteControl {
                    participant,
                    kind: signal.kind,
                    value: signal.value,
                });
            }
            SessionEventKind::Outbound(message) => {
                if let Err(e) = self.signaling.send(&message) {
                    warn!("Dropping {} for {}: {}", message.message_type(), participant, e);
                }
            }
            SessionEventKind::IceRestart => {
                self.events.publish(RoomEvent::IceRestart { participant });
            }
        }
    }

    // ---------------------------------------------------------------------
    // Session lifecycle
    // ---------------------------------------------------------------------

    fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert an Idle session for an untracked participant
    ///
    /// Returns false when the participant is already tracked.
    fn track_participant(&self, participant: &str, display_name: Option<String>, role: Role) -> bool {
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(participant) {
                return false;
            }
            let mut session = Session::new(participant, self.strategy(), role);
            session.session_id = self.next_session_id();
            session.display_name = display_name.clone();
            sessions.insert(participant.to_string(), session);
        }
        self.pipeline.register_participant(participant);
        info!("Tracking participant {} ({:?})", participant, role);
        self.events.publish(RoomEvent::ParticipantJoined {
            participant: participant.to_string(),
            display_name,
        });
        true
    }

    /// Apply a state transition and publish it; false if not allowed
    fn set_state(&self, participant: &str, next: SessionState) -> bool {
        let transport = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(participant) else {
                return false;
            };
            if let Err(e) = session.transition(next) {
                debug!("{}", e);
                return false;
            }
            session.transport
        };
        self.events.publish(RoomEvent::SessionStateChanged {
            participant: participant.to_string(),
            state: next,
            transport,
        });
        true
    }

    fn sender_for(&self, participant: &str, session_id: u64) -> SessionEventSender {
        SessionEventSender::new(participant, session_id, self.session_tx.clone())
    }

    fn open_fast_path(self: &Arc<Self>, participant: &str, endpoint: String) {
        let Some(connector) = self.transports.connector.clone() else {
            return;
        };
        let Some(session_id) = self.sessions.lock().get(participant).map(|s| s.session_id) else {
            return;
        };

        let events = self.sender_for(participant, session_id);
        let manager = self.clone();
        let participant = participant.to_string();
        let timeout = self.config.fast_path.connect_timeout();
        let max_chunk = self.config.fast_path.max_chunk_bytes;
        tokio::spawn(async move {
            let opened = tokio::select! {
                biased;
                _ = manager.cancel.cancelled() => return,
                opened = FastPathSession::open(
                    connector.as_ref(),
                    &endpoint,
                    timeout,
                    manager.pipeline.clone(),
                    events.clone(),
                    max_chunk,
                ) => opened,
            };
            match opened {
                Ok(session) => {
                    if manager.attach_handle(&participant, session_id, session.clone()) {
                        events.emit(SessionEventKind::Connected);
                    } else {
                        debug!("Session with {} ended while connecting", participant);
                        session.close().await;
                    }
                }
                Err(e) => events.emit(SessionEventKind::Failed(e)),
            }
        });
    }

    fn attach_handle(&self, participant: &str, session_id: u64, handle: Arc<dyn TransportSession>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(participant) {
            Some(session) if session.session_id == session_id && !session.state().is_terminal() => {
                session.set_handle(handle);
                true
            }
            _ => false,
        }
    }

    fn fallback_handle(&self, participant: &str) -> Option<Arc<FallbackSession>> {
        let handle = self.sessions.lock().get(participant)?.handle()?.clone();
        handle.into_fallback()
    }

    /// Create a peer connection for `participant` and install it as the
    /// session's transport, replacing any previous one
    async fn start_fallback(&self, participant: &str, role: Role) -> Result<Arc<FallbackSession>> {
        let peers = self
            .transports
            .peers
            .clone()
            .ok_or_else(|| AppError::Internal("no peer transport available".to_string()))?;
        let (link, peer_events) = peers.create(participant).await?;

        let session_id = self.next_session_id();
        let addressing = Addressing {
            room_id: self.room_id().unwrap_or_default(),
            local_id: self.local_id.clone(),
        };
        let session = FallbackSession::start(
            link,
            peer_events,
            role,
            addressing,
            self.pipeline.clone(),
            self.sender_for(participant, session_id),
            self.config.ice.checking_timeout(),
        );

        let previous = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(participant) {
                Some(record) => {
                    record.session_id = session_id;
                    record.transport = TransportStrategy::Fallback;
                    record.role = role;
                    let previous = record.take_handle();
                    record.set_handle(session.clone());
                    Ok(previous)
                }
                None => Err(()),
            }
        };
        let previous = match previous {
            Ok(previous) => previous,
            Err(()) => {
                session.close().await;
                return Err(AppError::NotFound(format!("session {}", participant)));
            }
        };
        if let Some(previous) = previous {
            previous.close().await;
        }

        let early = self.early_candidates.lock().remove(participant).unwrap_or_default();
        for candidate in early {
            session.add_remote_candidate(candidate).await?;
        }
        Ok(session)
    }

    /// Start a peer connection as initiator and send the offer
    async fn negotiate_fallback(&self, participant: &str) {
        let result = match self.start_fallback(participant, Role::Initiator).await {
            Ok(session) => session.initiate().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            Box::pin(self.fail_session(participant, e)).await;
        }
    }

    fn switch_to_fallback(&self, reason: &str) -> bool {
        if self.strategy() != TransportStrategy::FastPath {
            return false;
        }
        warn!("Switching to fallback transport: {}", reason);
        self.strategy.store(Arc::new(TransportStrategy::Fallback));
        self.events.publish(RoomEvent::StrategySelected {
            strategy: TransportStrategy::Fallback,
        });
        true
    }

    /// Handle a session-scoped failure
    ///
    /// An establishment failure before any session was ever active moves
    /// the process to the fallback transport and renegotiates instead.
    async fn fail_session(&self, participant: &str, error: AppError) {
        let early_fallback = matches!(error, AppError::Establishment(_))
            && self.fallback_available
            && !self.ever_active.load(Ordering::SeqCst);

        if early_fallback {
            warn!("Fast path to {} failed before any session was active: {}", participant, error);
            if self.switch_to_fallback(&error.to_string()) {
                // sessions still waiting for transport-info move over too
                let waiting: Vec<String> = self
                    .sessions
                    .lock()
                    .values()
                    .filter(|s| {
                        s.participant != participant
                            && s.transport == TransportStrategy::FastPath
                            && s.handle().is_none()
                            && s.state() == SessionState::Negotiating
                    })
                    .map(|s| s.participant.clone())
                    .collect();
                for other in waiting {
                    self.negotiate_fallback(&other).await;
                }
            }
            self.negotiate_fallback(participant).await;
            return;
        }

        if error.is_transient() {
            warn!("Session with {} lost: {}", participant, error);
        } else {
            error!("Session with {} failed: {}", participant, error);
        }
        self.events.publish(RoomEvent::SessionFailed {
            participant: participant.to_string(),
            error: error.to_string(),
        });
        self.close_session(participant, &error.to_string()).await;
    }

    /// Close a session and drop it from the registry
    async fn close_session(&self, participant: &str, reason: &str) {
        let Some(mut session) = self.sessions.lock().remove(participant) else {
            return;
        };
        let transport = session.transport;
        let publish = |state| {
            self.events.publish(RoomEvent::SessionStateChanged {
                participant: participant.to_string(),
                state,
                transport,
            })
        };

        if session.transition(SessionState::Closing).is_ok() {
            publish(SessionState::Closing);
        }
        if let Some(handle) = session.take_handle() {
            handle.close().await;
        }
        self.pipeline.release_participant(participant);
        if session.transition(SessionState::Closed).is_ok() {
            publish(SessionState::Closed);
        }
        info!("Session with {} closed: {}", participant, reason);
    }

    /// Tell a newly active participant about our media state
    async fn announce_media_state(&self, participant: &str) {
        let (handle, transport) = {
            let sessions = self.sessions.lock();
            match sessions.get(participant) {
                Some(s) => (s.handle().cloned(), s.transport),
                None => return,
            }
        };
        let Some(handle) = handle else {
            return;
        };

        let local = *self.local.lock();
        let mut signals = Vec::new();
        if transport == TransportStrategy::FastPath {
            signals.push(ControlSignal::new(ControlKind::Connected, true));
        }
        if local.muted {
            signals.push(ControlSignal::new(ControlKind::Mute, true));
        }
        if local.video_off {
            signals.push(ControlSignal::new(ControlKind::VideoOff, true));
        }
        for signal in signals {
            if let Err(e) = handle.send_control(signal).await {
                debug!("Failed to announce {:?} to {}: {}", signal, participant, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioCodecConfig, VideoCodecConfig};
    use crate::testing::{
        FailingConnector, FakePeerFactory, FakeSignaling, MemoryConnector, RecordingCodecFactory, Relay,
    };
    use crate::transport::{IceState, PeerEvent};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn caps(fast: bool, peer: bool) -> PlatformCapabilities {
        PlatformCapabilities {
            fast_transport: fast,
            hardware_codec: true,
            raw_track_access: true,
            peer_transport: peer,
        }
    }

    fn pipeline(events: &EventBus) -> (Arc<MediaPipeline>, RecordingCodecFactory) {
        let factory = RecordingCodecFactory::new();
        let pipeline = Arc::new(MediaPipeline::new(
            VideoCodecConfig::default(),
            AudioCodecConfig::default(),
            Arc::new(factory.clone()),
            events.clone(),
        ));
        (pipeline, factory)
    }

    fn manager(
        capabilities: PlatformCapabilities,
        signaling: Arc<FakeSignaling>,
        transports: Transports,
    ) -> (Arc<ConnectionManager>, broadcast::Receiver<RoomEvent>) {
        let events = EventBus::new();
        let rx = events.subscribe();
        let (pipeline, _) = pipeline(&events);
        let manager = ConnectionManager::new(
            AppConfig::default(),
            capabilities,
            signaling,
            transports,
            pipeline,
            events,
        )
        .unwrap();
        (manager, rx)
    }

    fn joined(user_id: &str) -> SignalingEvent {
        SignalingEvent::Message(SignalingMessage::UserJoined {
            user_id: user_id.to_string(),
            display_name: Some("Bob".to_string()),
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn wait_for_state(manager: &ConnectionManager, participant: &str, state: SessionState) {
        for _ in 0..400 {
            if manager.session_state(participant) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "{} never reached {} (now {:?})",
            participant,
            state,
            manager.session_state(participant)
        );
    }

    fn drain(rx: &mut broadcast::Receiver<RoomEvent>) -> Vec<RoomEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_unsupported_platform_is_fatal() {
        let (signaling, _rx) = FakeSignaling::new();
        let events = EventBus::new();
        let (pipeline, _) = pipeline(&events);
        let result = ConnectionManager::new(
            AppConfig::default(),
            caps(false, false),
            signaling.clone(),
            Transports::default(),
            pipeline,
            events,
        );
        assert!(matches!(result, Err(AppError::UnsupportedPlatform)));
        assert!(signaling.sent().is_empty());
    }

    #[test]
    fn test_missing_backend_counts_as_missing_capability() {
        let (signaling, _rx) = FakeSignaling::new();
        let (manager, _) = manager(
            caps(true, true),
            signaling,
            Transports {
                connector: None,
                peers: Some(FakePeerFactory::new()),
            },
        );
        assert_eq!(manager.strategy(), TransportStrategy::Fallback);
    }

    #[tokio::test]
    async fn test_join_and_leave_room() {
        let (signaling, _rx) = FakeSignaling::new();
        let peers = FakePeerFactory::new();
        let (manager, mut events) = manager(
            caps(false, true),
            signaling.clone(),
            Transports {
                connector: None,
                peers: Some(peers.clone()),
            },
        );

        let room_id = manager.join_room(Some("room_1".into())).unwrap();
        assert_eq!(manager.room_state(), RoomState::InRoom);
        assert!(manager.join_room(None).is_err());
        match &signaling.sent_of_type("join-room")[0] {
            SignalingMessage::JoinRoom {
                room_id: sent_room,
                display_name,
                supports_fast_path,
                ..
            } => {
                assert_eq!(sent_room, &room_id);
                assert_eq!(display_name.as_deref(), Some("Guest"));
                assert!(!supports_fast_path);
            }
            other => panic!("unexpected {:?}", other),
        }

        manager.handle_signaling(joined("user_b")).await;
        assert_eq!(manager.sessions().len(), 1);

        manager.leave_room().await.unwrap();
        assert!(manager.sessions().is_empty());
        assert_eq!(manager.room_state(), RoomState::Disconnected);
        assert_eq!(signaling.sent_of_type("leave-room").len(), 1);
        let (peer, _) = peers.peer("user_b").unwrap();
        assert!(peer.is_closed());

        let names: Vec<_> = drain(&mut events).iter().map(|e| e.event_name()).collect();
        assert!(names.contains(&"room.joined"));
        assert!(names.contains(&"room.left"));
    }

    #[tokio::test]
    async fn test_duplicate_user_joined_is_noop() {
        let (signaling, _rx) = FakeSignaling::new();
        let peers = FakePeerFactory::new();
        let (manager, _) = manager(
            caps(false, true),
            signaling.clone(),
            Transports {
                connector: None,
                peers: Some(peers.clone()),
            },
        );
        manager.join_room(Some("room_1".into())).unwrap();

        manager.handle_signaling(joined("user_b")).await;
        manager.handle_signaling(joined("user_b")).await;

        assert_eq!(manager.sessions().len(), 1);
        assert_eq!(peers.created(), 1);
        assert_eq!(signaling.sent_of_type("offer").len(), 1);
        assert_eq!(manager.sessions()[0].display_name.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn test_offer_from_unknown_participant_answers_with_buffered_candidates() {
        let (signaling, _rx) = FakeSignaling::new();
        let peers = FakePeerFactory::new();
        let (manager, _) = manager(
            caps(false, true),
            signaling.clone(),
            Transports {
                connector: None,
                peers: Some(peers.clone()),
            },
        );
        manager.join_room(Some("room_1".into())).unwrap();
        let me = manager.local_id().to_string();

        for i in 0..2 {
            manager
                .handle_signaling(SignalingEvent::Message(SignalingMessage::IceCandidate {
                    room_id: "room_1".into(),
                    user_id: "user_c".into(),
                    target_user_id: me.clone(),
                    candidate: IceCandidate::new(format!("candidate:{}", i)),
                }))
                .await;
        }
        assert!(manager.sessions().is_empty());

        manager
            .handle_signaling(SignalingEvent::Message(SignalingMessage::Offer {
                room_id: "room_1".into(),
                user_id: "user_c".into(),
                target_user_id: me.clone(),
                sdp: "v=0 offer".into(),
                ice_restart: false,
            }))
            .await;

        let (peer, _) = peers.peer("user_c").unwrap();
        assert_eq!(peer.applied_candidates(), vec!["candidate:0", "candidate:1"]);
        assert_eq!(manager.session_state("user_c"), Some(SessionState::Negotiating));

        // the answer goes out through the session event loop
        let (_signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let manager_task = tokio::spawn(manager.clone().run(signaling_rx));
        settle().await;
        let answers = signaling.sent_of_type("answer");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].target_id(), Some("user_c"));
        manager.shutdown().await;
        let _ = manager_task.await;
    }

    #[tokio::test]
    async fn test_messages_for_others_ignored() {
        let (signaling, _rx) = FakeSignaling::new();
        let (manager, _) = manager(
            caps(false, true),
            signaling,
            Transports {
                connector: None,
                peers: Some(FakePeerFactory::new()),
            },
        );
        manager.join_room(Some("room_1".into())).unwrap();

        manager
            .handle_signaling(SignalingEvent::Message(SignalingMessage::Offer {
                room_id: "room_1".into(),
                user_id: "user_c".into(),
                target_user_id: "user_somebody_else".into(),
                sdp: "v=0".into(),
                ice_restart: false,
            }))
            .await;
        assert!(manager.sessions().is_empty());
    }

    /// Scenario A: fast path keyframe delivered once to the remote decoder
    #[tokio::test]
    async fn test_fast_path_keyframe_end_to_end() {
        let relay = Relay::new();
        let connector = MemoryConnector::new();

        let make = |signaling: Arc<FakeSignaling>| {
            let events = EventBus::new();
            let (pipeline, factory) = pipeline(&events);
            let manager = ConnectionManager::new(
                AppConfig::default(),
                caps(true, true),
                signaling,
                Transports {
                    connector: Some(connector.clone()),
                    peers: Some(FakePeerFactory::new()),
                },
                pipeline,
                events,
            )
            .unwrap();
            (manager, factory.decode_calls())
        };

        let (alice_link, alice_rx) = relay.client();
        let (bob_link, bob_rx) = relay.client();
        let (alice, _alice_decodes) = make(alice_link);
        let (bob, bob_decodes) = make(bob_link);
        let alice_task = tokio::spawn(alice.clone().run(alice_rx));
        let bob_task = tokio::spawn(bob.clone().run(bob_rx));

        alice.join_room(Some("room_a".into())).unwrap();
        bob.join_room(Some("room_a".into())).unwrap();

        wait_for_state(&alice, bob.local_id(), SessionState::Active).await;
        wait_for_state(&bob, alice.local_id(), SessionState::Active).await;
        assert_eq!(connector.connects(), 2);

        let sink = bob.pipeline().sink(alice.local_id()).unwrap();
        let mut frames = sink.subscribe_video();
        let chunk = EncodedChunk::key(1000, vec![0xAB; 500]);
        assert_eq!(alice.send_chunk(MediaKind::Video, &chunk).await.unwrap(), 1);

        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.timestamp_micros, 1000);
        assert_eq!(frame.rgb.len(), 500);
        settle().await;
        assert_eq!(bob_decodes.load(Ordering::SeqCst), 1);

        // the connected announcement reached bob
        let info = bob.sessions();
        assert!(info[0].remote.connected);
        assert_eq!(info[0].transport, TransportStrategy::FastPath);

        alice.shutdown().await;
        for _ in 0..400 {
            if bob.sessions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(bob.sessions().is_empty());
        assert!(bob.pipeline().sink(alice.local_id()).is_none());
        bob.shutdown().await;
        let _ = alice_task.await;
        let _ = bob_task.await;
    }

    /// Scenario B: ICE stuck in checking restarts once, then fails
    #[tokio::test(start_paused = true)]
    async fn test_ice_checking_timeout_scenario() {
        let (signaling, rx) = FakeSignaling::new();
        let peers = FakePeerFactory::new();
        let (manager, mut events) = manager(
            caps(false, true),
            signaling.clone(),
            Transports {
                connector: None,
                peers: Some(peers.clone()),
            },
        );
        manager.join_room(Some("room_1".into())).unwrap();
        let task = tokio::spawn(manager.clone().run(rx));

        signaling.inject(joined("user_b"));
        settle().await;
        let (_peer, driver) = peers.peer("user_b").unwrap();
        driver.send(PeerEvent::IceState(IceState::Checking)).unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        let restarts: Vec<_> = signaling
            .sent_of_type("offer")
            .into_iter()
            .filter(|m| matches!(m, SignalingMessage::Offer { ice_restart: true, .. }))
            .collect();
        assert_eq!(restarts.len(), 1);
        assert_eq!(manager.session_state("user_b"), Some(SessionState::Negotiating));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(manager.session_state("user_b"), None);
        assert_eq!(signaling.sent_of_type("offer").len(), 2);

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(e, RoomEvent::IceRestart { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            RoomEvent::SessionFailed { error, .. } if error.starts_with("Negotiation timed out")
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            RoomEvent::SessionStateChanged { state: SessionState::Closing, .. }
        )));

        manager.shutdown().await;
        let _ = task.await;
    }

    /// Scenario C: signaling drops and comes back without duplicating sessions
    #[tokio::test]
    async fn test_signaling_reconnect_keeps_sessions() {
        let (signaling, rx) = FakeSignaling::new();
        let (manager, _) = manager(
            caps(true, true),
            signaling.clone(),
            Transports {
                connector: Some(MemoryConnector::new()),
                peers: Some(FakePeerFactory::new()),
            },
        );
        manager.join_room(Some("room_1".into())).unwrap();
        let task = tokio::spawn(manager.clone().run(rx));

        signaling.inject(joined("user_b"));
        settle().await;
        assert_eq!(signaling.sent_of_type("request-transport").len(), 1);

        signaling.set_connected(false);
        signaling.inject(SignalingEvent::Disconnected {
            reason: "socket closed".into(),
        });
        settle().await;
        assert_eq!(manager.sessions().len(), 1);

        signaling.set_connected(true);
        signaling.inject(SignalingEvent::Connected);
        // the relay replays membership after the rejoin
        signaling.inject(joined("user_b"));
        settle().await;

        assert_eq!(signaling.sent_of_type("join-room").len(), 2);
        assert_eq!(signaling.sent_of_type("request-transport").len(), 1);
        assert_eq!(manager.sessions().len(), 1);
        assert_eq!(manager.room_state(), RoomState::InRoom);

        manager.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_join_deferred_while_signaling_down() {
        let (signaling, _rx) = FakeSignaling::new();
        let (manager, _) = manager(
            caps(false, true),
            signaling.clone(),
            Transports {
                connector: None,
                peers: Some(FakePeerFactory::new()),
            },
        );
        signaling.set_connected(false);
        manager.join_room(Some("room_1".into())).unwrap();
        assert_eq!(manager.room_state(), RoomState::JoiningSignal);

        signaling.set_connected(true);
        manager.handle_signaling(SignalingEvent::Connected).await;
        assert_eq!(manager.room_state(), RoomState::InRoom);
        assert_eq!(signaling.sent_of_type("join-room").len(), 1);
    }

    #[tokio::test]
    async fn test_early_fast_path_failure_switches_to_fallback() {
        let (signaling, rx) = FakeSignaling::new();
        let peers = FakePeerFactory::new();
        let (manager, mut events) = manager(
            caps(true, true),
            signaling.clone(),
            Transports {
                connector: Some(Arc::new(FailingConnector)),
                peers: Some(peers.clone()),
            },
        );
        assert_eq!(manager.strategy(), TransportStrategy::FastPath);
        manager.join_room(Some("room_1".into())).unwrap();
        let task = tokio::spawn(manager.clone().run(rx));

        signaling.inject(joined("user_b"));
        signaling.inject(SignalingEvent::Message(SignalingMessage::TransportInfo {
            user_id: "user_b".into(),
            transport_endpoint: "quic://relay.invalid:4433".into(),
        }));
        settle().await;

        assert_eq!(manager.strategy(), TransportStrategy::Fallback);
        assert_eq!(peers.created(), 1);
        assert_eq!(signaling.sent_of_type("offer").len(), 1);
        let info = manager.sessions();
        assert_eq!(info[0].transport, TransportStrategy::Fallback);
        assert_eq!(info[0].state, SessionState::Negotiating);
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            RoomEvent::StrategySelected {
                strategy: TransportStrategy::Fallback
            }
        )));

        manager.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_late_fast_path_failure_only_fails_that_session() {
        let (signaling, _rx) = FakeSignaling::new();
        let (manager, _) = manager(
            caps(true, true),
            signaling,
            Transports {
                connector: Some(Arc::new(FailingConnector)),
                peers: Some(FakePeerFactory::new()),
            },
        );
        manager.join_room(Some("room_1".into())).unwrap();
        manager.ever_active.store(true, Ordering::SeqCst);

        manager.handle_signaling(joined("user_b")).await;
        let session_id = manager.sessions.lock().get("user_b").unwrap().session_id;
        manager
            .handle_session_event(SessionEvent {
                participant: "user_b".into(),
                session_id,
                kind: SessionEventKind::Failed(AppError::Establishment("refused".into())),
            })
            .await;

        assert_eq!(manager.strategy(), TransportStrategy::FastPath);
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_peer_negotiation_ignored_on_fast_path_session() {
        let (signaling, rx) = FakeSignaling::new();
        let peers = FakePeerFactory::new();
        let (manager, mut events) = manager(
            caps(true, true),
            signaling.clone(),
            Transports {
                connector: Some(MemoryConnector::new()),
                peers: Some(peers.clone()),
            },
        );
        manager.join_room(Some("room_1".into())).unwrap();
        let me = manager.local_id().to_string();
        let task = tokio::spawn(manager.clone().run(rx));

        signaling.inject(SignalingEvent::Message(SignalingMessage::TransportInfo {
            user_id: "user_b".into(),
            transport_endpoint: "127.0.0.1:4433".into(),
        }));
        wait_for_state(&manager, "user_b", SessionState::Active).await;
        drain(&mut events);

        signaling.inject(SignalingEvent::Message(SignalingMessage::Answer {
            room_id: "room_1".into(),
            user_id: "user_b".into(),
            target_user_id: me.clone(),
            sdp: "v=0 answer".into(),
        }));
        signaling.inject(SignalingEvent::Message(SignalingMessage::IceCandidate {
            room_id: "room_1".into(),
            user_id: "user_b".into(),
            target_user_id: me,
            candidate: IceCandidate::new("candidate:0"),
        }));
        settle().await;

        assert_eq!(manager.session_state("user_b"), Some(SessionState::Active));
        assert_eq!(manager.sessions()[0].transport, TransportStrategy::FastPath);
        assert_eq!(peers.created(), 0);
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, RoomEvent::SessionFailed { .. })));

        manager.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_fallback_active_toggle_and_remote_control() {
        let (signaling, rx) = FakeSignaling::new();
        let peers = FakePeerFactory::new();
        let (manager, mut events) = manager(
            caps(false, true),
            signaling.clone(),
            Transports {
                connector: None,
                peers: Some(peers.clone()),
            },
        );
        manager.join_room(Some("room_1".into())).unwrap();
        let task = tokio::spawn(manager.clone().run(rx));

        signaling.inject(joined("user_b"));
        settle().await;
        let (peer, driver) = peers.peer("user_b").unwrap();
        driver.send(PeerEvent::IceState(IceState::Checking)).unwrap();
        driver.send(PeerEvent::IceState(IceState::Connected)).unwrap();
        wait_for_state(&manager, "user_b", SessionState::Active).await;

        assert!(manager.toggle_mute().await.unwrap());
        assert!(!manager.pipeline().is_kind_enabled(MediaKind::Audio));
        assert_eq!(peer.controls_sent(), vec![[0x01, 0x01]]);

        assert_eq!(
            manager
                .send_chunk(MediaKind::Video, &EncodedChunk::key(0, vec![1, 2]))
                .await
                .unwrap(),
            1
        );
        assert_eq!(peer.chunks_written(), 1);

        driver
            .send(PeerEvent::ControlData(bytes::Bytes::from_static(&[0x02, 0x01])))
            .unwrap();
        settle().await;
        assert!(manager.sessions()[0].remote.video_off);
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            RoomEvent::RemoteControl {
                kind: ControlKind::VideoOff,
                value: true,
                ..
            }
        )));

        assert!(matches!(
            manager
                .send_control(ControlSignal::new(ControlKind::Mute, false), Some("user_z"))
                .await,
            Err(AppError::NotFound(_))
        ));

        signaling.inject(SignalingEvent::Message(SignalingMessage::UserLeft {
            user_id: "user_b".into(),
        }));
        settle().await;
        assert!(manager.sessions().is_empty());
        assert!(peer.is_closed());
        assert!(manager.pipeline().sink("user_b").is_none());

        manager.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_stale_session_events_ignored() {
        let (signaling, _rx) = FakeSignaling::new();
        let (manager, _) = manager(
            caps(false, true),
            signaling,
            Transports {
                connector: None,
                peers: Some(FakePeerFactory::new()),
            },
        );
        manager.join_room(Some("room_1".into())).unwrap();
        manager.handle_signaling(joined("user_b")).await;

        manager
            .handle_session_event(SessionEvent {
                participant: "user_b".into(),
                session_id: 9999,
                kind: SessionEventKind::Disconnected {
                    reason: "old".into(),
                },
            })
            .await;
        assert_eq!(manager.sessions().len(), 1);
    }
}
