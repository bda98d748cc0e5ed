//! Media transports
//!
//! Both transports implement [`TransportSession`]:
//!
//! - [`fast_path`]: one QUIC unidirectional stream per chunk, control over
//!   datagrams
//! - [`fallback`]: a WebRTC peer connection negotiated through signaling
//!
//! Sessions never touch the signaling socket or the session registry.
//! Everything they need to report goes to the connection manager as a
//! [`SessionEvent`].

pub mod fallback;
pub mod fast_path;
pub mod quic;
pub mod rtc;
pub mod strategy;

pub use fallback::{FallbackSession, IceState, PeerEvent, PeerFactory, PeerLink};
pub use fast_path::FastPathSession;
pub use quic::QuicConnector;
pub use rtc::RtcPeerFactory;
pub use strategy::{determine_strategy, PlatformCapabilities, TransportStrategy};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::{AppError, Result};
use crate::protocol::{ControlSignal, EncodedChunk, MediaKind};
use crate::signaling::SignalingMessage;

/// Uniform send/close contract over both transports
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn kind(&self) -> TransportStrategy;

    fn participant(&self) -> &str;

    async fn send_chunk(&self, kind: MediaKind, chunk: &EncodedChunk) -> Result<()>;

    async fn send_control(&self, signal: ControlSignal) -> Result<()>;

    /// Release readers and the underlying connection (idempotent)
    async fn close(&self);

    /// Fallback sessions also take part in SDP/ICE exchange
    fn into_fallback(self: Arc<Self>) -> Option<Arc<FallbackSession>> {
        None
    }
}

/// Write half of a unidirectional stream
pub type UniSendStream = Box<dyn AsyncWrite + Send + Unpin>;
/// Read half of a unidirectional stream
pub type UniRecvStream = Box<dyn AsyncRead + Send + Unpin>;

/// Multiplexed connection with uni streams and unreliable datagrams
#[async_trait]
pub trait MuxConnection: Send + Sync {
    async fn open_uni(&self) -> Result<UniSendStream>;

    /// Next inbound stream; `None` once the connection is closed
    async fn accept_uni(&self) -> Result<Option<UniRecvStream>>;

    fn send_datagram(&self, data: Bytes) -> Result<()>;

    /// Next inbound datagram; `None` once the connection is closed
    async fn read_datagram(&self) -> Result<Option<Bytes>>;

    fn close(&self);
}

/// Opens multiplexed connections to a transport endpoint
#[async_trait]
pub trait MuxConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn MuxConnection>>;
}

/// Report from a transport session to the connection manager
#[derive(Debug)]
pub struct SessionEvent {
    pub participant: String,
    /// Distinguishes a participant's current session from earlier ones
    pub session_id: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug)]
pub enum SessionEventKind {
    /// Transport is up and carries media
    Connected,
    /// Transport went away (remote close, ICE disconnected/failed/closed)
    Disconnected { reason: String },
    /// Session-scoped failure; the session must close
    Failed(AppError),
    /// Control datagram from the remote side
    Control(ControlSignal),
    /// Signaling message the session wants relayed to its participant
    Outbound(SignalingMessage),
    /// An ICE restart offer was issued
    IceRestart,
}

/// Sending half handed to each transport session
#[derive(Clone)]
pub struct SessionEventSender {
    participant: Arc<str>,
    session_id: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEventSender {
    pub fn new(participant: &str, session_id: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            participant: Arc::from(participant),
            session_id,
            tx,
        }
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn emit(&self, kind: SessionEventKind) {
        let _ = self.tx.send(SessionEvent {
            participant: self.participant.to_string(),
            session_id: self.session_id,
            kind,
        });
    }
}
