//! In-crate fakes shared by unit tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::config::{AudioCodecConfig, VideoCodecConfig};
use crate::error::{AppError, Result};
use crate::media::codec::{
    AudioDecoder, AudioEncoder, CodecFactory, DecodedAudioFrame, DecodedVideoFrame, RawAudioFrame,
    RawVideoFrame, VideoDecoder, VideoEncoder,
};
use crate::protocol::{EncodedChunk, MediaKind};
use crate::signaling::{IceCandidate, SignalingEvent, SignalingLink, SignalingMessage};
use crate::transport::{
    MuxConnection, MuxConnector, PeerEvent, PeerFactory, PeerLink, UniRecvStream, UniSendStream,
};

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

/// Codec factory whose codecs pass payloads through and count decodes
#[derive(Clone, Default)]
pub struct RecordingCodecFactory {
    failing: Option<MediaKind>,
    decodes: Arc<AtomicUsize>,
}

impl RecordingCodecFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every codec of `kind` fail to construct
    pub fn fail_kind(mut self, kind: MediaKind) -> Self {
        self.failing = Some(kind);
        self
    }

    pub fn decode_calls(&self) -> Arc<AtomicUsize> {
        self.decodes.clone()
    }

    fn check(&self, kind: MediaKind) -> Result<()> {
        if self.failing == Some(kind) {
            return Err(AppError::CodecConfiguration {
                kind,
                reason: "forced failure".to_string(),
            });
        }
        Ok(())
    }
}

struct PassthroughVideoEncoder;

impl VideoEncoder for PassthroughVideoEncoder {
    fn encode(&mut self, frame: &RawVideoFrame, force_keyframe: bool) -> Result<Option<EncodedChunk>> {
        Ok(Some(if force_keyframe {
            EncodedChunk::key(frame.timestamp_micros, frame.i420.clone())
        } else {
            EncodedChunk::delta(frame.timestamp_micros, frame.i420.clone())
        }))
    }

    fn name(&self) -> &str {
        "passthrough-video"
    }
}

struct PassthroughAudioEncoder;

impl AudioEncoder for PassthroughAudioEncoder {
    fn encode(&mut self, frame: &RawAudioFrame) -> Result<EncodedChunk> {
        let payload: Vec<u8> = frame.samples.iter().flat_map(|s| s.to_be_bytes()).collect();
        Ok(EncodedChunk::key(frame.timestamp_micros, payload))
    }

    fn name(&self) -> &str {
        "passthrough-audio"
    }
}

struct CountingVideoDecoder(Arc<AtomicUsize>);

impl VideoDecoder for CountingVideoDecoder {
    fn decode(&mut self, chunk: &EncodedChunk) -> Result<Option<DecodedVideoFrame>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Some(DecodedVideoFrame {
            width: 2,
            height: 2,
            rgb: chunk.payload.clone(),
            timestamp_micros: chunk.timestamp_micros,
        }))
    }
}

struct CountingAudioDecoder(Arc<AtomicUsize>);

impl AudioDecoder for CountingAudioDecoder {
    fn decode(&mut self, chunk: &EncodedChunk) -> Result<DecodedAudioFrame> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(DecodedAudioFrame {
            samples: vec![0; 960],
            sample_rate: 48000,
            channels: 1,
            timestamp_micros: chunk.timestamp_micros,
        })
    }
}

impl CodecFactory for RecordingCodecFactory {
    fn video_encoder(&self, _config: &VideoCodecConfig) -> Result<Box<dyn VideoEncoder>> {
        self.check(MediaKind::Video)?;
        Ok(Box::new(PassthroughVideoEncoder))
    }

    fn video_decoder(&self, _config: &VideoCodecConfig) -> Result<Box<dyn VideoDecoder>> {
        self.check(MediaKind::Video)?;
        Ok(Box::new(CountingVideoDecoder(self.decodes.clone())))
    }

    fn audio_encoder(&self, _config: &AudioCodecConfig) -> Result<Box<dyn AudioEncoder>> {
        self.check(MediaKind::Audio)?;
        Ok(Box::new(PassthroughAudioEncoder))
    }

    fn audio_decoder(&self, _config: &AudioCodecConfig) -> Result<Box<dyn AudioDecoder>> {
        self.check(MediaKind::Audio)?;
        Ok(Box::new(CountingAudioDecoder(self.decodes.clone())))
    }
}

// ---------------------------------------------------------------------------
// Multiplexed connections
// ---------------------------------------------------------------------------

const DUPLEX_BUFFER: usize = 64 * 1024;

/// One half of an in-memory multiplexed connection
struct MemoryConnection {
    streams_out: mpsc::UnboundedSender<UniRecvStream>,
    streams_in: AsyncMutex<mpsc::UnboundedReceiver<UniRecvStream>>,
    datagrams_out: mpsc::UnboundedSender<Bytes>,
    datagrams_in: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    /// Shared by both halves; closing either side closes the pair
    closed: CancellationToken,
}

/// Connected pair of in-memory connections
pub fn mux_pair() -> (Arc<dyn MuxConnection>, Arc<dyn MuxConnection>) {
    let (a_streams_tx, b_streams_rx) = mpsc::unbounded_channel();
    let (b_streams_tx, a_streams_rx) = mpsc::unbounded_channel();
    let (a_dgram_tx, b_dgram_rx) = mpsc::unbounded_channel();
    let (b_dgram_tx, a_dgram_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let a = MemoryConnection {
        streams_out: a_streams_tx,
        streams_in: AsyncMutex::new(a_streams_rx),
        datagrams_out: a_dgram_tx,
        datagrams_in: AsyncMutex::new(a_dgram_rx),
        closed: closed.clone(),
    };
    let b = MemoryConnection {
        streams_out: b_streams_tx,
        streams_in: AsyncMutex::new(b_streams_rx),
        datagrams_out: b_dgram_tx,
        datagrams_in: AsyncMutex::new(b_dgram_rx),
        closed,
    };
    (Arc::new(a), Arc::new(b))
}

#[async_trait]
impl MuxConnection for MemoryConnection {
    async fn open_uni(&self) -> Result<UniSendStream> {
        if self.closed.is_cancelled() {
            return Err(AppError::Transport("connection closed".to_string()));
        }
        let (writer, reader) = tokio::io::duplex(DUPLEX_BUFFER);
        self.streams_out
            .send(Box::new(reader))
            .map_err(|_| AppError::Transport("peer gone".to_string()))?;
        Ok(Box::new(writer))
    }

    async fn accept_uni(&self) -> Result<Option<UniRecvStream>> {
        let mut streams = self.streams_in.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            stream = streams.recv() => Ok(stream),
        }
    }

    fn send_datagram(&self, data: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(AppError::Transport("connection closed".to_string()));
        }
        self.datagrams_out
            .send(data)
            .map_err(|_| AppError::Transport("peer gone".to_string()))
    }

    async fn read_datagram(&self) -> Result<Option<Bytes>> {
        let mut datagrams = self.datagrams_in.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            data = datagrams.recv() => Ok(data),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Pairs the two connects made to the same endpoint
#[derive(Default)]
pub struct MemoryConnector {
    waiting: Mutex<HashMap<String, Arc<dyn MuxConnection>>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MuxConnector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn MuxConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mut waiting = self.waiting.lock();
        if let Some(other) = waiting.remove(endpoint) {
            return Ok(other);
        }
        let (ours, theirs) = mux_pair();
        waiting.insert(endpoint.to_string(), theirs);
        Ok(ours)
    }
}

/// Connector whose handshake never completes
pub struct HangingConnector;

#[async_trait]
impl MuxConnector for HangingConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn MuxConnection>> {
        std::future::pending().await
    }
}

/// Connector that refuses every endpoint
pub struct FailingConnector;

#[async_trait]
impl MuxConnector for FailingConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn MuxConnection>> {
        Err(AppError::Transport(format!("{} unreachable", endpoint)))
    }
}

// ---------------------------------------------------------------------------
// Peer links
// ---------------------------------------------------------------------------

/// Scripted peer link; the test drives its events
#[derive(Default)]
pub struct FakePeer {
    applied: Mutex<Vec<String>>,
    restart_offers: AtomicUsize,
    offers: AtomicUsize,
    controls: Mutex<Vec<[u8; 2]>>,
    chunks: Mutex<Vec<(MediaKind, EncodedChunk)>>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<PeerEvent>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::default()), tx, rx)
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn restart_offers(&self) -> usize {
        self.restart_offers.load(Ordering::SeqCst)
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn controls_sent(&self) -> Vec<[u8; 2]> {
        self.controls.lock().clone()
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakePeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.restart_offers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(format!("v=0 offer ice_restart={}", ice_restart))
    }

    async fn accept_offer(&self, _sdp: &str) -> Result<String> {
        Ok("v=0 answer".to_string())
    }

    async fn apply_answer(&self, _sdp: &str) -> Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.applied.lock().push(candidate.candidate);
        Ok(())
    }

    async fn write_chunk(&self, kind: MediaKind, chunk: &EncodedChunk) -> Result<()> {
        self.chunks.lock().push((kind, chunk.clone()));
        Ok(())
    }

    async fn send_control(&self, data: Bytes) -> Result<()> {
        if data.len() != 2 {
            return Err(AppError::Transport("control message must be 2 bytes".to_string()));
        }
        self.controls.lock().push([data[0], data[1]]);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out fake peers and keeps a driver handle for each
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<(String, Arc<FakePeer>, mpsc::UnboundedSender<PeerEvent>)>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recent peer created for `participant`
    pub fn peer(&self, participant: &str) -> Option<(Arc<FakePeer>, mpsc::UnboundedSender<PeerEvent>)> {
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|(p, _, _)| p == participant)
            .map(|(_, peer, tx)| (peer.clone(), tx.clone()))
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, participant: &str) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<PeerEvent>)> {
        let (peer, tx, rx) = FakePeer::new();
        self.peers.lock().push((participant.to_string(), peer.clone(), tx));
        Ok((peer, rx))
    }
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// Signaling link that records what it sends, optionally attached to a relay
pub struct FakeSignaling {
    sent: Mutex<Vec<SignalingMessage>>,
    connected: AtomicBool,
    inbound: mpsc::UnboundedSender<SignalingEvent>,
    relay: Option<Arc<Relay>>,
}

impl FakeSignaling {
    /// Detached link; the test injects inbound events itself
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SignalingEvent>) {
        Self::with_relay(None)
    }

    fn with_relay(relay: Option<Arc<Relay>>) -> (Arc<Self>, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            inbound,
            relay,
        });
        (link, rx)
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_of_type(&self, message_type: &str) -> Vec<SignalingMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.message_type() == message_type)
            .cloned()
            .collect()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Deliver an event as if it came from the socket
    pub fn inject(&self, event: SignalingEvent) {
        let _ = self.inbound.send(event);
    }
}

impl SignalingLink for FakeSignaling {
    fn send(&self, message: &SignalingMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(AppError::SignalingDisconnected);
        }
        self.sent.lock().push(message.clone());
        if let Some(relay) = &self.relay {
            relay.route(&self.inbound, message);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// In-memory relay with the routing rules of the real one
///
/// `request-transport` is answered with `transport-info` to both sides,
/// carrying one endpoint per participant pair.
#[derive(Default)]
pub struct Relay {
    members: Mutex<HashMap<String, (String, mpsc::UnboundedSender<SignalingEvent>)>>,
}

impl Relay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>) -> (Arc<FakeSignaling>, mpsc::UnboundedReceiver<SignalingEvent>) {
        FakeSignaling::with_relay(Some(self.clone()))
    }

    fn route(&self, from: &mpsc::UnboundedSender<SignalingEvent>, message: &SignalingMessage) {
        let mut members = self.members.lock();
        let deliver = |tx: &mpsc::UnboundedSender<SignalingEvent>, msg: SignalingMessage| {
            let _ = tx.send(SignalingEvent::Message(msg));
        };

        match message {
            SignalingMessage::JoinRoom {
                room_id,
                user_id,
                display_name,
                ..
            } => {
                for (id, (room, tx)) in members.iter() {
                    if room == room_id && id != user_id {
                        deliver(
                            tx,
                            SignalingMessage::UserJoined {
                                user_id: user_id.clone(),
                                display_name: display_name.clone(),
                            },
                        );
                    }
                }
                members.insert(user_id.clone(), (room_id.clone(), from.clone()));
            }
            SignalingMessage::LeaveRoom { room_id, user_id } => {
                members.remove(user_id);
                for (room, tx) in members.values() {
                    if room == room_id {
                        deliver(tx, SignalingMessage::UserLeft { user_id: user_id.clone() });
                    }
                }
            }
            SignalingMessage::RequestTransport {
                user_id,
                target_user_id,
                ..
            } => {
                let mut pair = [user_id.as_str(), target_user_id.as_str()];
                pair.sort();
                let endpoint = format!("mem://{}/{}", pair[0], pair[1]);
                if let Some((_, tx)) = members.get(target_user_id) {
                    deliver(
                        tx,
                        SignalingMessage::TransportInfo {
                            user_id: user_id.clone(),
                            transport_endpoint: endpoint.clone(),
                        },
                    );
                }
                deliver(
                    from,
                    SignalingMessage::TransportInfo {
                        user_id: target_user_id.clone(),
                        transport_endpoint: endpoint,
                    },
                );
            }
            other => {
                if let Some(target) = other.target_id() {
                    if let Some((_, tx)) = members.get(target) {
                        deliver(tx, other.clone());
                    }
                }
            }
        }
    }
}
