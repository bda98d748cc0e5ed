//! webrtc-rs backed peer link
//!
//! One H264 and one Opus sample track go out; inbound RTP is reassembled
//! into whole chunks with a `SampleBuilder`. Control signals use a
//! pre-negotiated data channel (`control`, id 0) that is unordered with no
//! retransmits, so both sides open it without an extra round trip.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::fallback::{IceState, PeerEvent, PeerFactory, PeerLink};
use crate::config::{AudioCodecConfig, IceConfig, VideoCodecConfig};
use crate::error::{AppError, Result};
use crate::protocol::{EncodedChunk, MediaKind};
use crate::signaling::IceCandidate;

const CONTROL_CHANNEL: &str = "control";
const CONTROL_CHANNEL_ID: u16 = 0;
/// Opus frame length used by the audio encoder
const AUDIO_FRAME: Duration = Duration::from_millis(20);
/// Packets a sample may lag before the builder gives up on it
const MAX_LATE_PACKETS: u16 = 64;

/// Builds webrtc-rs peer connections from the ICE configuration
pub struct RtcPeerFactory {
    ice: IceConfig,
    video_frame: Duration,
    audio_channels: u16,
}

impl RtcPeerFactory {
    pub fn new(ice: IceConfig, video: &VideoCodecConfig, audio: &AudioCodecConfig) -> Self {
        Self {
            ice,
            video_frame: Duration::from_micros(1_000_000 / video.fps.max(1) as u64),
            audio_channels: audio.channels as u16,
        }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers: Vec<RTCIceServer> = self
            .ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        servers.extend(self.ice.turn_servers.iter().map(|turn| RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }));
        servers
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, participant: &str) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<PeerEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| AppError::WebRtcError(format!("Failed to create peer connection: {}", e)))?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            format!("roomlink-{}", participant),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: self.audio_channels,
                ..Default::default()
            },
            "audio".to_owned(),
            format!("roomlink-{}", participant),
        ));
        pc.add_track(video_track.clone())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;
        pc.add_track(audio_track.clone())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add audio track: {}", e)))?;

        let control = pc
            .create_data_channel(
                CONTROL_CHANNEL,
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    negotiated: Some(CONTROL_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create control channel: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        install_handlers(&pc, &control, participant, tx);

        info!("Peer connection created for {}", participant);
        let peer = RtcPeer {
            participant: participant.to_string(),
            pc,
            video_track,
            audio_track,
            control,
            video_frame: self.video_frame,
        };
        Ok((Arc::new(peer), rx))
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    control: &Arc<RTCDataChannel>,
    participant: &str,
    tx: mpsc::UnboundedSender<PeerEvent>,
) {
    let events = tx.clone();
    let id = participant.to_string();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let mapped = match state {
            RTCIceConnectionState::New => Some(IceState::New),
            RTCIceConnectionState::Checking => Some(IceState::Checking),
            RTCIceConnectionState::Connected => Some(IceState::Connected),
            RTCIceConnectionState::Completed => Some(IceState::Completed),
            RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
            RTCIceConnectionState::Failed => Some(IceState::Failed),
            RTCIceConnectionState::Closed => Some(IceState::Closed),
            _ => None,
        };
        if let Some(state) = mapped {
            debug!("Peer {} ICE connection state: {}", id, state);
            let _ = events.send(PeerEvent::IceState(state));
        }
        Box::pin(async {})
    }));

    let events = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    trace!("Local ICE candidate: {}", init.candidate);
                    let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => debug!("Failed to serialize ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let events = tx.clone();
    let id = participant.to_string();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let events = events.clone();
        let id = id.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Video => MediaKind::Video,
                RTPCodecType::Audio => MediaKind::Audio,
                _ => return,
            };
            info!("Remote {} track from {}: {}", kind, id, track.codec().capability.mime_type);
            tokio::spawn(read_track(track, kind, id, events));
        })
    }));

    let events = tx;
    control.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = events.send(PeerEvent::ControlData(msg.data));
        Box::pin(async {})
    }));
}

/// Reassemble samples from a remote track until it ends
async fn read_track(track: Arc<TrackRemote>, kind: MediaKind, participant: String, events: mpsc::UnboundedSender<PeerEvent>) {
    let clock_rate = track.codec().capability.clock_rate.max(1);
    match kind {
        MediaKind::Video => {
            let builder = SampleBuilder::new(MAX_LATE_PACKETS, rtp::codecs::h264::H264Packet::default(), clock_rate);
            pump_samples(track, builder, kind, clock_rate, &participant, &events).await;
        }
        MediaKind::Audio => {
            let builder = SampleBuilder::new(MAX_LATE_PACKETS, rtp::codecs::opus::OpusPacket, clock_rate);
            pump_samples(track, builder, kind, clock_rate, &participant, &events).await;
        }
    }
    debug!("Remote {} track from {} ended", kind, participant);
}

async fn pump_samples<T>(
    track: Arc<TrackRemote>,
    mut builder: SampleBuilder<T>,
    kind: MediaKind,
    clock_rate: u32,
    participant: &str,
    events: &mpsc::UnboundedSender<PeerEvent>,
) where
    T: rtp::packetizer::Depacketizer,
{
    let mut first_ts: Option<u32> = None;
    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                debug!("RTP read from {} stopped: {}", participant, e);
                break;
            }
        };
        builder.push(packet);

        while let Some(sample) = builder.pop() {
            let base = *first_ts.get_or_insert(sample.packet_timestamp);
            let ticks = sample.packet_timestamp.wrapping_sub(base) as u64;
            let timestamp_micros = ticks * 1_000_000 / clock_rate as u64;
            let chunk = match kind {
                MediaKind::Video if h264_has_idr(&sample.data) => EncodedChunk::key(timestamp_micros, sample.data),
                MediaKind::Video => EncodedChunk::delta(timestamp_micros, sample.data),
                MediaKind::Audio => EncodedChunk::key(timestamp_micros, sample.data),
            };
            if events.send(PeerEvent::RemoteChunk { kind, chunk }).is_err() {
                return;
            }
        }
    }
}

/// Whether an Annex B access unit carries an IDR slice or parameter sets
fn h264_has_idr(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        let start = if data[i..].starts_with(&[0, 0, 1]) {
            3
        } else if data[i..].starts_with(&[0, 0, 0, 1]) {
            4
        } else {
            i += 1;
            continue;
        };
        let Some(&header) = data.get(i + start) else {
            break;
        };
        let nal_type = header & 0x1F;
        if nal_type == 5 || nal_type == 7 {
            return true;
        }
        i += start;
    }
    false
}

struct RtcPeer {
    participant: String,
    pc: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    control: Arc<RTCDataChannel>,
    video_frame: Duration,
}

#[async_trait]
impl PeerLink for RtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP offer: {}", e)))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn write_chunk(&self, kind: MediaKind, chunk: &EncodedChunk) -> Result<()> {
        let (track, duration) = match kind {
            MediaKind::Video => (&self.video_track, self.video_frame),
            MediaKind::Audio => (&self.audio_track, AUDIO_FRAME),
        };
        let sample = Sample {
            data: chunk.payload.clone(),
            duration,
            ..Default::default()
        };
        track
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::WebRtcError(format!("{} write_sample failed: {}", kind, e)))
    }

    async fn send_control(&self, data: Bytes) -> Result<()> {
        self.control
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| AppError::Transport(format!("control channel send failed: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.control.close().await {
            warn!("Failed to close control channel for {}: {}", self.participant, e);
        }
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}
