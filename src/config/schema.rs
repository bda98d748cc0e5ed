use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling relay connection
    pub signaling: SignalingConfig,
    /// ICE servers and negotiation timers (fallback path)
    pub ice: IceConfig,
    /// QUIC transport settings (fast path)
    pub fast_path: FastPathConfig,
    /// Video encoder target
    pub video: VideoCodecConfig,
    /// Audio encoder target
    pub audio: AudioCodecConfig,
    /// Platform capability overrides
    pub capabilities: CapabilityOverrides,
    /// Local participant defaults
    pub room: RoomConfig,
}

impl AppConfig {
    /// Check the configuration for values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        let url = self.signaling.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "signaling.url must be a ws:// or wss:// URL, got '{}'",
                self.signaling.url
            )));
        }
        if self.signaling.reconnect_delay_ms == 0 {
            return Err(AppError::Config("signaling.reconnect_delay_ms must be > 0".into()));
        }
        if self.ice.checking_timeout_ms == 0 {
            return Err(AppError::Config("ice.checking_timeout_ms must be > 0".into()));
        }
        if self.fast_path.max_chunk_bytes == 0 {
            return Err(AppError::Config("fast_path.max_chunk_bytes must be > 0".into()));
        }
        if self.video.width == 0 || self.video.height == 0 {
            return Err(AppError::Config("video resolution must be non-zero".into()));
        }
        if self.video.width % 2 != 0 || self.video.height % 2 != 0 {
            return Err(AppError::Config(format!(
                "video resolution must be even for I420, got {}x{}",
                self.video.width, self.video.height
            )));
        }
        if self.video.fps == 0 {
            return Err(AppError::Config("video.fps must be > 0".into()));
        }
        if ![8000, 12000, 16000, 24000, 48000].contains(&self.audio.sample_rate) {
            return Err(AppError::Config(format!(
                "audio.sample_rate {} is not supported by Opus",
                self.audio.sample_rate
            )));
        }
        if self.audio.channels != 1 && self.audio.channels != 2 {
            return Err(AppError::Config(format!(
                "audio.channels must be 1 or 2, got {}",
                self.audio.channels
            )));
        }
        Ok(())
    }
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the relay
    pub url: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Timeout for a single connect attempt
    pub connect_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            reconnect_delay_ms: 5000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl SignalingConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// TURN server entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// ICE configuration for the fallback path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// How long ICE may stay in `checking` before a restart
    pub checking_timeout_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: vec![],
            checking_timeout_ms: 15_000,
        }
    }
}

impl IceConfig {
    pub fn checking_timeout(&self) -> Duration {
        Duration::from_millis(self.checking_timeout_ms)
    }
}

/// QUIC transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPathConfig {
    /// Handshake timeout
    pub connect_timeout_ms: u64,
    /// Upper bound on a single inbound stream
    pub max_chunk_bytes: usize,
    /// PEM file with CA certificates trusted for the relay
    pub ca_cert: Option<String>,
    /// Skip server certificate verification (self-signed relays)
    pub accept_invalid_certs: bool,
    /// ALPN protocol ids offered in the handshake
    pub alpn: Vec<String>,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            max_chunk_bytes: 4 * 1024 * 1024,
            ca_cert: None,
            accept_invalid_certs: false,
            alpn: vec!["roomlink/1".to_string()],
        }
    }
}

impl FastPathConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Video codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
}

/// Video encoder target parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoCodecConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u32,
}

impl Default for VideoCodecConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_bps: 2_000_000,
        }
    }
}

/// Audio codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Opus,
}

/// Audio encoder target parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioCodecConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u8,
    pub bitrate_bps: u32,
}

impl Default for AudioCodecConfig {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Opus,
            sample_rate: 48000,
            channels: 2,
            bitrate_bps: 128_000,
        }
    }
}

/// Overrides for detected platform capabilities
///
/// `None` keeps the detected value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityOverrides {
    pub fast_transport: Option<bool>,
    pub hardware_codec: Option<bool>,
    pub raw_track_access: Option<bool>,
    pub peer_transport: Option<bool>,
}

/// Local participant settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Name announced to other participants
    pub display_name: String,
    /// Room joined when none is given on the command line
    pub default_room: Option<String>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            display_name: "Guest".to_string(),
            default_room: None,
        }
    }
}
