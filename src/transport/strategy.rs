//! Transport strategy selection

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::CapabilityOverrides;

/// Transport used for every session of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStrategy {
    /// QUIC uni streams for media, datagrams for control
    FastPath,
    /// WebRTC peer connection
    Fallback,
    /// Neither transport is usable; no sessions are created
    Unsupported,
}

impl fmt::Display for TransportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStrategy::FastPath => write!(f, "fast_path"),
            TransportStrategy::Fallback => write!(f, "fallback"),
            TransportStrategy::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Capabilities of the running platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    /// Multiplexed stream/datagram transport
    pub fast_transport: bool,
    /// Encoders and decoders usable from the pipeline
    pub hardware_codec: bool,
    /// Raw frame access on local tracks
    pub raw_track_access: bool,
    /// Peer-to-peer media transport
    pub peer_transport: bool,
}

impl PlatformCapabilities {
    /// Capabilities of this build, with configured overrides applied
    ///
    /// QUIC, WebRTC and the software codecs are all compiled in, so every
    /// flag starts out true.
    pub fn detect(overrides: &CapabilityOverrides) -> Self {
        Self {
            fast_transport: overrides.fast_transport.unwrap_or(true),
            hardware_codec: overrides.hardware_codec.unwrap_or(true),
            raw_track_access: overrides.raw_track_access.unwrap_or(true),
            peer_transport: overrides.peer_transport.unwrap_or(true),
        }
    }
}

/// Pick the transport strategy for a set of capabilities
///
/// The fast path needs all three of fast transport, codec access and raw
/// track access; otherwise the peer transport is used if present.
pub fn determine_strategy(caps: &PlatformCapabilities) -> TransportStrategy {
    if caps.fast_transport && caps.hardware_codec && caps.raw_track_access {
        TransportStrategy::FastPath
    } else if caps.peer_transport {
        TransportStrategy::Fallback
    } else {
        TransportStrategy::Unsupported
    }
}
