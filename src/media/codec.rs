//! Codec traits and raw frame types

use bytes::Bytes;

use crate::config::{AudioCodecConfig, VideoCodecConfig};
use crate::error::Result;
use crate::protocol::{EncodedChunk, MediaKind};

/// Raw I420 video frame from the local capture source
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub width: u32,
    pub height: u32,
    /// Planar Y, U, V (4:2:0)
    pub i420: Bytes,
    pub timestamp_micros: u64,
}

impl RawVideoFrame {
    pub fn expected_len(width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        w * h + 2 * ((w / 2) * (h / 2))
    }
}

/// Raw interleaved S16 audio frame
#[derive(Debug, Clone)]
pub struct RawAudioFrame {
    pub samples: Vec<i16>,
    pub timestamp_micros: u64,
}

/// Raw local media, either kind
#[derive(Debug, Clone)]
pub enum RawFrame {
    Video(RawVideoFrame),
    Audio(RawAudioFrame),
}

impl RawFrame {
    pub fn kind(&self) -> MediaKind {
        match self {
            RawFrame::Video(_) => MediaKind::Video,
            RawFrame::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn timestamp_micros(&self) -> u64 {
        match self {
            RawFrame::Video(f) => f.timestamp_micros,
            RawFrame::Audio(f) => f.timestamp_micros,
        }
    }
}

/// Decoded remote video, packed RGB24
#[derive(Debug, Clone)]
pub struct DecodedVideoFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Bytes,
    pub timestamp_micros: u64,
}

/// Decoded remote audio, interleaved S16
#[derive(Debug, Clone)]
pub struct DecodedAudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u8,
    pub timestamp_micros: u64,
}

/// Video encoder
pub trait VideoEncoder: Send {
    /// Encode one frame
    ///
    /// `force_keyframe` makes the output an IDR frame. Returns `None` when
    /// the encoder skipped the frame.
    fn encode(&mut self, frame: &RawVideoFrame, force_keyframe: bool) -> Result<Option<EncodedChunk>>;

    fn name(&self) -> &str;
}

/// Video decoder
pub trait VideoDecoder: Send {
    /// Decode one chunk; `None` while the decoder is still buffering
    fn decode(&mut self, chunk: &EncodedChunk) -> Result<Option<DecodedVideoFrame>>;
}

/// Audio encoder
pub trait AudioEncoder: Send {
    fn encode(&mut self, frame: &RawAudioFrame) -> Result<EncodedChunk>;

    fn name(&self) -> &str;
}

/// Audio decoder
pub trait AudioDecoder: Send {
    fn decode(&mut self, chunk: &EncodedChunk) -> Result<DecodedAudioFrame>;
}

/// Creates codec instances
///
/// Every constructor failure is reported as `CodecConfiguration` for the
/// media kind involved.
pub trait CodecFactory: Send + Sync {
    fn video_encoder(&self, config: &VideoCodecConfig) -> Result<Box<dyn VideoEncoder>>;
    fn video_decoder(&self, config: &VideoCodecConfig) -> Result<Box<dyn VideoDecoder>>;
    fn audio_encoder(&self, config: &AudioCodecConfig) -> Result<Box<dyn AudioEncoder>>;
    fn audio_decoder(&self, config: &AudioCodecConfig) -> Result<Box<dyn AudioDecoder>>;
}
